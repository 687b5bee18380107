//! The `outputs` subcommand.

use clap::Args;

use crate::{config::Settings, jobs::JobOrchestrator, prelude::*};

use super::{print_json_line, print_json_pretty};

#[derive(Debug, Args)]
pub struct OutputsOpts {
    /// The job to browse.
    pub job_id: String,

    /// Print one page, by its index in the listing, instead of listing them.
    #[clap(long)]
    pub page: Option<usize>,
}

/// List a job's output pages as JSONL, or print one page.
#[instrument(level = "debug", skip_all, fields(job_id = %opts.job_id))]
pub async fn cmd_outputs(settings: &Settings, opts: &OutputsOpts) -> Result<()> {
    let orchestrator = JobOrchestrator::from_settings(settings.clone()).await?;
    match opts.page {
        Some(index) => print_json_pretty(&orchestrator.get_output_page(&opts.job_id, index)?),
        None => {
            for page in orchestrator.list_output_pages(&opts.job_id)? {
                print_json_line(&page)?;
            }
            Ok(())
        }
    }
}
