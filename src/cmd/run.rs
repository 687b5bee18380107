//! The `run` subcommand.

use std::time::Duration;

use clap::Args;

use crate::{
    async_utils::io::read_json_or_toml,
    config::Settings,
    jobs::{
        JobOrchestrator,
        types::{JobProgress, LaunchRequest, RunStatus},
    },
    prelude::*,
    ui::Ui,
};

use super::print_json_pretty;

/// How often we refresh the progress bars.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Args)]
pub struct RunOpts {
    /// A TOML or JSON file describing the job and its models.
    pub request_path: PathBuf,

    /// Use this job ID instead of the one in the request file. Reusing the ID
    /// of an earlier job adds new runs next to the old ones.
    #[clap(long)]
    pub job_id: Option<String>,

    /// Use this PDF or directory instead of the request's `input_path`.
    #[clap(long)]
    pub input: Option<PathBuf>,

    /// Use this title instead of the one in the request file.
    #[clap(long)]
    pub title: Option<String>,
}

/// Launch a job, follow it until it finishes, and print its final state.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, settings: &Settings, opts: &RunOpts) -> Result<()> {
    let mut request = read_json_or_toml::<LaunchRequest>(&opts.request_path).await?;
    if let Some(job_id) = &opts.job_id {
        request.job_id = Some(job_id.clone());
    }
    if let Some(input) = &opts.input {
        request.input_path = input.clone();
    }
    if let Some(title) = &opts.title {
        request.title = Some(title.clone());
    }

    let orchestrator = JobOrchestrator::from_settings(settings.clone()).await?;
    let launched = orchestrator.launch(request).await?;
    let job_id = launched.job_id.clone();
    info!(job_id = %job_id, metadata = %launched.metadata_path.display(), "Job launched");

    let mut bars = ui.job_progress();
    bars.update(&launched);
    let result = follow_job(&orchestrator, &job_id, |job| bars.update(job)).await;
    bars.finish();
    ui.hide_progress_bars();
    orchestrator.shutdown().await;
    let job = result?;

    print_json_pretty(&job)?;
    match job.status {
        RunStatus::Failed => bail!("Job {} failed", job_id),
        RunStatus::Canceled => bail!("Job {} was canceled", job_id),
        _ => Ok(()),
    }
}

/// Poll the job until its task exits. The first Ctrl-C cancels the job, and
/// we keep waiting for in-flight pages to finish.
async fn follow_job<F>(
    orchestrator: &JobOrchestrator,
    job_id: &str,
    mut on_update: F,
) -> Result<JobProgress>
where
    F: FnMut(&JobProgress),
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(job) = orchestrator.get_job(job_id) {
                    on_update(&job);
                }
                if !orchestrator.is_running(job_id) {
                    break;
                }
            }
            result = &mut ctrl_c, if !interrupted => {
                result.context("failed to listen for Ctrl-C")?;
                warn!(job_id, "Interrupted; canceling job");
                orchestrator.cancel(job_id)?;
                interrupted = true;
            }
        }
    }
    let job = orchestrator
        .wait(job_id)
        .await
        .ok_or_else(|| anyhow!("Job {} disappeared", job_id))?;
    on_update(&job);
    Ok(job)
}
