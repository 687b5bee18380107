//! The `inputs` subcommand.

use clap::Args;

use crate::{config::Settings, documents::discover_inputs, prelude::*};

use super::print_json_line;

#[derive(Debug, Args)]
pub struct InputsOpts {
    /// Stop after this many PDFs and folders.
    #[clap(long, default_value_t = 500)]
    pub max_items: usize,
}

/// List PDFs and folders under the inputs directory, one JSON object per line.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_inputs(settings: &Settings, opts: &InputsOpts) -> Result<()> {
    if !settings.inputs_dir.is_dir() {
        bail!("Inputs directory not found: {:?}", settings.inputs_dir);
    }
    for candidate in discover_inputs(&settings.inputs_dir, opts.max_items)? {
        print_json_line(&candidate)?;
    }
    Ok(())
}
