//! The `gpus` subcommand.

use serde_json::json;

use crate::{config::Settings, jobs::JobOrchestrator, prelude::*};

use super::print_json_pretty;

/// Print GPU telemetry as JSON.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_gpus(settings: &Settings) -> Result<()> {
    let orchestrator = JobOrchestrator::from_settings(settings.clone()).await?;
    let telemetry = orchestrator.gpu_telemetry().await;
    print_json_pretty(&json!({
        "schedulable_gpus": orchestrator.pool().broker().total_gpus(),
        "gpu_count": telemetry.gpu_count,
        "gpus": telemetry.gpus,
    }))
}
