//! The `providers` subcommand.

use serde_json::json;

use crate::{
    config::Settings,
    jobs::JobOrchestrator,
    prelude::*,
    providers::{DEFAULT_LOCAL_MODELS, PROVIDER_PRESETS},
};

use super::print_json_line;

/// List provider presets, and whether we can find a key for each.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_providers(settings: &Settings) -> Result<()> {
    let orchestrator = JobOrchestrator::from_settings(settings.clone()).await?;
    for (preset, status) in PROVIDER_PRESETS
        .iter()
        .zip(orchestrator.provider_key_status())
    {
        print_json_line(&json!({
            "provider": preset.key,
            "label": preset.label,
            "base_url": preset.base_url,
            "api_key_env": status.api_key_env,
            "api_key_present": status.present,
            "notes": preset.notes,
            "example_models": preset.example_models,
        }))?;
    }
    for model in DEFAULT_LOCAL_MODELS {
        print_json_line(&json!({"local_model": model}))?;
    }
    Ok(())
}
