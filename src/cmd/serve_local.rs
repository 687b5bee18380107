//! The `serve-local` subcommand.

use clap::Args;
use serde_json::json;

use crate::{
    async_utils::cancel::CancelSignal,
    config::Settings,
    jobs::JobOrchestrator,
    prelude::*,
    resources::pool::ServerRequest,
    ui::Ui,
};

use super::print_json_pretty;

#[derive(Debug, Args)]
pub struct ServeLocalOpts {
    /// The model to serve, like `zai-org/GLM-OCR`.
    pub model: String,

    #[clap(long, default_value_t = 1)]
    pub tensor_parallel_size: u32,

    /// Defaults to `--vllm-data-parallel-size`.
    #[clap(long)]
    pub data_parallel_size: Option<u32>,

    /// Defaults to `--vllm-gpu-memory-utilization`.
    #[clap(long)]
    pub gpu_memory_utilization: Option<f64>,

    /// Defaults to `--vllm-max-model-len`.
    #[clap(long)]
    pub max_model_len: Option<u32>,

    /// Extra argument for `vllm serve`. May be repeated.
    #[clap(long = "extra-arg", allow_hyphen_values = true)]
    pub extra_args: Vec<String>,
}

/// Start one pooled local server and keep it up until Ctrl-C.
#[instrument(level = "debug", skip_all, fields(model = %opts.model))]
pub async fn cmd_serve_local(ui: Ui, settings: &Settings, opts: &ServeLocalOpts) -> Result<()> {
    let request = ServerRequest {
        model: opts.model.clone(),
        tensor_parallel_size: opts.tensor_parallel_size.max(1),
        data_parallel_size: opts
            .data_parallel_size
            .unwrap_or(settings.vllm_data_parallel_size)
            .max(1),
        gpu_memory_utilization: opts
            .gpu_memory_utilization
            .unwrap_or(settings.vllm_gpu_memory_utilization),
        max_model_len: opts.max_model_len.or(settings.vllm_max_model_len),
        extra_args: opts.extra_args.clone(),
    };

    let orchestrator = JobOrchestrator::from_settings(settings.clone()).await?;
    let pool = orchestrator.pool().clone();
    let cancel = CancelSignal::new();
    let spinner = ui.new_spinner(
        &format!("Starting {}", request.model),
        &format!("Started {}", request.model),
    );
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let acquire = pool.acquire(&request, &cancel);
    tokio::pin!(acquire);
    let mut interrupted = false;
    let handle = tokio::select! {
        handle = &mut acquire => handle,
        result = &mut ctrl_c => {
            result.context("failed to listen for Ctrl-C")?;
            warn!("Interrupted; stopping server startup");
            cancel.cancel();
            interrupted = true;
            acquire.await
        }
    };
    spinner.finish();
    let handle = match handle {
        Ok(handle) => handle,
        Err(err) => {
            pool.shutdown_all().await;
            return Err(err);
        }
    };

    print_json_pretty(&json!({
        "model": handle.model,
        "base_url": handle.base_url,
        "port": handle.port,
        "gpu_ids": handle.gpu_ids,
        "log_path": handle.log_path,
    }))?;
    if !interrupted {
        info!(base_url = %handle.base_url, "Serving until Ctrl-C");
        ctrl_c.await.context("failed to listen for Ctrl-C")?;
    }

    pool.release(&handle).await;
    orchestrator.shutdown().await;
    Ok(())
}
