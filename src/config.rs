//! Runtime settings, read from the command line or `OCR_*` environment
//! variables (which may be set in a `.env` file).

use std::time::Duration;

use clap::Args;

use crate::prelude::*;

/// Settings shared by every subcommand.
#[derive(Args, Clone, Debug)]
pub struct Settings {
    /// Directory containing input PDFs. Relative input paths are also looked
    /// up here.
    #[clap(long, env = "OCR_INPUTS_DIR", default_value = "inputs", global = true)]
    pub inputs_dir: PathBuf,

    /// Directory where job outputs and metadata are written.
    #[clap(long, env = "OCR_OUTPUTS_DIR", default_value = "outputs", global = true)]
    pub outputs_dir: PathBuf,

    /// Directory for internal state, such as local server logs.
    #[clap(long, env = "OCR_STATE_DIR", default_value = ".ocr_state", global = true)]
    pub state_dir: PathBuf,

    /// First port to try when starting local vLLM servers.
    #[clap(long, env = "OCR_VLLM_BASE_PORT", default_value_t = 9000, global = true)]
    pub vllm_base_port: u16,

    /// Default fraction of GPU memory a local server may use.
    #[clap(
        long,
        env = "OCR_VLLM_GPU_MEMORY_UTILIZATION",
        default_value_t = 0.90,
        global = true
    )]
    pub vllm_gpu_memory_utilization: f64,

    /// Default maximum model context length for local servers.
    #[clap(long, env = "OCR_VLLM_MAX_MODEL_LEN", global = true)]
    pub vllm_max_model_len: Option<u32>,

    /// Default data-parallel size for local servers.
    #[clap(
        long,
        env = "OCR_VLLM_DATA_PARALLEL_SIZE",
        default_value_t = 1,
        global = true
    )]
    pub vllm_data_parallel_size: u32,

    /// Default number of in-flight page requests per model run.
    #[clap(
        long,
        env = "OCR_VLLM_MAX_CONCURRENT_REQUESTS",
        default_value_t = 8,
        global = true
    )]
    pub vllm_max_concurrent_requests: usize,

    /// Maximum number of local servers running at once.
    #[clap(
        long,
        env = "OCR_LOCAL_MAX_CONCURRENT_MODELS",
        default_value_t = 8,
        global = true
    )]
    pub local_max_concurrent_models: usize,

    /// Override the detected number of GPUs.
    #[clap(long, env = "OCR_GPU_COUNT", global = true)]
    pub gpu_count: Option<usize>,

    /// DPI used when rendering PDF pages to PNG.
    #[clap(long, env = "OCR_RENDER_DPI", default_value_t = 180, global = true)]
    pub render_dpi: u32,

    /// Timeout, in seconds, for a single OCR request attempt.
    #[clap(long, env = "OCR_REQUEST_TIMEOUT", default_value_t = 300, global = true)]
    pub request_timeout: u64,

    /// Maximum attempts for a single OCR request, including the first.
    #[clap(
        long,
        env = "OCR_REQUEST_MAX_ATTEMPTS",
        default_value_t = 4,
        global = true
    )]
    pub request_max_attempts: u32,

    /// How long, in seconds, to wait for a local server to become ready.
    #[clap(
        long,
        env = "OCR_VLLM_READY_TIMEOUT",
        default_value_t = 900,
        global = true
    )]
    pub vllm_ready_timeout: u64,

    /// Fallback file consulted for API keys missing from the environment.
    #[clap(long, env = "OCR_ENV_FILE", default_value = ".env", global = true)]
    pub env_file: PathBuf,
}

impl Settings {
    /// Settings rooted in `root`, with every other value at its default.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            inputs_dir: root.join("inputs"),
            outputs_dir: root.join("outputs"),
            state_dir: root.join(".ocr_state"),
            env_file: root.join(".env"),
            ..Self::default()
        }
    }

    /// Per-attempt OCR request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Local server readiness deadline.
    pub fn vllm_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.vllm_ready_timeout)
    }

    /// Directory where local server logs go.
    pub fn vllm_log_dir(&self) -> PathBuf {
        self.state_dir.join("vllm_logs")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inputs_dir: PathBuf::from("inputs"),
            outputs_dir: PathBuf::from("outputs"),
            state_dir: PathBuf::from(".ocr_state"),
            vllm_base_port: 9000,
            vllm_gpu_memory_utilization: 0.90,
            vllm_max_model_len: None,
            vllm_data_parallel_size: 1,
            vllm_max_concurrent_requests: 8,
            local_max_concurrent_models: 8,
            gpu_count: None,
            render_dpi: 180,
            request_timeout: 300,
            request_max_attempts: 4,
            vllm_ready_timeout: 900,
            env_file: PathBuf::from(".env"),
        }
    }
}
