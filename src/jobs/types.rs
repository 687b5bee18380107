//! Job requests, and the progress records we hand back to callers.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::{
    jobs::metrics::{Statistics, TokenUsage},
    prelude::*,
    providers,
};

/// The prompt we use when a request doesn't supply one.
pub const DEFAULT_OCR_PROMPT: &str = "You are an OCR assistant. Extract all visible text from \
    this PDF page and return clean markdown. Preserve headings, lists, and tables when \
    possible. Do not add commentary.";

/// Where a model runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    /// A remote OpenAI-compatible API.
    Api,
    /// A `vllm serve` process on this machine.
    Local,
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelMode::Api => write!(f, "api"),
            ModelMode::Local => write!(f, "local"),
        }
    }
}

/// Status of a job or a model run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    /// Waiting for GPUs or a server slot.
    WaitingResources,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Is this job or run still in progress?
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::WaitingResources | RunStatus::Running
        )
    }

    /// Terminal states never change once reached.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Queued => "queued",
            RunStatus::WaitingResources => "waiting_resources",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

fn default_tensor_parallel_size() -> u32 {
    1
}

/// One model to compare.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelSpec {
    /// Model ID, like `org/model-name`.
    pub model: String,

    pub mode: ModelMode,

    /// Provider preset key, for API mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// OpenAI-compatible base URL, for API mode. Overrides the preset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Name of the variable holding the API key. Overrides the preset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// An inline API key. Never written to disk.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_parallel_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_utilization: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_model_len: Option<u32>,

    /// Maximum number of in-flight OCR requests for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<usize>,

    /// Extra arguments for `vllm serve`.
    #[serde(default)]
    pub extra_vllm_args: Vec<String>,
}

impl ModelSpec {
    /// An API model with everything else defaulted.
    pub fn api(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            mode: ModelMode::Api,
            provider: None,
            base_url: Some(base_url.into()),
            api_key_env: None,
            api_key: None,
            tensor_parallel_size: 1,
            data_parallel_size: None,
            gpu_memory_utilization: None,
            max_model_len: None,
            max_concurrent_requests: None,
            extra_vllm_args: vec![],
        }
    }

    /// A local model with everything else defaulted.
    pub fn local(model: impl Into<String>) -> Self {
        Self {
            mode: ModelMode::Local,
            base_url: None,
            ..Self::api(model, "")
        }
    }

    /// Check ranges and tidy up `extra_vllm_args`.
    fn validate(&mut self) -> Result<()> {
        self.model = self.model.trim().to_owned();
        if self.model.is_empty() {
            bail!("Model name must not be empty");
        }
        if self.tensor_parallel_size < 1 {
            bail!("{}: tensor_parallel_size must be at least 1", self.model);
        }
        if self.data_parallel_size == Some(0) {
            bail!("{}: data_parallel_size must be at least 1", self.model);
        }
        if let Some(fraction) = self.gpu_memory_utilization {
            if !(fraction > 0.0 && fraction <= 1.0) {
                bail!(
                    "{}: gpu_memory_utilization must be in (0, 1], got {}",
                    self.model,
                    fraction
                );
            }
        }
        if self.max_model_len == Some(0) {
            bail!("{}: max_model_len must be at least 1", self.model);
        }
        if self.max_concurrent_requests == Some(0) {
            bail!("{}: max_concurrent_requests must be at least 1", self.model);
        }
        if self.mode == ModelMode::Api {
            let has_base_url = self
                .base_url
                .as_deref()
                .is_some_and(|url| !url.trim().is_empty());
            let has_preset = self.provider.as_deref().and_then(providers::preset).is_some();
            if !has_base_url && !has_preset {
                bail!(
                    "API model {} requires base_url or a known provider",
                    self.model
                );
            }
        }
        self.extra_vllm_args = self
            .extra_vllm_args
            .iter()
            .map(|arg| arg.trim())
            .filter(|arg| !arg.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(())
    }
}

fn default_prompt() -> String {
    DEFAULT_OCR_PROMPT.to_owned()
}

fn default_max_tokens() -> u32 {
    2048
}

/// A request to OCR some PDFs with one or more models.
///
/// Usually loaded from a TOML or JSON file:
///
/// ```toml
/// title = "Invoices"
/// input_path = "invoices/"
///
/// [[models]]
/// model = "gpt-5-mini"
/// mode = "api"
/// provider = "openai"
///
/// [[models]]
/// model = "zai-org/GLM-OCR"
/// mode = "local"
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LaunchRequest {
    /// A stable job ID. Generated from the title if missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// A PDF file or a directory of PDFs.
    pub input_path: PathBuf,

    #[serde(default)]
    pub models: Vec<ModelSpec>,

    #[serde(default = "default_prompt")]
    pub prompt: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,
}

impl LaunchRequest {
    /// A request with default prompt and generation parameters.
    pub fn new(input_path: impl Into<PathBuf>, models: Vec<ModelSpec>) -> Self {
        Self {
            job_id: None,
            title: None,
            input_path: input_path.into(),
            models,
            prompt: default_prompt(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
        }
    }

    /// Check the request before we create any state for it.
    pub fn validate(&mut self) -> Result<()> {
        if self.models.is_empty() {
            bail!("At least one model is required");
        }
        for spec in &mut self.models {
            spec.validate()?;
        }
        if self.max_tokens < 1 {
            bail!("max_tokens must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("temperature must be in [0, 2], got {}", self.temperature);
        }
        if let Some(job_id) = &self.job_id {
            let job_id = job_id.trim();
            let valid = job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
            if !valid || job_id == "." || job_id == ".." {
                bail!("Invalid job id {:?}", job_id);
            }
        }
        Ok(())
    }
}

/// The local server a run is talking to.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LocalEndpoint {
    pub base_url: String,
    pub port: u16,
    pub gpu_ids: Vec<usize>,
    pub log_path: PathBuf,
}

/// Progress of one model over all the job's documents.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelRunProgress {
    /// `<model-slug>:<run-number>`.
    pub run_id: String,
    pub model: String,
    pub mode: ModelMode,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// The first error we saw, if any.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub total_pages: u64,
    #[serde(default)]
    pub completed_pages: u64,
    #[serde(default)]
    pub current_pdf: Option<PathBuf>,
    #[serde(default)]
    pub current_page: Option<u32>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub source_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<LocalEndpoint>,
    #[serde(default)]
    pub runtime_seconds: f64,
    #[serde(default)]
    pub eta_seconds: Option<f64>,
    #[serde(default)]
    pub statistics: Statistics,
}

impl ModelRunProgress {
    pub fn progress_ratio(&self) -> f64 {
        ratio(self.completed_pages, self.total_pages)
    }

    pub fn runtime_seconds_at(&self, now: DateTime<Utc>) -> f64 {
        runtime_seconds(self.started_at, self.ended_at, now)
    }

    pub fn eta_seconds_at(&self, now: DateTime<Utc>) -> Option<f64> {
        eta_seconds(
            self.completed_pages,
            self.total_pages,
            self.started_at.map(|_| self.runtime_seconds_at(now)),
        )
    }
}

/// Progress of a whole job.
#[derive(Clone, Debug, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub title: String,
    pub input_path: PathBuf,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub prompt: String,
    pub total_pages_all_models: u64,
    pub completed_pages_all_models: u64,
    pub models: Vec<ModelRunProgress>,
    pub metadata_path: PathBuf,
    pub runtime_seconds: f64,
    pub eta_seconds: Option<f64>,
    pub statistics: Statistics,
}

impl JobProgress {
    pub fn progress_ratio(&self) -> f64 {
        ratio(self.completed_pages_all_models, self.total_pages_all_models)
    }

    pub fn runtime_seconds_at(&self, now: DateTime<Utc>) -> f64 {
        runtime_seconds(self.started_at, self.ended_at, now)
    }

    pub fn eta_seconds_at(&self, now: DateTime<Utc>) -> Option<f64> {
        eta_seconds(
            self.completed_pages_all_models,
            self.total_pages_all_models,
            self.started_at.map(|_| self.runtime_seconds_at(now)),
        )
    }

    pub(crate) fn recompute_progress(&mut self) {
        self.completed_pages_all_models =
            self.models.iter().map(|run| run.completed_pages).sum();
    }
}

/// Outcome of a single page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Completed,
    Failed,
}

/// What happened to one page. Stored in `pdf_metadata.json`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PageRecord {
    pub page_number: u32,
    pub status: PageStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub processing_time_seconds: f64,
    /// Time spent in the successful request. `None` if every attempt failed.
    pub ocr_request_time_seconds: Option<f64>,
    pub attempts: u32,
    pub finish_reason: Option<String>,
    pub provider_model: Option<String>,
    pub token_usage: TokenUsage,
    /// The provider's raw `usage` object.
    pub usage: Option<Value>,
    pub output_markdown_file: String,
    pub output_markdown_path: PathBuf,
    pub output_bytes: u64,
    pub error: Option<String>,
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

fn runtime_seconds(
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let Some(started_at) = started_at else {
        return 0.0;
    };
    let end = ended_at.unwrap_or(now);
    ((end - started_at).num_milliseconds() as f64 / 1000.0).max(0.0)
}

/// `remaining / rate`, where `rate` is pages per second so far.
fn eta_seconds(completed: u64, total: u64, runtime: Option<f64>) -> Option<f64> {
    let runtime = runtime?;
    if completed == 0 {
        return None;
    }
    let rate = completed as f64 / runtime.max(1e-6);
    let remaining = total.saturating_sub(completed);
    Some(remaining as f64 / rate)
}
