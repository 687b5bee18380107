//! OCR jobs: one or more models run over the same set of PDFs.
//!
//! A job owns one [`ModelRunProgress`] per requested model. Each run executes
//! in its own task and reports progress into a shared [`JobTable`]. Every
//! change to a job or run is persisted while holding the table lock, which is
//! never held across an `.await`.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};

use crate::{
    async_utils::{cancel::CancelSignal, io::JsonObject},
    config::Settings,
    documents::{Document, DocumentSource, PopplerDocuments, expand_pdf_inputs, resolve_input_path},
    gpu::{self, GpuTelemetry},
    layout::{OutputLayout, RunPaths, build_job_id, merge_into_file},
    ocr_client::{EndpointAuth, OcrClientFactory, OpenAiCompatibleFactory, RetryPolicy},
    prelude::*,
    providers::{self, CredentialStore, PROVIDER_PRESETS, ProviderKeyStatus},
    resources::{
        broker::ResourceBroker,
        pool::{LocalServerPool, ServerRequest},
        vllm::VllmLauncher,
    },
};

use self::{
    metadata::{aggregate_status, write_job_metadata, write_run_metadata},
    metrics::{MetricsAccumulator, PageTotals, Statistics},
    outputs::{OutputPage, OutputPageSummary},
    types::{JobProgress, LaunchRequest, ModelRunProgress, ModelSpec, RunStatus},
};

pub mod metadata;
pub mod metrics;
pub mod outputs;
mod run;
pub mod types;

/// How often [`JobOrchestrator::wait`] checks on a job.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a job could not be dismissed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DismissError {
    #[error("job not found")]
    NotFound,
    #[error("only completed or canceled jobs can be dismissed")]
    NotFinished,
    #[error("job is still running")]
    StillRunning,
}

/// The collaborators a job needs. Tests swap these for fakes.
pub struct JobServices {
    pub pool: Arc<LocalServerPool>,
    pub documents: Arc<dyn DocumentSource>,
    pub clients: Arc<dyn OcrClientFactory>,
    pub credentials: CredentialStore,
}

impl JobServices {
    /// The real thing: Poppler, vLLM and OpenAI-compatible HTTP.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let total_gpus = gpu::detect_gpu_count(settings.gpu_count).await;
        debug!(total_gpus, "Detected GPUs");
        let broker = Arc::new(ResourceBroker::new(
            total_gpus,
            settings.local_max_concurrent_models,
            settings.vllm_base_port,
        ));
        let launcher = Arc::new(VllmLauncher::new(settings.vllm_ready_timeout()));
        let pool = Arc::new(LocalServerPool::new(
            broker,
            launcher,
            settings.vllm_log_dir(),
        ));
        let clients = OpenAiCompatibleFactory {
            timeout: settings.request_timeout(),
            retry: RetryPolicy {
                max_attempts: settings.request_max_attempts.max(1),
                ..RetryPolicy::default()
            },
        };
        Ok(Self {
            pool,
            documents: Arc::new(PopplerDocuments::new(settings.render_dpi)),
            clients: Arc::new(clients),
            credentials: CredentialStore::new(settings.env_file.clone()),
        })
    }
}

/// Per-run state that never changes after launch.
struct RunContext {
    paths: RunPaths,
    spec: ModelSpec,
}

struct JobEntry {
    job: JobProgress,
    /// Parallel to `job.models`.
    runs: Vec<RunContext>,
    cancel: CancelSignal,
    task: Option<JoinHandle<()>>,
}

impl JobEntry {
    fn task_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// All jobs we know about, plus their live metrics.
#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobEntry>,
    /// Job ids whose directories are being set up by `launch`.
    launching: HashSet<String>,
    metrics: MetricsAccumulator,
}

impl JobTable {
    /// Is `job_id` taken by a job that hasn't finished, or one being launched?
    fn is_active(&self, job_id: &str) -> bool {
        self.launching.contains(job_id)
            || self
                .jobs
                .get(job_id)
                .is_some_and(|entry| entry.job.status.is_active() || entry.task_active())
    }

    fn entry(&self, job_id: &str) -> Result<&JobEntry> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| anyhow!("Unknown job: {}", job_id))
    }

    fn run_totals(&self, job: &JobProgress) -> Vec<PageTotals> {
        job.models
            .iter()
            .map(|run| self.metrics.run_totals(&job.job_id, &run.run_id))
            .collect()
    }

    fn persist_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<()> {
        let entry = self.entry(job_id)?;
        write_job_metadata(
            &entry.job,
            &self.run_totals(&entry.job),
            entry.cancel.is_canceled(),
            now,
        )?;
        Ok(())
    }

    fn persist_run(&self, job_id: &str, index: usize, now: DateTime<Utc>) -> Result<()> {
        let entry = self.entry(job_id)?;
        let run = &entry.job.models[index];
        let totals = self.metrics.run_totals(job_id, &run.run_id);
        write_run_metadata(&entry.runs[index].paths.run_metadata_path(), run, &totals, now)
    }

    /// A copy of the job with runtimes, ETAs and statistics filled in.
    fn snapshot(&self, entry: &JobEntry, now: DateTime<Utc>) -> JobProgress {
        let mut job = entry.job.clone();
        let mut job_totals = PageTotals::default();
        for run in &mut job.models {
            let totals = self.metrics.run_totals(&job.job_id, &run.run_id);
            run.runtime_seconds = run.runtime_seconds_at(now);
            run.eta_seconds = run.eta_seconds_at(now);
            run.statistics = totals.finalize(Some(run.runtime_seconds));
            job_totals += &totals;
        }
        job.runtime_seconds = job.runtime_seconds_at(now);
        job.eta_seconds = job.eta_seconds_at(now);
        job.statistics = job_totals.finalize(Some(job.runtime_seconds));
        job
    }
}

struct Inner {
    settings: Settings,
    layout: OutputLayout,
    services: JobServices,
    state: Mutex<JobTable>,
}

impl Inner {
    /// Update one run and persist the run and its job.
    fn update_run<F>(&self, job_id: &str, index: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut ModelRunProgress, &mut MetricsAccumulator, DateTime<Utc>),
    {
        let now = Utc::now();
        let mut table = self.state.lock().expect("lock poisoned");
        {
            let JobTable { jobs, metrics, .. } = &mut *table;
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| anyhow!("Unknown job: {}", job_id))?;
            let run = entry
                .job
                .models
                .get_mut(index)
                .ok_or_else(|| anyhow!("Unknown run {} in job {}", index, job_id))?;
            f(run, metrics, now);
            entry.job.recompute_progress();
        }
        table.persist_run(job_id, index, now)?;
        table.persist_job(job_id, now)
    }

    /// Move a run to `status`, unless it has already finished.
    fn transition(&self, job_id: &str, index: usize, status: RunStatus) -> Result<()> {
        self.update_run(job_id, index, |run, _, now| {
            if run.status.is_terminal() {
                return;
            }
            debug!(run_id = %run.run_id, from = %run.status, to = %status, "Run status");
            run.status = status;
            if status == RunStatus::Running && run.started_at.is_none() {
                run.started_at = Some(now);
            }
            if status.is_terminal() {
                run.ended_at = Some(now);
            }
        })
    }

    /// Mark a run as failed. The first error message wins.
    fn fail_run(&self, job_id: &str, index: usize, message: String) -> Result<()> {
        self.update_run(job_id, index, |run, _, now| {
            if !run.status.is_terminal() {
                run.status = RunStatus::Failed;
                run.ended_at = Some(now);
            }
            if run.error.is_none() {
                run.error = Some(message);
            }
        })
    }

    fn run_context(&self, job_id: &str, index: usize) -> Result<(ModelSpec, RunPaths)> {
        let table = self.state.lock().expect("lock poisoned");
        let context = table
            .entry(job_id)?
            .runs
            .get(index)
            .ok_or_else(|| anyhow!("Unknown run {} in job {}", index, job_id))?;
        Ok((context.spec.clone(), context.paths.clone()))
    }

    /// What to ask the local server pool for, filling in defaults.
    fn server_request(&self, spec: &ModelSpec) -> ServerRequest {
        ServerRequest {
            model: spec.model.clone(),
            tensor_parallel_size: spec.tensor_parallel_size,
            data_parallel_size: spec
                .data_parallel_size
                .unwrap_or(self.settings.vllm_data_parallel_size),
            gpu_memory_utilization: spec
                .gpu_memory_utilization
                .unwrap_or(self.settings.vllm_gpu_memory_utilization),
            max_model_len: spec.max_model_len.or(self.settings.vllm_max_model_len),
            extra_args: spec.extra_vllm_args.clone(),
        }
    }

    /// Work out the endpoint and key for an API model. Explicit settings win
    /// over the provider preset.
    fn resolve_api_auth(&self, spec: &ModelSpec) -> Result<EndpointAuth> {
        let preset = spec.provider.as_deref().and_then(providers::preset);
        let non_blank = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };
        let base_url = non_blank(&spec.base_url)
            .or_else(|| preset.map(|preset| preset.base_url.to_owned()))
            .ok_or_else(|| anyhow!("Missing base_url for API model: {}", spec.model))?;
        let api_key_env = non_blank(&spec.api_key_env)
            .or_else(|| preset.map(|preset| preset.api_key_env.to_owned()));
        let api_key = self
            .services
            .credentials
            .resolve_api_key(spec.api_key.as_deref(), api_key_env.as_deref())?;
        Ok(EndpointAuth { base_url, api_key })
    }

    fn max_concurrent_requests(&self, spec: &ModelSpec) -> usize {
        spec.max_concurrent_requests
            .unwrap_or(self.settings.vllm_max_concurrent_requests)
            .max(1)
    }

    fn mark_job_started(&self, job_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut table = self.state.lock().expect("lock poisoned");
        let entry = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow!("Unknown job: {}", job_id))?;
        if entry.job.status == RunStatus::Queued {
            entry.job.status = RunStatus::Running;
        }
        entry.job.started_at = Some(now);
        table.persist_job(job_id, now)
    }

    /// Compute the final job status once every run task has exited.
    fn finish_job(&self, job_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut table = self.state.lock().expect("lock poisoned");
        let entry = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow!("Unknown job: {}", job_id))?;
        for run in &mut entry.job.models {
            if run.status.is_active() {
                warn!(run_id = %run.run_id, "Run task exited without finishing");
                run.status = RunStatus::Failed;
                run.ended_at = Some(now);
                run.error
                    .get_or_insert_with(|| "Run ended unexpectedly".to_owned());
            }
        }
        entry.job.status = aggregate_status(
            entry.job.models.iter().map(|run| run.status),
            entry.cancel.is_canceled(),
        );
        entry.job.ended_at = Some(now);
        entry.job.recompute_progress();
        info!(
            job_id,
            status = %entry.job.status,
            completed_pages = entry.job.completed_pages_all_models,
            total_pages = entry.job.total_pages_all_models,
            "Job finished"
        );
        table.persist_job(job_id, now)
    }
}

/// Launches and tracks OCR jobs.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(settings: Settings, services: JobServices) -> Self {
        let layout = OutputLayout::new(settings.outputs_dir.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                layout,
                services,
                state: Mutex::new(JobTable::default()),
            }),
        }
    }

    /// Build an orchestrator with the real collaborators.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let services = JobServices::from_settings(&settings).await?;
        Ok(Self::new(settings, services))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &Arc<LocalServerPool> {
        &self.inner.services.pool
    }

    /// Validate `request`, set up its output directories, and start it in the
    /// background. Returns the job as it was at launch.
    #[instrument(level = "debug", skip_all)]
    pub async fn launch(&self, mut request: LaunchRequest) -> Result<JobProgress> {
        request.validate()?;
        let inner = &self.inner;

        let input_path = resolve_input_path(&inner.settings.inputs_dir, &request.input_path);
        let pdfs = expand_pdf_inputs(&input_path)?;
        if pdfs.is_empty() {
            bail!("No PDF files found at input path: {:?}", input_path);
        }
        let documents = inner.services.documents.describe(&pdfs).await?;
        let total_pages_per_model = documents
            .iter()
            .map(|doc| u64::from(doc.page_count))
            .sum::<u64>();

        let now = Utc::now();
        let job_id = request
            .job_id
            .as_deref()
            .map(str::trim)
            .filter(|job_id| !job_id.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| build_job_id(request.title.as_deref(), &input_path, now));
        let title = request
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| job_id.clone());
        self.reserve_job_id(&job_id)?;
        let prepared = self.prepare_job(
            &job_id,
            title,
            input_path,
            &request,
            &documents,
            total_pages_per_model,
            now,
        );
        let (job, contexts) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.release_job_id(&job_id);
                return Err(err);
            }
        };

        let cancel = CancelSignal::new();
        let snapshot = {
            let mut table = inner.state.lock().expect("lock poisoned");
            table.launching.remove(&job_id);
            if let Some(old) = table.jobs.remove(&job_id) {
                for run in &old.job.models {
                    table.metrics.remove_run(&job_id, &run.run_id);
                }
            }
            for run in &job.models {
                table.metrics.reset_run(&job_id, &run.run_id);
            }
            table.jobs.insert(
                job_id.clone(),
                JobEntry {
                    job,
                    runs: contexts,
                    cancel: cancel.clone(),
                    task: None,
                },
            );
            if let Err(err) = table.persist_job(&job_id, now) {
                table.jobs.remove(&job_id);
                return Err(err);
            }
            table.snapshot(table.entry(&job_id)?, now)
        };

        info!(
            job_id = %job_id,
            models = snapshot.models.len(),
            documents = documents.len(),
            total_pages = snapshot.total_pages_all_models,
            "Launching job"
        );
        let task = tokio::spawn(execute_job(
            inner.clone(),
            job_id.clone(),
            Arc::new(request),
            Arc::new(documents),
            cancel,
        ));
        let mut table = inner.state.lock().expect("lock poisoned");
        if let Some(entry) = table.jobs.get_mut(&job_id) {
            entry.task = Some(task);
        }
        Ok(snapshot)
    }

    /// Write the job, model and run directories with their initial metadata,
    /// and build the in-memory job.
    #[allow(clippy::too_many_arguments)]
    fn prepare_job(
        &self,
        job_id: &str,
        title: String,
        input_path: PathBuf,
        request: &LaunchRequest,
        documents: &[Document],
        total_pages_per_model: u64,
        now: DateTime<Utc>,
    ) -> Result<(JobProgress, Vec<RunContext>)> {
        let inner = &self.inner;
        let metadata_path = inner.layout.ensure_job(
            job_id,
            json_object(json!({
                "job_id": job_id,
                "title": title,
                "input_path": input_path,
                "prompt": request.prompt,
                "requested_models": request.models,
            }))?,
        )?;

        let source_files = documents
            .iter()
            .map(|doc| doc.path.clone())
            .collect::<Vec<_>>();
        let mut runs = Vec::with_capacity(request.models.len());
        let mut contexts = Vec::with_capacity(request.models.len());
        for spec in &request.models {
            inner.layout.ensure_model(
                job_id,
                &spec.model,
                json_object(json!({
                    "model": spec.model,
                    "mode": spec.mode,
                    "provider": spec.provider,
                    "base_url": spec.base_url,
                }))?,
            )?;
            let paths = inner.layout.prepare_run(job_id, &spec.model)?;
            let mut config = json_object(serde_json::to_value(spec)?)?;
            config.insert("created_at".to_owned(), json!(now));
            config.insert("source_files".to_owned(), json!(source_files));
            config.insert("total_pages".to_owned(), json!(total_pages_per_model));
            merge_into_file(&paths.run_metadata_path(), config)?;

            runs.push(ModelRunProgress {
                run_id: format!("{}:{}", paths.model_slug, paths.run_number),
                model: spec.model.clone(),
                mode: spec.mode,
                status: RunStatus::Queued,
                started_at: None,
                ended_at: None,
                error: None,
                total_pages: total_pages_per_model,
                completed_pages: 0,
                current_pdf: None,
                current_page: None,
                output_dir: paths.run_dir.clone(),
                source_files: source_files.clone(),
                endpoint: None,
                runtime_seconds: 0.0,
                eta_seconds: None,
                statistics: Statistics::default(),
            });
            contexts.push(RunContext {
                paths,
                spec: spec.clone(),
            });
        }

        let job = JobProgress {
            job_id: job_id.to_owned(),
            title,
            input_path,
            status: RunStatus::Queued,
            created_at: now,
            started_at: None,
            ended_at: None,
            prompt: request.prompt.clone(),
            total_pages_all_models: total_pages_per_model * runs.len() as u64,
            completed_pages_all_models: 0,
            models: runs,
            metadata_path,
            runtime_seconds: 0.0,
            eta_seconds: None,
            statistics: Statistics::default(),
        };
        Ok((job, contexts))
    }

    /// Claim `job_id` for a launch in progress, unless it's already in use.
    fn reserve_job_id(&self, job_id: &str) -> Result<()> {
        let mut table = self.inner.state.lock().expect("lock poisoned");
        if table.is_active(job_id) {
            bail!("Job id already exists and is active: {}", job_id);
        }
        table.launching.insert(job_id.to_owned());
        Ok(())
    }

    fn release_job_id(&self, job_id: &str) {
        let mut table = self.inner.state.lock().expect("lock poisoned");
        table.launching.remove(job_id);
    }

    /// Every job in memory.
    pub fn list_jobs(&self) -> Vec<JobProgress> {
        let now = Utc::now();
        let table = self.inner.state.lock().expect("lock poisoned");
        let mut jobs = table
            .jobs
            .values()
            .map(|entry| table.snapshot(entry, now))
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobProgress> {
        let table = self.inner.state.lock().expect("lock poisoned");
        let entry = table.jobs.get(job_id)?;
        Some(table.snapshot(entry, Utc::now()))
    }

    /// Ask a job to stop. Requests already sent are allowed to finish.
    /// Returns `false` for unknown jobs.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut table = self.inner.state.lock().expect("lock poisoned");
        let Some(entry) = table.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        entry.cancel.cancel();
        if !matches!(entry.job.status, RunStatus::Completed | RunStatus::Failed) {
            info!(job_id, "Canceling job");
            entry.job.status = RunStatus::Canceled;
            table.persist_job(job_id, now)?;
        }
        Ok(true)
    }

    /// Forget a finished job. Its files stay on disk.
    pub fn dismiss(&self, job_id: &str) -> Result<(), DismissError> {
        let mut table = self.inner.state.lock().expect("lock poisoned");
        let entry = table.jobs.get(job_id).ok_or(DismissError::NotFound)?;
        if !matches!(entry.job.status, RunStatus::Completed | RunStatus::Canceled) {
            return Err(DismissError::NotFinished);
        }
        if entry.task_active() {
            return Err(DismissError::StillRunning);
        }
        if let Some(entry) = table.jobs.remove(job_id) {
            for run in &entry.job.models {
                table.metrics.remove_run(job_id, &run.run_id);
            }
        }
        Ok(())
    }

    /// Is the job's background task still going?
    pub fn is_running(&self, job_id: &str) -> bool {
        let table = self.inner.state.lock().expect("lock poisoned");
        table.jobs.get(job_id).is_some_and(JobEntry::task_active)
    }

    /// Wait for a job's background task to exit, then return its final state.
    pub async fn wait(&self, job_id: &str) -> Option<JobProgress> {
        while self.is_running(job_id) {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        self.get_job(job_id)
    }

    /// Live statistics for one run.
    pub fn run_statistics(&self, job_id: &str, run_id: &str) -> Statistics {
        let table = self.inner.state.lock().expect("lock poisoned");
        let runtime = table
            .jobs
            .get(job_id)
            .and_then(|entry| entry.job.models.iter().find(|run| run.run_id == run_id))
            .map(|run| run.runtime_seconds_at(Utc::now()));
        table.metrics.run_totals(job_id, run_id).finalize(runtime)
    }

    /// Live statistics summed over a job's runs.
    pub fn job_statistics(&self, job_id: &str) -> Statistics {
        self.get_job(job_id)
            .map(|job| job.statistics)
            .unwrap_or_else(|| PageTotals::default().finalize(Some(0.0)))
    }

    /// Cancel everything, stop the background tasks and shut down every local
    /// server.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut table = self.inner.state.lock().expect("lock poisoned");
            table
                .jobs
                .values_mut()
                .filter_map(|entry| {
                    entry.cancel.cancel();
                    entry.task.take()
                })
                .collect::<Vec<_>>()
        };
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(%err, "Job task failed during shutdown");
                }
            }
        }

        let now = Utc::now();
        {
            let mut table = self.inner.state.lock().expect("lock poisoned");
            let interrupted = table
                .jobs
                .iter_mut()
                .filter_map(|(job_id, entry)| {
                    let mut touched = false;
                    for run in &mut entry.job.models {
                        if run.status.is_active() {
                            run.status = RunStatus::Canceled;
                            run.ended_at = Some(now);
                            touched = true;
                        }
                    }
                    if !touched && entry.job.ended_at.is_some() {
                        return None;
                    }
                    entry.job.status = aggregate_status(
                        entry.job.models.iter().map(|run| run.status),
                        true,
                    );
                    entry.job.ended_at.get_or_insert(now);
                    Some(job_id.clone())
                })
                .collect::<Vec<_>>();
            for job_id in interrupted {
                if let Err(err) = table.persist_job(&job_id, now) {
                    error!(job_id, "Failed to persist job during shutdown: {:#}", err);
                }
            }
        }

        self.inner.services.pool.shutdown_all().await;
    }

    /// Every page written for `job_id`, including earlier runs.
    pub fn list_output_pages(&self, job_id: &str) -> Result<Vec<OutputPageSummary>> {
        outputs::list_output_pages(&self.inner.layout, job_id)
    }

    pub fn get_output_page(&self, job_id: &str, index: usize) -> Result<OutputPage> {
        outputs::get_output_page(&self.inner.layout, job_id, index)
    }

    pub async fn gpu_telemetry(&self) -> GpuTelemetry {
        GpuTelemetry::from(gpu::query_gpu_stats().await)
    }

    /// Whether we can find a key for each provider preset.
    pub fn provider_key_status(&self) -> Vec<ProviderKeyStatus> {
        PROVIDER_PRESETS
            .iter()
            .map(|preset| {
                self.inner
                    .services
                    .credentials
                    .key_status(preset.key, Some(preset.api_key_env))
            })
            .collect()
    }
}

/// Run every model of a job concurrently, then settle the job's status.
#[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
async fn execute_job(
    inner: Arc<Inner>,
    job_id: String,
    request: Arc<LaunchRequest>,
    documents: Arc<Vec<Document>>,
    cancel: CancelSignal,
) {
    if let Err(err) = inner.mark_job_started(&job_id) {
        error!("Failed to mark job as started: {:#}", err);
    }

    let mut runs = JoinSet::new();
    for index in 0..request.models.len() {
        runs.spawn(run::execute_run(
            inner.clone(),
            job_id.clone(),
            index,
            request.clone(),
            documents.clone(),
            cancel.clone(),
        ));
    }
    while let Some(joined) = runs.join_next().await {
        if let Err(err) = joined {
            error!(%err, "Run task did not complete");
        }
    }

    if let Err(err) = inner.finish_job(&job_id) {
        error!("Failed to finish job: {:#}", err);
    }
}

fn json_object(value: Value) -> Result<JsonObject> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected a JSON object, found {}", other)),
    }
}
