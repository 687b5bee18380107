//! Metadata snapshots for jobs, runs and documents.
//!
//! Every write is a full snapshot. Job snapshots are merged with whatever is
//! already on disk, so reusing a job ID keeps the history of earlier runs.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::{
    async_utils::io::{JsonObject, read_json_object_if_exists, write_json_file},
    jobs::{
        metrics::{PageTotals, PdfStatistics, Statistics},
        types::{JobProgress, ModelRunProgress, PageRecord, PageStatus, RunStatus},
    },
    layout::merge_into_file,
    prelude::*,
};

/// Combine run statuses into a job status.
pub fn aggregate_status<I>(statuses: I, cancel_requested: bool) -> RunStatus
where
    I: IntoIterator<Item = RunStatus>,
{
    let statuses = statuses.into_iter().collect::<Vec<_>>();
    let any = |wanted: RunStatus| statuses.iter().any(|status| *status == wanted);
    let all = |wanted: RunStatus| statuses.iter().all(|status| *status == wanted);

    if cancel_requested && all(RunStatus::Canceled) {
        RunStatus::Canceled
    } else if any(RunStatus::Failed) {
        if any(RunStatus::Completed) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    } else if all(RunStatus::Completed) {
        RunStatus::Completed
    } else if any(RunStatus::Running) {
        RunStatus::Running
    } else if any(RunStatus::WaitingResources) {
        RunStatus::WaitingResources
    } else if any(RunStatus::Queued) {
        RunStatus::Queued
    } else {
        RunStatus::Failed
    }
}

/// The parts of a persisted run entry we need for totals. Everything else is
/// carried through untouched.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PersistedRun {
    run_id: String,
    status: Option<RunStatus>,
    total_pages: u64,
    completed_pages: u64,
    statistics: Statistics,
}

/// A run entry in a job snapshot, from memory or from disk.
struct MergedRun {
    entry: Value,
    status: RunStatus,
    total_pages: u64,
    completed_pages: u64,
    totals: PageTotals,
}

/// The contents of `job_metadata.json`.
#[derive(Debug, Deserialize, Serialize)]
pub struct JobMetadata {
    pub job_id: String,
    pub title: String,
    pub input_path: PathBuf,
    pub status: RunStatus,
    /// Kept exactly as first written.
    pub created_at: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub prompt: String,
    pub total_pages_all_models: u64,
    pub completed_pages_all_models: u64,
    pub progress_ratio: f64,
    pub models: Vec<Value>,
    pub statistics: Statistics,
}

/// Write a job snapshot, merging it with the existing file.
///
/// `run_totals` holds the live metrics for each of `job.models`, in order.
/// Runs found on disk but not in memory are kept, and the job's totals and
/// status are recomputed over the merged set.
pub fn write_job_metadata(
    job: &JobProgress,
    run_totals: &[PageTotals],
    cancel_requested: bool,
    now: DateTime<Utc>,
) -> Result<JobMetadata> {
    let path = &job.metadata_path;
    let existing = read_json_object_if_exists(path).unwrap_or_default();

    let created_at = existing
        .get("created_at")
        .and_then(Value::as_str)
        .filter(|created_at| !created_at.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| job.created_at.to_rfc3339());

    let mut current = job
        .models
        .iter()
        .zip(run_totals)
        .map(|(run, totals)| current_run_entry(run, totals))
        .collect::<Result<Vec<_>>>()?;
    let current_ids = job
        .models
        .iter()
        .map(|run| run.run_id.as_str())
        .collect::<HashSet<_>>();

    // Keep the on-disk order, with current entries replacing stale ones, and
    // append runs that are new to this file.
    let mut merged = Vec::new();
    let mut placed = HashSet::new();
    if let Some(Value::Array(entries)) = existing.get("models") {
        for entry in entries {
            let Ok(persisted) = serde_json::from_value::<PersistedRun>(entry.clone()) else {
                warn!(path = %path.display(), "Skipping unreadable run entry");
                continue;
            };
            if persisted.run_id.is_empty() {
                continue;
            }
            if current_ids.contains(persisted.run_id.as_str()) {
                if placed.insert(persisted.run_id.clone()) {
                    let index = job
                        .models
                        .iter()
                        .position(|run| run.run_id == persisted.run_id)
                        .ok_or_else(|| anyhow!("run {} vanished", persisted.run_id))?;
                    merged.push(index);
                }
                continue;
            }
            current.push(MergedRun {
                entry: entry.clone(),
                status: persisted.status.unwrap_or(RunStatus::Failed),
                total_pages: persisted.total_pages,
                completed_pages: persisted.completed_pages,
                totals: persisted.statistics.totals(),
            });
            merged.push(current.len() - 1);
        }
    }
    for (index, run) in job.models.iter().enumerate() {
        if !placed.contains(&run.run_id) {
            merged.push(index);
        }
    }
    let runs = merged
        .into_iter()
        .map(|index| &current[index])
        .collect::<Vec<_>>();

    let mut totals = PageTotals::default();
    for run in &runs {
        totals += &run.totals;
    }
    let total_pages_all_models = runs.iter().map(|run| run.total_pages).sum::<u64>();
    let completed_pages_all_models = runs.iter().map(|run| run.completed_pages).sum::<u64>();
    let status = if job.status == RunStatus::Canceled {
        RunStatus::Canceled
    } else {
        aggregate_status(runs.iter().map(|run| run.status), cancel_requested)
    };

    let metadata = JobMetadata {
        job_id: job.job_id.clone(),
        title: job.title.clone(),
        input_path: job.input_path.clone(),
        status,
        created_at,
        started_at: job.started_at,
        ended_at: job.ended_at,
        prompt: job.prompt.clone(),
        total_pages_all_models,
        completed_pages_all_models,
        progress_ratio: if total_pages_all_models == 0 {
            0.0
        } else {
            (completed_pages_all_models as f64 / total_pages_all_models as f64).min(1.0)
        },
        models: runs.iter().map(|run| run.entry.clone()).collect(),
        statistics: totals.finalize(Some(job.runtime_seconds_at(now))),
    };
    // Keys we don't manage, such as the launch request, are carried over.
    let Value::Object(snapshot) =
        serde_json::to_value(&metadata).context("Failed to serialize job")?
    else {
        bail!("job snapshot was not a JSON object");
    };
    let mut file = existing;
    file.extend(snapshot);
    write_json_file(path, &file)?;
    Ok(metadata)
}

fn current_run_entry(run: &ModelRunProgress, totals: &PageTotals) -> Result<MergedRun> {
    let mut run = run.clone();
    run.statistics = totals.finalize(None);
    Ok(MergedRun {
        entry: serde_json::to_value(&run).context("Failed to serialize run")?,
        status: run.status,
        total_pages: run.total_pages,
        completed_pages: run.completed_pages,
        totals: totals.clone(),
    })
}

/// Write a run snapshot over `run_metadata.json`, keeping any launch
/// configuration already stored there.
pub fn write_run_metadata(
    path: &Path,
    run: &ModelRunProgress,
    totals: &PageTotals,
    now: DateTime<Utc>,
) -> Result<()> {
    let runtime_seconds = run.runtime_seconds_at(now);
    let mut run = run.clone();
    run.runtime_seconds = runtime_seconds;
    run.eta_seconds = None;
    run.statistics = totals.finalize(Some(runtime_seconds));
    let Value::Object(payload) = serde_json::to_value(&run).context("Failed to serialize run")?
    else {
        bail!("run snapshot was not a JSON object");
    };
    merge_into_file(path, payload)
}

/// The contents of `pdf_metadata.json`.
#[derive(Debug, Deserialize, Serialize)]
pub struct PdfMetadata {
    pub source_pdf: PathBuf,
    pub pdf_slug: String,
    pub page_count: u32,
    pub created_at: String,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub statistics: PdfStatistics,
    /// Sorted by page number.
    pub pages: Vec<PageRecord>,
}

/// Write a document snapshot. `created_at` and `started_at` survive rewrites.
#[allow(clippy::too_many_arguments)]
pub fn write_pdf_metadata(
    path: &Path,
    source_pdf: &Path,
    pdf_slug: &str,
    page_count: u32,
    pages: &[PageRecord],
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<PdfMetadata> {
    let existing = read_json_object_if_exists(path).unwrap_or_default();
    let existing_str = |key: &str| {
        existing
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    };

    let mut totals = PageTotals::default();
    for page in pages {
        totals.record(
            page.status == PageStatus::Completed,
            page.processing_time_seconds,
            page.ocr_request_time_seconds,
            page.token_usage,
        );
    }
    let mut pages = pages.to_vec();
    pages.sort_by_key(|page| page.page_number);

    let metadata = PdfMetadata {
        source_pdf: source_pdf.to_owned(),
        pdf_slug: pdf_slug.to_owned(),
        page_count,
        created_at: existing_str("created_at").unwrap_or_else(|| now.to_rfc3339()),
        updated_at: now,
        started_at: existing_str("started_at").or(started_at.map(|at| at.to_rfc3339())),
        ended_at,
        statistics: PdfStatistics {
            processed_pages: totals.pages_attempted,
            statistics: totals.finalize(None),
            page_count,
        },
        pages,
    };
    write_json_file(path, &metadata)?;
    Ok(metadata)
}

/// Find a page's output token count in a `pdf_metadata.json` object.
pub fn output_tokens_for_page(pdf_metadata: &JsonObject, page_number: u32) -> Option<u64> {
    let pages = pdf_metadata.get("pages")?.as_array()?;
    let page = pages.iter().find(|page| {
        page.get("page_number").and_then(Value::as_u64) == Some(u64::from(page_number))
    })?;
    page.get("token_usage")?.get("output_tokens")?.as_u64()
}
