//! Drives one model over every document in a job.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use futures::{StreamExt as _, future};

use crate::{
    async_utils::{blocking_iter_stream, cancel::CancelSignal, io::append_jsonl},
    documents::{Document, RenderedPage},
    jobs::{
        Inner,
        metadata::write_pdf_metadata,
        metrics::TokenUsage,
        types::{LaunchRequest, LocalEndpoint, ModelMode, PageRecord, PageStatus, RunStatus},
    },
    layout::{PdfPaths, RunPaths, page_file_name},
    ocr_client::{EndpointAuth, GenerationParams, OcrPageResult, PageOcr},
    prelude::*,
    resources::pool::ServerHandle,
};

/// API key sent to local servers, which don't check it.
const LOCAL_API_KEY: &str = "EMPTY";

/// A line in `errors.jsonl`.
#[derive(Debug, Serialize)]
struct ErrorRecord<'a> {
    timestamp: DateTime<Utc>,
    source_pdf: &'a Path,
    page: u32,
    error: &'a str,
}

/// What came back for one page, before anything is written.
struct PageOutcome {
    page_number: u32,
    result: Result<OcrPageResult, String>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    processing_seconds: f64,
}

/// Everything a run needs that doesn't change between documents.
struct RunEnv<'a> {
    inner: &'a Inner,
    job_id: &'a str,
    index: usize,
    model: &'a str,
    prompt: &'a str,
    params: GenerationParams,
    paths: &'a RunPaths,
    client: Arc<dyn PageOcr>,
    limit: usize,
    cancel: &'a CancelSignal,
}

/// Run one model to completion, failure or cancellation. Never returns an
/// error: whatever goes wrong is recorded on the run.
#[instrument(level = "debug", skip_all, fields(job_id = %job_id, run = index))]
pub(super) async fn execute_run(
    inner: Arc<Inner>,
    job_id: String,
    index: usize,
    request: Arc<LaunchRequest>,
    documents: Arc<Vec<Document>>,
    cancel: CancelSignal,
) {
    let mut lease = None;
    let result = drive_run(&inner, &job_id, index, &request, &documents, &cancel, &mut lease).await;
    if let Err(err) = result {
        let recorded = if cancel.is_canceled() {
            info!("Run stopped after cancellation: {:#}", err);
            inner.transition(&job_id, index, RunStatus::Canceled)
        } else {
            error!("Run failed: {:#}", err);
            inner.fail_run(&job_id, index, format!("{:#}", err))
        };
        if let Err(err) = recorded {
            error!("Could not record run outcome: {:#}", err);
        }
    }
    if let Some(handle) = lease {
        inner.services.pool.release(&handle).await;
    }
}

async fn drive_run(
    inner: &Inner,
    job_id: &str,
    index: usize,
    request: &LaunchRequest,
    documents: &[Document],
    cancel: &CancelSignal,
    lease: &mut Option<Arc<ServerHandle>>,
) -> Result<()> {
    let (spec, paths) = inner.run_context(job_id, index)?;
    inner.update_run(job_id, index, |_, _, _| {})?;

    let auth = match spec.mode {
        ModelMode::Local => {
            inner.transition(job_id, index, RunStatus::WaitingResources)?;
            let handle = inner
                .services
                .pool
                .acquire(&inner.server_request(&spec), cancel)
                .await?;
            *lease = Some(handle.clone());
            inner.update_run(job_id, index, |run, _, _| {
                run.endpoint = Some(LocalEndpoint {
                    base_url: handle.base_url.clone(),
                    port: handle.port,
                    gpu_ids: handle.gpu_ids.clone(),
                    log_path: handle.log_path.clone(),
                });
            })?;
            EndpointAuth {
                base_url: handle.base_url.clone(),
                api_key: LOCAL_API_KEY.to_owned(),
            }
        }
        ModelMode::Api => inner.resolve_api_auth(&spec)?,
    };
    let client = inner.services.clients.create(auth)?;
    inner.transition(job_id, index, RunStatus::Running)?;

    let env = RunEnv {
        inner,
        job_id,
        index,
        model: &spec.model,
        prompt: &request.prompt,
        params: GenerationParams {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        },
        paths: &paths,
        client,
        limit: inner.max_concurrent_requests(&spec),
        cancel,
    };
    for document in documents {
        if cancel.is_canceled() {
            return inner.transition(job_id, index, RunStatus::Canceled);
        }
        process_document(&env, document).await?;
        if cancel.is_canceled() {
            return inner.transition(job_id, index, RunStatus::Canceled);
        }
    }
    inner.transition(job_id, index, RunStatus::Completed)
}

/// OCR every page of `document`, keeping at most `env.limit` requests in
/// flight.
#[instrument(level = "debug", skip_all, fields(pdf = %document.path.display()))]
async fn process_document(env: &RunEnv<'_>, document: &Document) -> Result<()> {
    let pdf = env
        .inner
        .layout
        .prepare_pdf(&env.paths.run_dir, &document.path)?;
    let pdf_started = Utc::now();
    let mut records = Vec::with_capacity(document.page_count as usize);
    write_pdf_metadata(
        &pdf.metadata_path(),
        &document.path,
        &pdf.pdf_slug,
        document.page_count,
        &records,
        Some(pdf_started),
        None,
        pdf_started,
    )?;
    env.inner.update_run(env.job_id, env.index, |run, _, _| {
        run.current_pdf = Some(document.path.clone());
        run.current_page = None;
    })?;

    let submit_gate = env.cancel.clone();
    let pages = blocking_iter_stream(env.inner.services.documents.pages(document)?);
    let mut outcomes = pages
        // Stop submitting new pages once canceled. Requests already in
        // flight are allowed to finish.
        .take_while(move |_| future::ready(!submit_gate.is_canceled()))
        .map(|page| {
            let client = env.client.clone();
            async move {
                let page = page?;
                Ok::<_, anyhow::Error>(
                    ocr_one_page(client.as_ref(), env.model, env.prompt, &env.params, page).await,
                )
            }
        })
        .buffer_unordered(env.limit);

    while let Some(outcome) = outcomes.next().await {
        let record = write_page(env, document, &pdf, outcome?).await?;
        records.push(record.clone());
        let now = Utc::now();
        write_pdf_metadata(
            &pdf.metadata_path(),
            &document.path,
            &pdf.pdf_slug,
            document.page_count,
            &records,
            Some(pdf_started),
            None,
            now,
        )?;
        env.inner.update_run(env.job_id, env.index, |run, metrics, _| {
            metrics.record(
                env.job_id,
                &run.run_id,
                record.status == PageStatus::Completed,
                record.processing_time_seconds,
                record.ocr_request_time_seconds,
                record.token_usage,
            );
            run.current_page = Some(record.page_number);
            run.completed_pages = (run.completed_pages + 1).min(run.total_pages);
        })?;
    }

    let now = Utc::now();
    write_pdf_metadata(
        &pdf.metadata_path(),
        &document.path,
        &pdf.pdf_slug,
        document.page_count,
        &records,
        Some(pdf_started),
        Some(now),
        now,
    )?;
    Ok(())
}

async fn ocr_one_page(
    client: &dyn PageOcr,
    model: &str,
    prompt: &str,
    params: &GenerationParams,
    page: RenderedPage,
) -> PageOutcome {
    let started_at = Utc::now();
    let clock = Instant::now();
    let result = client
        .ocr_page(model, prompt, &page.png, params)
        .await
        .map_err(|err| format!("{:#}", err));
    if let Err(err) = &result {
        warn!(page = page.page_number, "Page failed: {}", err);
    }
    PageOutcome {
        page_number: page.page_number,
        result,
        started_at,
        ended_at: Utc::now(),
        processing_seconds: clock.elapsed().as_secs_f64(),
    }
}

/// Write a page's text (or a failure placeholder), log any error, and build
/// its record.
async fn write_page(
    env: &RunEnv<'_>,
    document: &Document,
    pdf: &PdfPaths,
    outcome: PageOutcome,
) -> Result<PageRecord> {
    let page_number = outcome.page_number;
    let (markdown, error, ocr) = match outcome.result {
        Ok(ocr) => (ocr.markdown.clone(), None, Some(ocr)),
        Err(error) => (
            format!("<!-- OCR failed for page {}: {} -->\n", page_number, error),
            Some(error),
            None,
        ),
    };
    if let Some(error) = &error {
        append_jsonl(
            &env.paths.errors_path(),
            &ErrorRecord {
                timestamp: Utc::now(),
                source_pdf: &document.path,
                page: page_number,
                error,
            },
        )?;
    }

    let page_path = pdf.page_path(page_number);
    tokio::fs::write(&page_path, markdown.as_bytes())
        .await
        .with_context(|| format!("Failed to write {:?}", page_path))?;

    let usage = ocr.as_ref().and_then(|ocr| ocr.usage.clone());
    Ok(PageRecord {
        page_number,
        status: if error.is_none() {
            PageStatus::Completed
        } else {
            PageStatus::Failed
        },
        started_at: outcome.started_at,
        ended_at: outcome.ended_at,
        processing_time_seconds: outcome.processing_seconds,
        ocr_request_time_seconds: ocr.as_ref().map(|ocr| ocr.request_duration.as_secs_f64()),
        attempts: ocr.as_ref().map(|ocr| ocr.attempts).unwrap_or(0),
        finish_reason: ocr.as_ref().and_then(|ocr| ocr.finish_reason.clone()),
        provider_model: ocr.as_ref().and_then(|ocr| ocr.provider_model.clone()),
        token_usage: TokenUsage::from_provider_usage(usage.as_ref()),
        usage,
        output_markdown_file: page_file_name(page_number),
        output_markdown_path: page_path,
        output_bytes: markdown.len() as u64,
        error,
    })
}
