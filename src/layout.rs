//! On-disk layout of job outputs.
//!
//! ```text
//! <outputs>/<job-id>/job_metadata.json
//! <outputs>/<job-id>/<model-slug>/model_metadata.json
//! <outputs>/<job-id>/<model-slug>/run-<n>/run_metadata.json
//! <outputs>/<job-id>/<model-slug>/run-<n>/errors.jsonl
//! <outputs>/<job-id>/<model-slug>/run-<n>/<pdf-slug>/pdf_metadata.json
//! <outputs>/<job-id>/<model-slug>/run-<n>/<pdf-slug>/<page>.md
//! ```

use std::{fs, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{
    async_utils::io::{JsonObject, read_json_object_if_exists, write_json_file},
    prelude::*,
};

/// Characters we don't allow in slugs.
static UNSAFE_SLUG_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9._-]+").expect("failed to compile regex"));

/// Runs of dashes.
static DASH_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-+").expect("failed to compile regex"));

/// Name of the per-job metadata file.
pub const JOB_METADATA_FILE: &str = "job_metadata.json";
/// Name of the per-model metadata file.
pub const MODEL_METADATA_FILE: &str = "model_metadata.json";
/// Name of the per-run metadata file.
pub const RUN_METADATA_FILE: &str = "run_metadata.json";
/// Name of the per-document metadata file.
pub const PDF_METADATA_FILE: &str = "pdf_metadata.json";
/// Name of the per-run error log.
pub const ERRORS_FILE: &str = "errors.jsonl";

/// Turn arbitrary text into a filesystem-safe slug.
pub fn slugify(value: &str) -> String {
    let cleaned = UNSAFE_SLUG_CHARS.replace_all(value.trim(), "-");
    let cleaned = DASH_RUNS.replace_all(cleaned.trim_matches('-'), "-");
    if cleaned.is_empty() {
        "job".to_owned()
    } else {
        cleaned.into_owned()
    }
}

/// Directory-safe name for a model, like `zai-org-GLM-OCR`.
pub fn model_slug(model: &str) -> String {
    let replaced = model.trim().replace(['/', ' '], "-");
    DASH_RUNS.replace_all(&replaced, "-").into_owned()
}

/// Build a job ID from a title (or the input's file stem) and a UTC timestamp.
pub fn build_job_id(title: Option<&str>, input_path: &Path, now: DateTime<Utc>) -> String {
    let base = match title.map(str::trim).filter(|title| !title.is_empty()) {
        Some(title) => slugify(title),
        None => slugify(
            &input_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
    };
    format!("{}-{}", base, now.format("%Y%m%d-%H%M%S"))
}

/// Directory name for a run.
pub fn run_dir_name(run_number: u32) -> String {
    format!("run-{run_number}")
}

/// Parse `run-<n>` directory names.
pub fn parse_run_number(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix("run-")?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// The next unused run number in `model_dir`. Non-run entries are ignored.
pub fn next_run_number(model_dir: &Path) -> Result<u32> {
    let entries = match fs::read_dir(model_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to list {:?}", model_dir));
        }
    };
    let mut highest = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {:?}", model_dir))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(n) = parse_run_number(&entry.file_name().to_string_lossy()) {
            highest = highest.max(n);
        }
    }
    Ok(highest + 1)
}

/// Paths for a single model run.
#[derive(Clone, Debug)]
pub struct RunPaths {
    pub model_slug: String,
    pub run_number: u32,
    pub model_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl RunPaths {
    pub fn run_metadata_path(&self) -> PathBuf {
        self.run_dir.join(RUN_METADATA_FILE)
    }

    pub fn errors_path(&self) -> PathBuf {
        self.run_dir.join(ERRORS_FILE)
    }
}

/// Paths for one document within a run.
#[derive(Clone, Debug)]
pub struct PdfPaths {
    pub pdf_slug: String,
    pub pdf_dir: PathBuf,
}

impl PdfPaths {
    pub fn metadata_path(&self) -> PathBuf {
        self.pdf_dir.join(PDF_METADATA_FILE)
    }

    /// Where the text for `page_number` goes.
    pub fn page_path(&self, page_number: u32) -> PathBuf {
        self.pdf_dir.join(page_file_name(page_number))
    }
}

/// File name for a page's text.
pub fn page_file_name(page_number: u32) -> String {
    format!("{page_number}.md")
}

/// Output layout rooted at the outputs directory.
#[derive(Clone, Debug)]
pub struct OutputLayout {
    outputs_dir: PathBuf,
}

impl OutputLayout {
    pub fn new(outputs_dir: impl Into<PathBuf>) -> Self {
        Self {
            outputs_dir: outputs_dir.into(),
        }
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.outputs_dir.join(job_id)
    }

    pub fn job_metadata_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(JOB_METADATA_FILE)
    }

    pub fn model_dir(&self, job_id: &str, model: &str) -> PathBuf {
        self.job_dir(job_id).join(model_slug(model))
    }

    /// Create the job directory and merge `payload` into its metadata file.
    pub fn ensure_job(&self, job_id: &str, payload: JsonObject) -> Result<PathBuf> {
        let path = self.job_metadata_path(job_id);
        merge_into_file(&path, payload)?;
        Ok(path)
    }

    /// Create the model directory and merge `payload` into its metadata file.
    pub fn ensure_model(&self, job_id: &str, model: &str, payload: JsonObject) -> Result<PathBuf> {
        let path = self.model_dir(job_id, model).join(MODEL_METADATA_FILE);
        merge_into_file(&path, payload)?;
        Ok(path)
    }

    /// Allocate the next `run-<n>` directory for `model`.
    pub fn prepare_run(&self, job_id: &str, model: &str) -> Result<RunPaths> {
        let model_dir = self.model_dir(job_id, model);
        fs::create_dir_all(&model_dir)
            .with_context(|| format!("Failed to create {:?}", model_dir))?;
        let run_number = next_run_number(&model_dir)?;
        let run_dir = model_dir.join(run_dir_name(run_number));
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create {:?}", run_dir))?;
        Ok(RunPaths {
            model_slug: model_slug(model),
            run_number,
            model_dir,
            run_dir,
        })
    }

    /// Create a uniquely-named directory for `source_pdf` inside `run_dir`.
    pub fn prepare_pdf(&self, run_dir: &Path, source_pdf: &Path) -> Result<PdfPaths> {
        let base = slugify(
            &source_pdf
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        let mut candidate = base.clone();
        let mut index = 1;
        while run_dir.join(&candidate).exists() {
            index += 1;
            candidate = format!("{base}-{index}");
        }
        let pdf_dir = run_dir.join(&candidate);
        fs::create_dir_all(&pdf_dir)
            .with_context(|| format!("Failed to create {:?}", pdf_dir))?;
        Ok(PdfPaths {
            pdf_slug: candidate,
            pdf_dir,
        })
    }
}

/// Shallow-merge `payload` over whatever object is already stored at `path`.
pub fn merge_into_file(path: &Path, payload: JsonObject) -> Result<()> {
    let mut merged = read_json_object_if_exists(path).unwrap_or_default();
    merged.extend(payload);
    write_json_file(path, &merged)
}
