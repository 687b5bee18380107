//! Browsing the pages a job has written, including pages from earlier runs.

use std::fs;

use crate::{
    async_utils::io::read_json_object_if_exists,
    jobs::metadata::output_tokens_for_page,
    layout::{OutputLayout, PDF_METADATA_FILE, RUN_METADATA_FILE, parse_run_number},
    prelude::*,
};

/// One page of output.
#[derive(Clone, Debug, Serialize)]
pub struct OutputPageSummary {
    /// Position in the sorted list of all the job's pages.
    pub index: usize,
    pub model: String,
    pub model_slug: String,
    pub mode: Option<String>,
    pub run_number: u32,
    pub pdf_slug: String,
    pub page_number: u32,
    pub source_pdf: Option<String>,
    pub markdown_path: PathBuf,
    pub bytes: u64,
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_characters: Option<usize>,
}

/// A page summary plus its text.
#[derive(Clone, Debug, Serialize)]
pub struct OutputPage {
    pub page: OutputPageSummary,
    pub markdown: String,
}

/// Subdirectories of `dir`, sorted by name.
fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry
            .with_context(|| format!("Failed to list {:?}", dir))?
            .path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// List every `<page>.md` under a job, sorted by model slug, run number,
/// document slug and page number.
pub fn list_output_pages(layout: &OutputLayout, job_id: &str) -> Result<Vec<OutputPageSummary>> {
    let job_dir = layout.job_dir(job_id);
    if !job_dir.is_dir() {
        bail!("Job outputs not found for {}", job_id);
    }

    let mut pages = Vec::new();
    for model_dir in sorted_subdirs(&job_dir)? {
        let model_slug = file_name(&model_dir);
        for run_dir in sorted_subdirs(&model_dir)? {
            let Some(run_number) = parse_run_number(&file_name(&run_dir)) else {
                continue;
            };
            let run_metadata =
                read_json_object_if_exists(&run_dir.join(RUN_METADATA_FILE)).unwrap_or_default();
            let model = run_metadata
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model_slug.as_str())
                .to_owned();
            let mode = run_metadata
                .get("mode")
                .and_then(Value::as_str)
                .map(str::to_owned);

            for pdf_dir in sorted_subdirs(&run_dir)? {
                let pdf_slug = file_name(&pdf_dir);
                let pdf_metadata =
                    read_json_object_if_exists(&pdf_dir.join(PDF_METADATA_FILE))
                        .unwrap_or_default();
                let source_pdf = pdf_metadata
                    .get("source_pdf")
                    .and_then(Value::as_str)
                    .map(str::to_owned);

                for entry in
                    fs::read_dir(&pdf_dir).with_context(|| format!("Failed to list {:?}", pdf_dir))?
                {
                    let path = entry
                        .with_context(|| format!("Failed to list {:?}", pdf_dir))?
                        .path();
                    if !path.is_file() || path.extension().is_none_or(|ext| ext != "md") {
                        continue;
                    }
                    let Some(page_number) = path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .filter(|stem| !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()))
                        .and_then(|stem| stem.parse::<u32>().ok())
                    else {
                        continue;
                    };
                    let bytes = fs::metadata(&path)
                        .with_context(|| format!("Failed to stat {:?}", path))?
                        .len();
                    pages.push(OutputPageSummary {
                        index: 0,
                        model: model.clone(),
                        model_slug: model_slug.clone(),
                        mode: mode.clone(),
                        run_number,
                        pdf_slug: pdf_slug.clone(),
                        page_number,
                        source_pdf: source_pdf.clone(),
                        markdown_path: path,
                        bytes,
                        output_tokens: output_tokens_for_page(&pdf_metadata, page_number),
                        output_characters: None,
                    });
                }
            }
        }
    }

    pages.sort_by(|a, b| {
        (&a.model_slug, a.run_number, &a.pdf_slug, a.page_number).cmp(&(
            &b.model_slug,
            b.run_number,
            &b.pdf_slug,
            b.page_number,
        ))
    });
    for (index, page) in pages.iter_mut().enumerate() {
        page.index = index;
    }
    Ok(pages)
}

/// Read the page at `index` in [`list_output_pages`] order.
pub fn get_output_page(layout: &OutputLayout, job_id: &str, index: usize) -> Result<OutputPage> {
    let pages = list_output_pages(layout, job_id)?;
    let Some(mut page) = pages.into_iter().nth(index) else {
        bail!("Page index out of range: {}", index);
    };
    let markdown = fs::read_to_string(&page.markdown_path)
        .with_context(|| format!("Failed to read {:?}", page.markdown_path))?;
    page.output_characters = Some(markdown.chars().count());
    Ok(OutputPage { page, markdown })
}
