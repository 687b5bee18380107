//! Input discovery and PDF page rendering.
//!
//! Rendering uses Poppler's `pdfinfo` and `pdftocairo` command-line tools.
//! Pages are rendered one at a time, on demand, so a 500-page scan never has
//! to fit in memory.

use std::{collections::BTreeMap, fs, process::Command as StdCommand, sync::LazyLock};

use regex::Regex;
use tempfile::TempDir;
use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

/// Lines containing errors in Poppler's stderr output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler errors which are actually harmless warnings.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output report a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// A PDF we plan to process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub page_count: u32,
}

/// One page, rendered to PNG.
#[derive(Debug)]
pub struct RenderedPage {
    /// 1-based page number.
    pub page_number: u32,
    pub png: Vec<u8>,
}

/// A lazy, blocking iterator over rendered pages, in ascending order.
pub type PageIter = Box<dyn Iterator<Item = Result<RenderedPage>> + Send>;

/// Something that can count and render PDF pages.
#[async_trait]
pub trait DocumentSource: Send + Sync + 'static {
    /// How many pages does this PDF have?
    async fn page_count(&self, path: &Path) -> Result<u32>;

    /// Render the pages of `document`. Must be called from a context where
    /// blocking is allowed, such as [`crate::async_utils::blocking_iter_stream`].
    fn pages(&self, document: &Document) -> Result<PageIter>;

    /// Count the pages of every path.
    async fn describe(&self, paths: &[PathBuf]) -> Result<Vec<Document>> {
        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let page_count = self.page_count(path).await?;
            documents.push(Document {
                path: path.clone(),
                page_count,
            });
        }
        Ok(documents)
    }
}

/// Render PDFs with Poppler.
#[derive(Clone, Debug)]
pub struct PopplerDocuments {
    dpi: u32,
}

impl PopplerDocuments {
    pub fn new(dpi: u32) -> Self {
        Self { dpi }
    }
}

#[async_trait]
impl DocumentSource for PopplerDocuments {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn page_count(&self, path: &Path) -> Result<u32> {
        let output = Command::new("pdfinfo")
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
        check_for_command_failure("pdfinfo", &output, None)?;
        let stdout =
            String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
        parse_pdfinfo_pages(&stdout)
            .with_context(|| format!("failed to get page count for {:?}", path.display()))
    }

    fn pages(&self, document: &Document) -> Result<PageIter> {
        let tmpdir = TempDir::with_prefix("pages")?;
        Ok(Box::new(PopplerPageIter {
            path: document.path.clone(),
            dpi: self.dpi,
            next_page: 1,
            page_count: document.page_count,
            tmpdir,
        }))
    }
}

/// Pull the `Pages:` value out of `pdfinfo` output.
fn parse_pdfinfo_pages(output: &str) -> Result<u32> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    pages
        .parse::<u32>()
        .with_context(|| format!("invalid page count {:?}", pages))
}

/// Renders one page per call to `next`.
struct PopplerPageIter {
    path: PathBuf,
    dpi: u32,
    next_page: u32,
    page_count: u32,
    /// Scratch space for `pdftocairo`. Released by [`Drop`].
    tmpdir: TempDir,
}

impl PopplerPageIter {
    fn render(&self, page_number: u32) -> Result<RenderedPage> {
        let out_prefix = self.tmpdir.path().join(format!("page-{page_number}"));
        let page_arg = page_number.to_string();
        let output = StdCommand::new("pdftocairo")
            .arg("-png")
            .arg("-singlefile")
            .arg("-r")
            .arg(self.dpi.to_string())
            .args(["-f", &page_arg, "-l", &page_arg])
            .arg(&self.path)
            .arg(&out_prefix)
            .output()
            .with_context(|| format!("failed to run pdftocairo on {:?}", self.path.display()))?;
        check_for_command_failure("pdftocairo", &output, None)?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(line) = stderr.lines().find(|line| is_error_line(line)) {
            bail!("pdftocairo reported an error: {}", line.trim());
        }
        let png_path = out_prefix.with_extension("png");
        let png = fs::read(&png_path)
            .with_context(|| format!("failed to read rendered page {:?}", png_path))?;
        fs::remove_file(&png_path).ok();
        Ok(RenderedPage { page_number, png })
    }
}

impl Iterator for PopplerPageIter {
    type Item = Result<RenderedPage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_page > self.page_count {
            return None;
        }
        let page_number = self.next_page;
        self.next_page += 1;
        Some(self.render(page_number).with_context(|| {
            format!("failed to render page {} of {:?}", page_number, self.path.display())
        }))
    }
}

fn is_pdf(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Resolve a user-supplied input path. Absolute paths are used as-is, then we
/// try relative to the current directory, and finally relative to the inputs
/// directory.
pub fn resolve_input_path(inputs_dir: &Path, candidate: &Path) -> PathBuf {
    if candidate.is_absolute() {
        return candidate.to_owned();
    }
    if let Ok(cwd) = std::env::current_dir() {
        let direct = cwd.join(candidate);
        if direct.exists() {
            return direct;
        }
    }
    std::path::absolute(inputs_dir.join(candidate))
        .unwrap_or_else(|_| inputs_dir.join(candidate))
}

/// Expand a file or directory into a sorted list of PDFs.
pub fn expand_pdf_inputs(source: &Path) -> Result<Vec<PathBuf>> {
    if is_pdf(source) {
        return Ok(vec![source.to_owned()]);
    }
    let mut found = vec![];
    if source.is_dir() {
        collect_pdfs(source, &mut found)?;
    }
    found.sort();
    Ok(found)
}

fn collect_pdfs(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))?;
    for entry in entries {
        let path = entry.with_context(|| format!("Failed to list {:?}", dir))?.path();
        if path.is_dir() {
            collect_pdfs(&path, found)?;
        } else if is_pdf(&path) {
            found.push(path);
        }
    }
    Ok(())
}

/// Something under the inputs directory that could be OCRed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InputCandidate {
    pub path: PathBuf,
    pub kind: InputKind,
    pub relative_to_inputs: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Pdf,
    Folder,
}

/// List PDFs under `inputs_dir`, plus each sub-folder that contains them.
pub fn discover_inputs(inputs_dir: &Path, max_items: usize) -> Result<Vec<InputCandidate>> {
    let pdfs = expand_pdf_inputs(inputs_dir)?;
    let mut candidates = vec![];
    let mut seen_dirs = std::collections::BTreeSet::new();
    for pdf in pdfs {
        if candidates.len() >= max_items {
            break;
        }
        let relative = pdf.strip_prefix(inputs_dir).unwrap_or(&pdf).to_owned();
        candidates.push(InputCandidate {
            path: pdf.clone(),
            kind: InputKind::Pdf,
            relative_to_inputs: relative,
        });
        if let Some(parent) = pdf.parent() {
            if parent != inputs_dir && seen_dirs.insert(parent.to_owned()) {
                candidates.push(InputCandidate {
                    path: parent.to_owned(),
                    kind: InputKind::Folder,
                    relative_to_inputs: parent
                        .strip_prefix(inputs_dir)
                        .unwrap_or(parent)
                        .to_owned(),
                });
            }
        }
    }
    Ok(candidates)
}
