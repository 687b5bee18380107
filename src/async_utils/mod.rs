//! Asynchronous utilities for use with Tokio.
//!
//! The orchestration code mixes cooperative tasks with blocking work (PDF
//! rendering, NVML probes, child process management). The glue for that lives
//! here so the rest of the crate can stay straightforward.

use std::{pin::Pin, sync::LazyLock};

use futures::{Stream, stream};
use regex::Regex;

use crate::prelude::*;

pub mod cancel;
pub mod io;

/// A type alias for a boxed stream.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Convert a blocking iterator into a [`Stream`]. Each call to `next` runs on a
/// background worker thread, so slow items (like rendering a PDF page) never
/// block the executor. Only one item is produced at a time.
pub fn blocking_iter_stream<I, T>(iter: I) -> BoxedStream<Result<T>>
where
    I: Iterator<Item = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    Box::pin(stream::unfold(Some(iter), |state| async move {
        let mut iter = state?;
        let (next, iter) = spawn_blocking_propagating_panics(move || {
            let next = iter.next();
            (next, iter)
        })
        .await;
        next.map(|item| (item, Some(iter)))
    }))
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

/// A default error regex for checking command output.
pub static DEFAULT_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at debug level, and standard
/// error may optionally be checked against a regex to detect failures from
/// tools that exit successfully anyway.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(command_name, output = %stdout, "Standard output from command");
    if !stderr.trim().is_empty() {
        debug!(command_name, output = %stderr, "Standard error from command");
    }

    if output.status.success() {
        if let Some(regex) = error_regex {
            if regex.is_match(&stderr) {
                bail!("{} printed error output:\n{}", command_name, stderr);
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        bail!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        )
    } else {
        bail!("{} failed with error output:\n{}", command_name, stderr)
    }
}

/// Look for an executable named `program` on `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
