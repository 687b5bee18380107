//! Terminal UI: one progress bar per model run, plus a stderr writer that
//! keeps log output from tearing the bars.

use std::{borrow::Cow, collections::HashMap, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::jobs::types::{JobProgress, ModelRunProgress, RunStatus};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        let multi_progress = Arc::new(MultiProgress::new());
        Ui { multi_progress }
    }

    /// A UI that never draws anything.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        let multi_progress =
            Arc::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()));
        Ui { multi_progress }
    }

    /// Hide all our progress bars, for when stdout carries real output.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer that can be used to write to stderr, for use with `tracing`
    /// and other output code.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi_progress
    }

    /// A spinner for work with no meaningful length, like waiting for a
    /// server to start.
    pub fn new_spinner(&self, msg: &str, done_msg: &str) -> ProgressBar {
        let sp = ProgressBar::new_spinner().with_style(spinner_style());
        let sp = self.multi_progress.add(sp);
        #[cfg(test)]
        sp.set_draw_target(ProgressDrawTarget::hidden());
        sp.set_message(msg.to_owned());
        sp.enable_steady_tick(Duration::from_millis(250));
        sp.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            done_msg.to_owned(),
        )))
    }

    /// Progress bars that follow the runs of one job.
    pub fn job_progress(&self) -> JobProgressBars {
        JobProgressBars {
            ui: self.clone(),
            bars: HashMap::new(),
        }
    }
}

/// One bar per run, keyed by run ID, updated from job snapshots.
pub struct JobProgressBars {
    ui: Ui,
    bars: HashMap<String, ProgressBar>,
}

impl JobProgressBars {
    /// Bring every bar up to date with `job`.
    pub fn update(&mut self, job: &JobProgress) {
        for run in &job.models {
            let bar = self
                .bars
                .entry(run.run_id.clone())
                .or_insert_with(|| {
                    let bar = ProgressBar::new(run.total_pages).with_style(run_style());
                    let bar = self.ui.multi_progress.add(bar);
                    #[cfg(test)]
                    bar.set_draw_target(ProgressDrawTarget::hidden());
                    bar.set_prefix(run.model.clone());
                    bar.enable_steady_tick(Duration::from_millis(250));
                    bar
                });
            if bar.is_finished() {
                continue;
            }
            bar.set_length(run.total_pages);
            bar.set_position(run.completed_pages);
            let message = run_message(run);
            if run.status.is_terminal() {
                bar.finish_with_message(message);
            } else {
                bar.set_message(message);
            }
        }
    }

    /// Stop drawing. Bars for unfinished runs are left where they are.
    pub fn finish(&mut self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

/// What to show next to a run's bar.
fn run_message(run: &ModelRunProgress) -> String {
    match run.status {
        RunStatus::Running => match &run.current_pdf {
            Some(pdf) => {
                let name = pdf
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match run.current_page {
                    Some(page) => format!("{name} p{page}"),
                    None => name,
                }
            }
            None => run.status.to_string(),
        },
        RunStatus::Failed => format!(
            "failed: {}",
            run.error.as_deref().unwrap_or("unknown error")
        ),
        status => status.to_string(),
    }
}

fn run_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:30!} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise} {msg}")
        .expect("bad progress bar template")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {msg}")
        .expect("bad progress bar template")
}

/// A writer which can used to write to `stderr`. It will hide and show progress
/// bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress().suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress().suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
