//! Running page totals, and the statistics we report from them.

use std::{collections::HashMap, ops::AddAssign};

use crate::prelude::*;

/// Token counts, normalized across providers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Read a provider's `usage` object. We accept both the chat completions
    /// names (`prompt_tokens`) and the newer ones (`input_tokens`), and
    /// compute `total_tokens` if it's missing.
    pub fn from_provider_usage(usage: Option<&Value>) -> Self {
        let Some(usage) = usage else {
            return Self::default();
        };
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| usage.get(*name))
                .map(count_from_value)
                .unwrap_or(0)
        };
        let input_tokens = field(&["prompt_tokens", "input_tokens"]);
        let output_tokens = field(&["completion_tokens", "output_tokens"]);
        let mut total_tokens = field(&["total_tokens"]);
        if total_tokens == 0 {
            total_tokens = input_tokens.saturating_add(output_tokens);
        }
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Providers sometimes send counts as floats or strings. Negative and
/// unparseable values count as zero.
fn count_from_value(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Raw page totals for a run, a job, or a document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageTotals {
    pub pages_attempted: u64,
    pub pages_succeeded: u64,
    pub pages_failed: u64,
    pub processing_time_seconds: f64,
    pub ocr_request_time_seconds: f64,
    pub token_usage: TokenUsage,
}

impl PageTotals {
    /// Count one finished page.
    pub fn record(
        &mut self,
        succeeded: bool,
        processing_time_seconds: f64,
        ocr_request_time_seconds: Option<f64>,
        token_usage: TokenUsage,
    ) {
        self.pages_attempted += 1;
        if succeeded {
            self.pages_succeeded += 1;
        } else {
            self.pages_failed += 1;
        }
        self.processing_time_seconds += processing_time_seconds.max(0.0);
        self.ocr_request_time_seconds += ocr_request_time_seconds.unwrap_or(0.0).max(0.0);
        self.token_usage += token_usage;
    }

    /// Compute averages. `runtime_seconds` is only reported for runs and jobs.
    pub fn finalize(&self, runtime_seconds: Option<f64>) -> Statistics {
        let average = |total: f64| {
            if self.pages_attempted > 0 {
                total / self.pages_attempted as f64
            } else {
                0.0
            }
        };
        Statistics {
            pages_attempted: self.pages_attempted,
            pages_succeeded: self.pages_succeeded,
            pages_failed: self.pages_failed,
            processing_time_seconds: self.processing_time_seconds,
            ocr_request_time_seconds: self.ocr_request_time_seconds,
            average_processing_time_seconds: average(self.processing_time_seconds),
            average_ocr_request_time_seconds: average(self.ocr_request_time_seconds),
            token_usage: self.token_usage,
            runtime_seconds: runtime_seconds.map(|secs| secs.max(0.0)),
        }
    }
}

impl AddAssign<&PageTotals> for PageTotals {
    fn add_assign(&mut self, other: &PageTotals) {
        self.pages_attempted += other.pages_attempted;
        self.pages_succeeded += other.pages_succeeded;
        self.pages_failed += other.pages_failed;
        self.processing_time_seconds += other.processing_time_seconds;
        self.ocr_request_time_seconds += other.ocr_request_time_seconds;
        self.token_usage += other.token_usage;
    }
}

/// Point-in-time statistics, as stored in metadata files.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Statistics {
    pub pages_attempted: u64,
    pub pages_succeeded: u64,
    pub pages_failed: u64,
    pub processing_time_seconds: f64,
    pub ocr_request_time_seconds: f64,
    pub average_processing_time_seconds: f64,
    pub average_ocr_request_time_seconds: f64,
    pub token_usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<f64>,
}

impl Statistics {
    /// Recover the raw totals, so persisted statistics can be summed.
    pub fn totals(&self) -> PageTotals {
        PageTotals {
            pages_attempted: self.pages_attempted,
            pages_succeeded: self.pages_succeeded,
            pages_failed: self.pages_failed,
            processing_time_seconds: self.processing_time_seconds,
            ocr_request_time_seconds: self.ocr_request_time_seconds,
            token_usage: self.token_usage,
        }
    }
}

/// Statistics for one document, which also know its page count.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PdfStatistics {
    #[serde(flatten)]
    pub statistics: Statistics,
    pub page_count: u32,
    pub processed_pages: u64,
}

/// Running totals per `(job_id, run_id)`, independent of what's on disk.
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    runs: HashMap<(String, String), PageTotals>,
}

impl MetricsAccumulator {
    /// Start a run from zero, replacing anything left from an earlier job
    /// with the same ID.
    pub fn reset_run(&mut self, job_id: &str, run_id: &str) {
        self.runs
            .insert((job_id.to_owned(), run_id.to_owned()), PageTotals::default());
    }

    /// Forget a run entirely.
    pub fn remove_run(&mut self, job_id: &str, run_id: &str) {
        self.runs.remove(&(job_id.to_owned(), run_id.to_owned()));
    }

    pub fn record(
        &mut self,
        job_id: &str,
        run_id: &str,
        succeeded: bool,
        processing_time_seconds: f64,
        ocr_request_time_seconds: Option<f64>,
        token_usage: TokenUsage,
    ) {
        self.runs
            .entry((job_id.to_owned(), run_id.to_owned()))
            .or_default()
            .record(
                succeeded,
                processing_time_seconds,
                ocr_request_time_seconds,
                token_usage,
            );
    }

    /// Totals for a run. Unknown runs have zero totals.
    pub fn run_totals(&self, job_id: &str, run_id: &str) -> PageTotals {
        self.runs
            .get(&(job_id.to_owned(), run_id.to_owned()))
            .cloned()
            .unwrap_or_default()
    }
}
