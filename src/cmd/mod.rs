//! Command-line entry points.

use crate::prelude::*;

pub mod gpus;
pub mod inputs;
pub mod outputs;
pub mod providers;
pub mod run;
pub mod serve_local;

/// Print `value` to stdout as one line of JSON.
fn print_json_line<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).context("failed to serialize output")?;
    println!("{}", line);
    Ok(())
}

/// Print `value` to stdout as pretty JSON.
fn print_json_pretty<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{}", text);
    Ok(())
}
