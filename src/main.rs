use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::Settings, prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod documents;
mod gpu;
mod jobs;
mod layout;
mod ocr_client;
mod prelude;
mod providers;
mod resources;
mod retry;
mod ui;

/// Compare OCR models on the same PDFs, using remote APIs or local vLLM
/// servers.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCR_* (optional): Defaults for the global options above.
  - OPENAI_API_KEY, OPENROUTER_API_KEY, GEMINI_API_KEY: Keys for the
    built-in provider presets. Requests may name other variables.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(flatten)]
    settings: Settings,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run a job described by a TOML or JSON request file.
    Run(cmd::run::RunOpts),
    /// Print GPU telemetry.
    Gpus,
    /// List PDFs and folders under the inputs directory.
    Inputs(cmd::inputs::InputsOpts),
    /// List or print the pages a job has written.
    Outputs(cmd::outputs::OutputsOpts),
    /// List provider presets and whether their API keys are set.
    Providers,
    /// Start a local vLLM server and keep it running until Ctrl-C.
    ServeLocal(cmd::serve_local::ServeLocalOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists. This must
    // happen before parsing, so `OCR_*` defaults are picked up.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    let settings = &opts.settings;
    match &opts.subcmd {
        Cmd::Run(run_opts) => cmd::run::cmd_run(ui, settings, run_opts).await,
        Cmd::Gpus => cmd::gpus::cmd_gpus(settings).await,
        Cmd::Inputs(inputs_opts) => cmd::inputs::cmd_inputs(settings, inputs_opts).await,
        Cmd::Outputs(outputs_opts) => cmd::outputs::cmd_outputs(settings, outputs_opts).await,
        Cmd::Providers => cmd::providers::cmd_providers(settings).await,
        Cmd::ServeLocal(serve_opts) => {
            cmd::serve_local::cmd_serve_local(ui, settings, serve_opts).await
        }
    }
}
