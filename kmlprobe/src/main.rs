use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use kmlprobe::{ProbeEngine, output::OutputFormat, settings::Settings, telemetry};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Record output format; overrides OUTPUT__FORMAT
    #[clap(long, value_enum)]
    format: Option<OutputFormat>,

    /// YAML settings file, overridden by environment variables
    #[clap(short, long, env = "KMLPROBE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if opt.verbose {
        "debug"
    } else {
        "info"
    }))
    .init();

    let settings = Settings::load(opt.config.as_deref()).context("Failed to load settings")?;
    let format = opt.format.unwrap_or_else(|| settings.output_format());

    telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref())?;

    let engine = ProbeEngine::new(
        settings,
        format,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/kmlprobe")),
    )?;
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}
