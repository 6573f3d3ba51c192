use anyhow::{Context, Result};
use clap::Parser;
use hivepf::{HiveEngine, settings::Settings, telemetry};
use log::info;

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Compiled eBPF object, overrides BPF_OBJECT
    #[clap(long)]
    bpf_object: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let mut settings = Settings::new().context("Failed to load settings")?;
    if opt.bpf_object.is_some() {
        settings.bpf_object = opt.bpf_object;
    }

    telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref())?;

    let engine = HiveEngine::new(settings)?;
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    info!("hivepf stopped");
    result
}
