use anyhow::{Context, bail};
use clap::Args;
use serde_json::json;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use jarvis::Hub;
use jarvis::config::HubSettings;
use jarvis::logger::init_tracing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    pub otel_endpoint: Option<String>,

    /// Protocol to activate at startup, overriding JARVIS_BOOT_PROTOCOL
    #[arg(long)]
    pub boot: Option<String>,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_endpoint: None,
            boot: None,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let root = context.root.clone();
    if !root.exists() {
        let err = format!(
            "Root directory `{}` does not exist. Please run `jarvis init` first.",
            root.display()
        );
        eprintln!("{err}");
        bail!(err);
    }

    let _telemetry = init_tracing(
        &root,
        "logs/jarvis.log",
        "logs/jarvis_events.log",
        &args.log_level,
        args.otel_endpoint.as_deref(),
    )
    .context("could not create logger")?;

    info!("Jarvis hub starting up…");
    println!("Jarvis hub starting up…");

    let settings = HubSettings::from_config(root, &context.config_manager).await?;
    let boot = args.boot.or_else(|| settings.boot_protocol.clone());
    let hub = Hub::start(settings).await.context("failed to start the hub")?;

    if let Some(script) = boot {
        match hub.activate(&script, None, Some(json!({}))).await {
            Ok(worker_id) => info!(%worker_id, %script, "boot protocol active"),
            Err(err) => {
                error!(%script, error = %err, "boot protocol failed to activate");
                hub.shutdown().await;
                bail!("boot protocol `{script}` failed: {err}");
            }
        }
    }

    info!("Jarvis hub running; press Ctrl‐C to exit");
    println!("Jarvis hub running; press Ctrl‐C to exit");

    signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("Jarvis hub shutting down");

    let terminated = hub.shutdown().await;
    info!(count = terminated.len(), "protocols stopped");

    println!("Goodbye!");
    Ok(())
}
