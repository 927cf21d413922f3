use anyhow::Context;
use jarvis::config::resolve_root_dir;
use native_host::NativeHost;
use protocol_runtime::ChannelEndpoint;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let root = resolve_root_dir();
    // stdout carries the frames, so logs only ever go to a file
    let logs = tracing_appender::rolling::daily(root.join("logs"), "native_host.log");
    let _ = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(logs)
        .with_env_filter(EnvFilter::try_from_env("JARVIS_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let mut host = NativeHost::open(root.join("comms"))
        .await
        .context("could not open the comms directory")?;
    info!(offset = host.offset(), "native host started");

    let browser = ChannelEndpoint::native_stdio("browser");
    if let Err(err) = host.serve(&browser).await {
        error!(error = %err, "native host stopped");
        return Err(err.into());
    }
    Ok(())
}
