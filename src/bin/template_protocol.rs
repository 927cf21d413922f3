//! Reference protocol. Shows the handler shape new protocols start from and
//! doubles as the process the hub tests activate.
//!
//! Run as the interpreter of a script named `silent`, it connects its channel
//! and then never reports `loaded`, leaving its pid in `silent.pid` next to
//! the script.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use protocol_runtime::channel::{channel_path, connect_with_retry};
use protocol_runtime::worker::{self, ProtocolHandler, WorkerContext};
use protocol_runtime::{LifecycleConfig, WorkerHandoff};
use serde_json::{Value, json};
use tracing::{info, warn};

struct TemplateProtocol;

fn str_field<'a>(input: &'a Value, key: &str) -> Result<&'a str, String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing string field `{key}`"))
}

#[async_trait]
impl ProtocolHandler for TemplateProtocol {
    fn name(&self) -> &str {
        "template_protocol"
    }

    async fn handle_request(
        &self,
        ctx: &WorkerContext,
        command: &str,
        input: Value,
    ) -> Result<Value, String> {
        match command {
            "start" => Ok(json!({ "status": "ok" })),
            "echo" => Ok(input),
            // `hang` is `sleep` with a default long enough to outlive any test bound
            "sleep" | "hang" => {
                let default = if command == "hang" { 60_000 } else { 100 };
                let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(default);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            }
            "pid" => Ok(json!({ "pid": std::process::id() })),
            "spawn" => {
                let script = str_field(&input, "script")?;
                let worker_id = ctx.activate(script).await.map_err(|e| e.to_string())?;
                Ok(json!({ "worker_id": worker_id }))
            }
            "ask_hub" => {
                let script = str_field(&input, "script")?;
                let start = input.get("input").cloned();
                let worker_id = ctx
                    .request_activation(script, start)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({ "worker_id": worker_id }))
            }
            "children" => Ok(json!({ "workers": ctx.registry().worker_ids() })),
            "exit" => {
                warn!("exiting on request");
                std::process::exit(input.get("code").and_then(Value::as_i64).unwrap_or(1) as i32);
            }
            other => Err(format!("unknown command `{other}`")),
        }
    }

    async fn handle_action(&self, ctx: &WorkerContext, command: &str, input: Value) {
        if command == "start" {
            info!(%input, "started");
            let output = json!({ "worker_id": ctx.worker_id(), "started_with": input });
            if let Err(err) = ctx.send_output(output).await {
                warn!(error = %err, "could not report to the mother");
            }
        }
    }
}

fn silent_script() -> Option<PathBuf> {
    let script = PathBuf::from(std::env::args_os().nth(1)?);
    (script.file_name()? == "silent").then_some(script)
}

/// Connects, then holds the channel open without a word.
async fn stay_silent(script: &Path) -> anyhow::Result<()> {
    let identity = WorkerHandoff::from_stdin().await?;
    let config = LifecycleConfig::from_env()?;
    tokio::fs::write(script.with_extension("pid"), std::process::id().to_string()).await?;
    let path = channel_path(&config.channel_dir, &identity.worker_id);
    let _channel = connect_with_retry(&path, 50, Duration::from_millis(100)).await?;
    warn!(worker_id = %identity.worker_id, "connected, staying silent");
    std::future::pending::<()>().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    worker::init_worker_tracing("template_protocol");
    if let Some(script) = silent_script() {
        return stay_silent(&script).await;
    }
    worker::run(TemplateProtocol).await?;
    Ok(())
}
