//! Runtime every protocol process runs.
//!
//! A protocol is a worker towards whoever activated it and, at the same time,
//! a hub for the children it activates itself, so it owns a private registry
//! and correlator and routes with the same prefix table the hub uses.
//!
//! ```ignore
//! use protocol_runtime::worker::{self, ProtocolHandler, WorkerContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     worker::init_worker_tracing("my_protocol");
//!     worker::run(MyProtocol::default()).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::channel::{ChannelEndpoint, channel_path, connect_with_retry};
use crate::correlator::Correlator;
use crate::envelope::{Builtin, Envelope, Kind, address};
use crate::error::{ProtocolError, Result};
use crate::handoff::WorkerHandoff;
use crate::registry::{
    InboundEvent, LOG_DIR_ENV, LifecycleConfig, Owner, ProcessRegistry, TerminatedWorker,
};
use crate::router::{RouteHandler, Router};

/// Peer name of the channel towards whoever activated this protocol.
pub const UPSTREAM: &str = "upstream";
/// Filter directives for protocol logs, `info` when unset.
pub const LOG_FILTER_ENV: &str = "JARVIS_LOG";

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Behaviour of one protocol. Only requests must be answered; everything
/// else has a logging default.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// `Err` is sent back as a failure response carrying the message.
    async fn handle_request(
        &self,
        ctx: &WorkerContext,
        command: &str,
        input: Value,
    ) -> std::result::Result<Value, String>;

    async fn handle_action(&self, _ctx: &WorkerContext, command: &str, input: Value) {
        debug!(protocol = self.name(), command, %input, "action ignored");
    }

    async fn handle_status(&self, _ctx: &WorkerContext, command: &str, input: Value) {
        debug!(protocol = self.name(), command, %input, "status ignored");
    }

    /// Runs before the protocol's own children are deactivated.
    async fn on_stop(&self, _ctx: &WorkerContext) {}
}

struct ContextInner {
    identity: WorkerHandoff,
    upstream: Arc<ChannelEndpoint>,
    correlator: Arc<Correlator>,
    registry: Arc<ProcessRegistry>,
    request_timeout: Duration,
    stop: CancellationToken,
}

/// Handle a [`ProtocolHandler`] uses to talk to the rest of the system.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext").field("identity", &self.inner.identity).finish()
    }
}

impl WorkerContext {
    pub fn worker_id(&self) -> &str {
        &self.inner.identity.worker_id
    }

    pub fn root_id(&self) -> &str {
        &self.inner.identity.root_id
    }

    pub fn mother_id(&self) -> Option<&str> {
        self.inner.identity.mother_id.as_deref()
    }

    pub fn address(&self) -> String {
        address::worker(self.worker_id())
    }

    /// `worker:<mother>`, or `hub` for hub-rooted protocols.
    pub fn mother_address(&self) -> String {
        self.mother_id()
            .map(address::worker)
            .unwrap_or_else(|| address::HUB.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Private registry of the children this protocol activated itself.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.inner.registry
    }

    /// Asks the runtime to shut down after the current envelope.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    fn channel_for(&self, receiver: &str) -> Arc<ChannelEndpoint> {
        address::worker_id(receiver)
            .and_then(|id| self.inner.registry.channel(id))
            .unwrap_or_else(|| self.inner.upstream.clone())
    }

    fn is_own_child(&self, receiver: &str) -> bool {
        address::worker_id(receiver).is_some_and(|id| self.inner.registry.contains(id))
    }

    /// Sends to one of our children directly, everything else upstream.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.channel_for(&envelope.receiver).send(envelope).await
    }

    pub async fn send_request(
        &self,
        command: impl Into<String>,
        input: Value,
        receiver: impl Into<String>,
    ) -> Result<Envelope> {
        self.send_request_within(command, input, receiver, self.inner.request_timeout)
            .await
    }

    pub async fn send_request_within(
        &self,
        command: impl Into<String>,
        input: Value,
        receiver: impl Into<String>,
        bound: Duration,
    ) -> Result<Envelope> {
        let request = Envelope::request(command, input, self.address(), receiver);
        let channel = self.channel_for(&request.receiver);
        self.inner.correlator.send_request(&channel, request, bound).await
    }

    pub fn send_request_async<F>(
        &self,
        command: impl Into<String>,
        input: Value,
        receiver: impl Into<String>,
        on_response: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<Envelope>) + Send + 'static,
    {
        let request = Envelope::request(command, input, self.address(), receiver);
        let channel = self.channel_for(&request.receiver);
        self.inner
            .correlator
            .send_request_async(channel, request, self.inner.request_timeout, on_response)
    }

    pub async fn send_action(
        &self,
        command: impl Into<String>,
        input: Value,
        receiver: impl Into<String>,
    ) -> Result<()> {
        self.send(&Envelope::action(command, input, self.address(), receiver))
            .await
    }

    pub async fn send_status(
        &self,
        command: impl Into<String>,
        input: Value,
        receiver: impl Into<String>,
    ) -> Result<()> {
        self.send(&Envelope::status(command, input, self.address(), receiver))
            .await
    }

    /// Hands a result to the mother as an `output` action.
    pub async fn send_output(&self, input: Value) -> Result<()> {
        self.send_action(Builtin::Output, input, self.mother_address())
            .await
    }

    /// Spawns a child owned by this protocol.
    pub async fn activate(&self, script_reference: &str) -> Result<String> {
        self.inner.registry.activate(script_reference, None).await
    }

    pub async fn deactivate(&self, worker_id: &str) -> Vec<TerminatedWorker> {
        self.inner.registry.deactivate(worker_id).await
    }

    /// Asks the hub to activate `script_reference` with this protocol as
    /// mother. `start` is forwarded as the input of the child's `start` action.
    pub async fn request_activation(&self, script_reference: &str, start: Option<Value>) -> Result<String> {
        let mut input = json!({
            "script_reference": script_reference,
            "mother_id": self.worker_id(),
        });
        if let Some(start) = start {
            input["input"] = start;
        }
        let response = self.send_request(Builtin::Activate, input, address::HUB).await?;
        rejected(&response, Builtin::Activate)?;
        response
            .input
            .get("worker_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::malformed("activate response without `worker_id`"))
    }

    /// Asks the hub to deactivate `worker_id`; returns the ids it terminated.
    pub async fn request_deactivation(&self, worker_id: &str) -> Result<Vec<String>> {
        let response = self
            .send_request(Builtin::Deactivate, json!({ "worker_id": worker_id }), address::HUB)
            .await?;
        rejected(&response, Builtin::Deactivate)?;
        let terminated = response
            .input
            .get("terminated")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("worker_id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(terminated)
    }
}

fn rejected(response: &Envelope, command: Builtin) -> Result<()> {
    if response.is_failure() {
        return Err(ProtocolError::Rejected {
            command: command.to_string(),
            reason: response.failure_reason().unwrap_or("no reason given").to_string(),
        });
    }
    Ok(())
}

/// Envelopes addressed to this protocol.
struct Local {
    ctx: WorkerContext,
    handler: Arc<dyn ProtocolHandler>,
}

#[async_trait]
impl RouteHandler for Local {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        // a sibling whose id merely starts with ours
        if envelope.receiver != self.ctx.address() {
            return self.ctx.send(&envelope).await;
        }
        let ctx = &self.ctx;
        match envelope.kind {
            Kind::Request => {
                let reply = match envelope.command.as_deref() {
                    None => Envelope::failure_to(&envelope, "request without a command"),
                    Some(_) if envelope.command_is(Builtin::Stop) => {
                        Envelope::response_to(&envelope, json!({ "status": "stopping" }))
                    }
                    Some(command) => {
                        match self.handler.handle_request(ctx, command, envelope.input.clone()).await {
                            Ok(output) => Envelope::response_to(&envelope, output),
                            Err(reason) => {
                                warn!(command, %reason, "request failed");
                                Envelope::failure_to(&envelope, reason)
                            }
                        }
                    }
                };
                let sent = ctx.send(&reply).await;
                if envelope.command_is(Builtin::Stop) {
                    ctx.stop();
                }
                sent
            }
            Kind::Action if envelope.command_is(Builtin::Stop) => {
                ctx.stop();
                Ok(())
            }
            Kind::Action => {
                let command = envelope.command.unwrap_or_default();
                self.handler.handle_action(ctx, &command, envelope.input).await;
                Ok(())
            }
            Kind::Status => {
                let command = envelope.command.unwrap_or_default();
                self.handler.handle_status(ctx, &command, envelope.input).await;
                Ok(())
            }
            Kind::Response => {
                warn!(message_id = %envelope.message_id, "response without a pending request");
                Ok(())
            }
        }
    }
}

/// Everything else: down to a child when we own it, otherwise upstream.
struct Forward {
    ctx: WorkerContext,
}

#[async_trait]
impl RouteHandler for Forward {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.ctx.send(&envelope).await
    }
}

fn worker_router(ctx: &WorkerContext, handler: Arc<dyn ProtocolHandler>) -> Router {
    let forward: Arc<dyn RouteHandler> = Arc::new(Forward { ctx: ctx.clone() });
    Router::new()
        .with_route(ctx.address(), Arc::new(Local { ctx: ctx.clone(), handler }))
        .with_route(address::WORKER_PREFIX, forward.clone())
        .with_route("", forward)
}

fn spawn_route(router: Arc<Router>, envelope: Envelope) {
    tokio::spawn(async move {
        let message_id = envelope.message_id.clone();
        if let Err(err) = router.route(envelope).await {
            warn!(%message_id, error = %err, "failed to deliver envelope");
        }
    });
}

/// Entry point of a protocol binary: reads the handoff from stdin, connects
/// the channel and serves until upstream goes away or SIGTERM arrives.
pub async fn run<H: ProtocolHandler>(handler: H) -> Result<()> {
    let identity = WorkerHandoff::from_stdin().await?;
    let config = LifecycleConfig::from_env()?;
    let path = channel_path(&config.channel_dir, &identity.worker_id);
    let stream = connect_with_retry(&path, CONNECT_ATTEMPTS, CONNECT_DELAY).await?;
    let upstream = Arc::new(ChannelEndpoint::from_unix(UPSTREAM, stream));
    serve(handler, identity, config, upstream).await
}

/// Serves `handler` over an already connected upstream channel.
pub async fn serve<H: ProtocolHandler>(
    handler: H,
    identity: WorkerHandoff,
    config: LifecycleConfig,
    upstream: Arc<ChannelEndpoint>,
) -> Result<()> {
    let correlator = Correlator::new();
    let owner = Owner::Worker {
        worker_id: identity.worker_id.clone(),
        root_id: identity.root_id.clone(),
    };
    let request_timeout = config.request_timeout;
    let (registry, mut children) = ProcessRegistry::new(owner, config, correlator.clone());
    let stop = CancellationToken::new();
    let ctx = WorkerContext {
        inner: Arc::new(ContextInner {
            identity,
            upstream: upstream.clone(),
            correlator: correlator.clone(),
            registry: registry.clone(),
            request_timeout,
            stop: stop.clone(),
        }),
    };
    let handler: Arc<dyn ProtocolHandler> = Arc::new(handler);
    let router = Arc::new(worker_router(&ctx, handler.clone()));

    upstream
        .send(&Envelope::loaded(ctx.address(), ctx.mother_address()))
        .await?;
    info!(worker_id = ctx.worker_id(), protocol = handler.name(), "protocol loaded");

    let child_pump = {
        let router = router.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            while let Some(event) = children.recv().await {
                match event {
                    InboundEvent::Envelope { envelope, .. } => spawn_route(router.clone(), envelope),
                    InboundEvent::Disconnected { worker_id } => {
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            registry.handle_disconnect(&worker_id).await;
                        });
                    }
                }
            }
        })
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                info!("stop requested");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            received = upstream.receive() => match received {
                Ok(Some(envelope)) => {
                    let Some(envelope) = correlator.resolve(envelope) else { continue };
                    if envelope.receiver == ctx.address() || ctx.is_own_child(&envelope.receiver) {
                        spawn_route(router.clone(), envelope);
                    } else {
                        // bouncing it back upstream could loop forever
                        warn!(receiver = %envelope.receiver, "dropping envelope not meant for this protocol");
                    }
                }
                Ok(None) => {
                    info!("upstream channel closed");
                    break;
                }
                Err(ProtocolError::MalformedEnvelope { reason }) => {
                    warn!(%reason, "skipping malformed envelope");
                }
                Err(err) => {
                    warn!(error = %err, "upstream channel failed");
                    break;
                }
            }
        }
    }

    handler.on_stop(&ctx).await;
    let terminated = registry.shutdown().await;
    if !terminated.is_empty() {
        info!(count = terminated.len(), "children deactivated");
    }
    correlator.fail_all();
    upstream.close().await;
    child_pump.abort();
    Ok(())
}

/// Protocol logs go to `<JARVIS_LOG_DIR>/<name>.log`, rotated daily. Without
/// a log directory nothing is installed.
pub fn init_worker_tracing(name: &str) {
    let Some(dir) = std::env::var_os(LOG_DIR_ENV) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let file = tracing_appender::rolling::daily(&dir, format!("{name}.log"));
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(file)
        .with_env_filter(filter)
        .try_init();
}
