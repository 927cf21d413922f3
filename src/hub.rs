//! The hub: owns the top-level process registry, routes every envelope that
//! reaches it and runs the hub-local commands.
//!
//! Routing table, longest prefix first:
//!
//! | prefix    | destination                                  |
//! |-----------|----------------------------------------------|
//! | `hub`     | hub-local commands                           |
//! | `worker:` | the protocol's channel, dropped when unknown |
//! | `tab:`    | comms surface (`computer_comms.log`)         |
//! | `client`  | comms surface (`computer_comms.log`)         |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use protocol_runtime::{
    Builtin, Correlator, Envelope, InboundEvent, Kind, Owner, ProcessRegistry, ProtocolError,
    Result, RouteHandler, Router, TerminatedWorker, WorkerSummary, address,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::comms::CommsSurface;
use crate::config::HubSettings;
use crate::logger::{ROUTE_TARGET, RouteMetrics};

/// Peer name the correlator uses for requests sent over the comms surface.
pub const COMMS_PEER: &str = "comms";

/// Application command the hub runs when a `request` or `action` addressed
/// to `hub` names it. `Err` is answered as a failure response.
#[async_trait]
pub trait HubCommand: Send + Sync + 'static {
    async fn execute(&self, hub: &Arc<Hub>, input: Value) -> std::result::Result<Value, String>;
}

#[derive(Debug, Deserialize)]
struct ActivateInput {
    script_reference: String,
    #[serde(default)]
    mother_id: Option<String>,
    /// Input of the `start` action sent once the protocol is loaded.
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DeactivateInput {
    worker_id: String,
}

pub struct Hub {
    settings: HubSettings,
    registry: Arc<ProcessRegistry>,
    correlator: Arc<Correlator>,
    comms: CommsSurface,
    router: Router,
    commands: RwLock<HashMap<String, Arc<dyn HubCommand>>>,
    metrics: RouteMetrics,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("root", &self.settings.root)
            .field("router", &self.router)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Hub {
    /// Prepares the directories, clears the comms files and starts pumping
    /// envelopes from protocols and from the comms surface.
    pub async fn start(settings: HubSettings) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&settings.protocols_dir).await?;
        tokio::fs::create_dir_all(&settings.channel_dir).await?;
        let comms = CommsSurface::new(&settings.comms_dir);
        comms.clear().await?;

        let correlator = Correlator::new();
        let (registry, inbound) =
            ProcessRegistry::new(Owner::Hub, settings.lifecycle(), correlator.clone());

        let hub = Arc::new_cyclic(|weak: &Weak<Hub>| Hub {
            router: hub_router(weak.clone(), registry.clone(), comms.clone()),
            settings,
            registry,
            correlator,
            comms,
            commands: RwLock::new(HashMap::new()),
            metrics: RouteMetrics::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let pumps = vec![hub.spawn_inbound_pump(inbound), hub.spawn_comms_tail()];
        hub.tasks.lock().unwrap_or_else(|e| e.into_inner()).extend(pumps);
        info!(
            root = %hub.settings.root.display(),
            routes = ?hub.router,
            "hub started"
        );
        Ok(hub)
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn comms(&self) -> &CommsSurface {
        &self.comms
    }

    pub fn snapshot(&self) -> Vec<WorkerSummary> {
        self.registry.snapshot()
    }

    /// Makes `name` available as a hub-local command. Built-in commands
    /// cannot be replaced.
    pub fn register_command(&self, name: impl Into<String>, command: Arc<dyn HubCommand>) {
        let name = name.into();
        if name.parse::<Builtin>().is_ok() {
            warn!(%name, "refusing to shadow a built-in hub command");
            return;
        }
        self.commands
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, command);
    }

    /// Activates `script_reference` under `mother_id` (`None` for the hub)
    /// and, when `start` is given, sends it a `start` action.
    pub async fn activate(
        &self,
        script_reference: &str,
        mother_id: Option<&str>,
        start: Option<Value>,
    ) -> Result<String> {
        let began = Instant::now();
        let worker_id = self.registry.activate(script_reference, mother_id).await?;
        self.metrics.activation(began.elapsed().as_secs_f64() * 1_000.0);
        if let Some(input) = start {
            self.start_protocol(&worker_id, input).await?;
        }
        Ok(worker_id)
    }

    /// Sends the `start` action. A protocol that cannot be started is not
    /// left running.
    pub async fn start_protocol(&self, worker_id: &str, input: Value) -> Result<()> {
        let action = Envelope::action(Builtin::Start, input, address::HUB, address::worker(worker_id));
        if let Err(err) = self.registry.send_to(worker_id, &action).await {
            warn!(%worker_id, error = %err, "start failed, deactivating");
            self.registry.deactivate(worker_id).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn deactivate(&self, worker_id: &str) -> Vec<TerminatedWorker> {
        self.registry.deactivate(worker_id).await
    }

    /// Blocking request to a protocol or to the external client.
    pub async fn request(&self, request: Envelope, bound: Duration) -> Result<Envelope> {
        if let Some(worker_id) = address::worker_id(&request.receiver).map(str::to_string) {
            return self.registry.request(&worker_id, request, bound).await;
        }
        if !is_comms_address(&request.receiver) {
            return Err(ProtocolError::UnroutableAddress { receiver: request.receiver });
        }
        let rx = self.correlator.register(&request, COMMS_PEER)?;
        if let Err(err) = self.comms.send_outbound(&request).await {
            self.correlator.cancel(&request.message_id);
            return Err(err);
        }
        self.correlator.wait(&request.message_id, COMMS_PEER, rx, bound).await
    }

    /// [`Hub::request`] bounded by the configured request timeout.
    pub async fn send_request(
        &self,
        command: impl Into<String>,
        input: Value,
        receiver: impl Into<String>,
    ) -> Result<Envelope> {
        let request = Envelope::request(command, input, address::HUB, receiver);
        self.request(request, self.settings.request_timeout).await
    }

    /// Routes an envelope as if it had just arrived.
    pub async fn dispatch(&self, envelope: Envelope) {
        // comms responses are only matched here; protocol responses were
        // already matched by their reader task
        let Some(envelope) = self.correlator.resolve(envelope) else {
            return;
        };
        let prefix = self.router.resolve(&envelope.receiver).map(str::to_string);
        let message_id = envelope.message_id.clone();
        match self.router.route(envelope).await {
            Ok(()) => {
                if let Some(prefix) = prefix {
                    self.metrics.routed(&prefix);
                }
            }
            Err(ProtocolError::UnroutableAddress { .. }) => self.metrics.dropped("unroutable"),
            Err(err) => {
                warn!(%message_id, error = %err, "envelope not delivered");
                self.metrics.dropped("undeliverable");
            }
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, envelope: Envelope) {
        let hub = self.clone();
        tokio::spawn(async move { hub.dispatch(envelope).await });
    }

    fn spawn_inbound_pump(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundEvent>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    event = inbound.recv() => event,
                };
                match event {
                    Some(InboundEvent::Envelope { from, envelope }) => {
                        debug!(%from, message_id = %envelope.message_id, "envelope from protocol");
                        hub.spawn_dispatch(envelope);
                    }
                    Some(InboundEvent::Disconnected { worker_id }) => {
                        let registry = hub.registry.clone();
                        tokio::spawn(async move {
                            registry.handle_disconnect(&worker_id).await;
                        });
                    }
                    None => break,
                }
            }
        })
    }

    fn spawn_comms_tail(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        let mut tail = self.comms.tail_inbound();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.settings.comms_poll);
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let items = match tail.poll().await {
                    Ok(items) => items,
                    Err(err) => {
                        warn!(error = %err, "reading the comms surface failed");
                        continue;
                    }
                };
                for item in items {
                    match item {
                        Ok(envelope) => hub.spawn_dispatch(envelope),
                        Err(err) => {
                            warn!(error = %err, "skipping malformed comms line");
                            hub.metrics.dropped("malformed");
                        }
                    }
                }
            }
        })
    }

    async fn handle_local(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        match envelope.kind {
            Kind::Action if envelope.command_is(Builtin::Output) => {
                info!(from = %envelope.sender, output = %envelope.input, "protocol output");
                Ok(())
            }
            Kind::Request | Kind::Action => {
                let outcome = match envelope.command.as_deref() {
                    Some(command) => self.execute(command, envelope.input.clone()).await,
                    None => Err("missing command".to_string()),
                };
                if envelope.kind == Kind::Action {
                    if let Err(reason) = outcome {
                        warn!(command = ?envelope.command, %reason, "hub action failed");
                    }
                    return Ok(());
                }
                let reply = match outcome {
                    Ok(output) => Envelope::response_to(&envelope, output),
                    Err(reason) => {
                        warn!(command = ?envelope.command, %reason, "hub request failed");
                        Envelope::failure_to(&envelope, reason)
                    }
                };
                self.router.route(reply).await
            }
            Kind::Status => {
                info!(
                    sender = %envelope.sender,
                    command = ?envelope.command,
                    input = %envelope.input,
                    "status"
                );
                Ok(())
            }
            Kind::Response => {
                warn!(
                    sender = %envelope.sender,
                    message_id = %envelope.message_id,
                    "response without a pending request"
                );
                Ok(())
            }
        }
    }

    async fn execute(self: &Arc<Self>, command: &str, input: Value) -> std::result::Result<Value, String> {
        match command.parse::<Builtin>() {
            Ok(Builtin::Activate) => {
                let args: ActivateInput = parse_input(input)?;
                let worker_id = self
                    .activate(&args.script_reference, args.mother_id.as_deref(), args.input)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({ "worker_id": worker_id }))
            }
            Ok(Builtin::Deactivate) => {
                let args: DeactivateInput = parse_input(input)?;
                let terminated = self.deactivate(&args.worker_id).await;
                Ok(json!({ "terminated": terminated }))
            }
            Ok(Builtin::List) => Ok(json!({ "workers": self.snapshot() })),
            Ok(Builtin::Ping) => Ok(json!({
                "status": "ok",
                "workers": self.registry.len(),
                "time": Utc::now(),
            })),
            _ => {
                let custom = self
                    .commands
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(command)
                    .cloned();
                match custom {
                    Some(handler) => handler.execute(self, input).await,
                    None => Err(format!("unknown hub command `{command}`")),
                }
            }
        }
    }

    /// Stops the pumps, deactivates every protocol and fails whatever is
    /// still waiting for a response.
    pub async fn shutdown(&self) -> Vec<TerminatedWorker> {
        info!("hub shutting down");
        self.shutdown.cancel();
        let terminated = self.registry.shutdown().await;
        self.correlator.fail_all();
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        terminated
    }
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: Value) -> std::result::Result<T, String> {
    serde_json::from_value(input).map_err(|e| format!("invalid input: {e}"))
}

fn is_comms_address(receiver: &str) -> bool {
    receiver == address::CLIENT || receiver.starts_with(address::TAB_PREFIX)
}

struct HubLocal {
    hub: Weak<Hub>,
}

#[async_trait]
impl RouteHandler for HubLocal {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let hub = self.hub.upgrade().ok_or_else(|| ProtocolError::closed(address::HUB))?;
        hub.handle_local(envelope).await
    }
}

struct ToProtocol {
    registry: Arc<ProcessRegistry>,
}

#[async_trait]
impl RouteHandler for ToProtocol {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let worker_id = address::worker_id(&envelope.receiver)
            .ok_or_else(|| ProtocolError::UnroutableAddress { receiver: envelope.receiver.clone() })?;
        if !self.registry.contains(worker_id) {
            // it may have exited while this envelope was in flight
            warn!(
                target: ROUTE_TARGET,
                %worker_id,
                message_id = %envelope.message_id,
                "dropping envelope for unknown protocol"
            );
            return Err(ProtocolError::UnknownWorker(worker_id.to_string()));
        }
        self.registry.send_to(worker_id, &envelope).await
    }
}

struct ToComms {
    comms: CommsSurface,
}

#[async_trait]
impl RouteHandler for ToComms {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.comms.send_outbound(&envelope).await
    }
}

fn hub_router(hub: Weak<Hub>, registry: Arc<ProcessRegistry>, comms: CommsSurface) -> Router {
    let to_comms: Arc<dyn RouteHandler> = Arc::new(ToComms { comms });
    Router::new()
        .with_route(address::HUB, Arc::new(HubLocal { hub }))
        .with_route(address::WORKER_PREFIX, Arc::new(ToProtocol { registry }))
        .with_route(address::TAB_PREFIX, to_comms.clone())
        .with_route(address::CLIENT, to_comms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    async fn hub(dir: &std::path::Path) -> Arc<Hub> {
        let mut settings = HubSettings::with_root(dir);
        settings.comms_poll = Duration::from_millis(10);
        settings.request_timeout = Duration::from_millis(300);
        Hub::start(settings).await.unwrap()
    }

    /// Waits until the outbound comms file holds at least one envelope.
    async fn outbound(hub: &Hub) -> Vec<Envelope> {
        let mut tail = hub.comms().tail_outbound(0);
        for _ in 0..100 {
            let items = tail.poll().await.unwrap();
            if !items.is_empty() {
                return items.into_iter().map(|i| i.unwrap()).collect();
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("nothing written to the comms surface");
    }

    struct Greet;

    #[async_trait]
    impl HubCommand for Greet {
        async fn execute(&self, _hub: &Arc<Hub>, input: Value) -> std::result::Result<Value, String> {
            let name = input.get("name").and_then(Value::as_str).ok_or("missing `name`")?;
            Ok(json!({ "greeting": format!("hello {name}") }))
        }
    }

    #[tokio::test]
    async fn client_requests_are_answered_through_the_comms_surface() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;
        hub.register_command("greet", Arc::new(Greet));

        let req = Envelope::request("greet", json!({"name": "jarvis"}), "tab:7", "hub");
        hub.comms().send_inbound(&req).await.unwrap();

        let replies = outbound(&hub).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, Kind::Response);
        assert_eq!(replies[0].message_id, req.message_id);
        assert_eq!(replies[0].receiver, "tab:7");
        assert_eq!(replies[0].input, json!({"greeting": "hello jarvis"}));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_commands_get_a_failure_response() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;

        let req = Envelope::request("teleport", json!({}), "client", "hub");
        hub.dispatch(req.clone()).await;
        let replies = outbound(&hub).await;
        assert!(replies[0].is_failure());
        assert_eq!(replies[0].failure_reason(), Some("unknown hub command `teleport`"));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn bad_activate_input_is_reported_to_the_sender() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;

        hub.dispatch(Envelope::request("activate", json!({"script": 3}), "client", "hub"))
            .await;
        let replies = outbound(&hub).await;
        assert!(replies[0].is_failure());
        assert!(replies[0].failure_reason().unwrap().starts_with("invalid input"));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn list_and_deactivate_of_unknown_worker() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;

        hub.dispatch(Envelope::request("deactivate", json!({"worker_id": "ghost"}), "client", "hub"))
            .await;
        let replies = outbound(&hub).await;
        assert!(!replies[0].is_failure());
        assert_eq!(replies[0].input, json!({"terminated": []}));

        let list = hub.execute("list", Value::Null).await.unwrap();
        assert_eq!(list, json!({"workers": []}));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn envelopes_for_unknown_protocols_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;
        let env = Envelope::action("noop", json!({}), "client", "worker:gone_123");
        let err = hub.router.route(env).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownWorker(id) if id == "gone_123"));

        let env = Envelope::action("noop", json!({}), "client", "elsewhere");
        assert!(matches!(
            hub.router.route(env).await,
            Err(ProtocolError::UnroutableAddress { .. })
        ));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn hub_requests_to_the_client_correlate_over_comms() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;

        let pending = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.send_request("open_tab", json!({}), "client").await })
        };
        let sent = outbound(&hub).await;
        let answer = Envelope::response_to(&sent[0], json!({"tab": 4}));
        hub.comms().send_inbound(&answer).await.unwrap();

        let rsp = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap().unwrap();
        assert_eq!(rsp.message_id, sent[0].message_id);
        assert_eq!(rsp.input, json!({"tab": 4}));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;
        let err = hub.send_request("open_tab", json!({}), "tab:1").await.unwrap_err();
        assert!(matches!(err, ProtocolError::CorrelationTimeout { .. }));
        assert!(hub.correlator().is_empty());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn builtins_cannot_be_shadowed() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;
        hub.register_command("activate", Arc::new(Greet));
        let err = hub.execute("activate", json!({"name": "x"})).await.unwrap_err();
        assert!(err.starts_with("invalid input"));
        hub.shutdown().await;
    }
}
