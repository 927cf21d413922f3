//! Process registry and lifecycle manager.
//!
//! The hub owns one registry; every protocol runtime owns a private one for
//! the children it activates itself. Records form a forest through
//! `mother_id`; tearing a record down always tears its dependents down first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::channel::{CHANNEL_DIR_ENV, ChannelEndpoint, bind_channel};
use crate::correlator::Correlator;
use crate::envelope::{Envelope, address};
use crate::error::{ProtocolError, Result};
use crate::handoff::WorkerHandoff;
use crate::id;

/// Environment variable telling a protocol where to write its log files.
pub const LOG_DIR_ENV: &str = "JARVIS_LOG_DIR";
/// Passed down so protocols can activate children of their own.
pub const PROTOCOLS_DIR_ENV: &str = "JARVIS_PROTOCOLS_DIR";
pub const INTERPRETER_ENV: &str = "JARVIS_INTERPRETER";
pub const ACTIVATION_TIMEOUT_ENV: &str = "JARVIS_ACTIVATION_TIMEOUT_MS";
pub const GRACE_PERIOD_ENV: &str = "JARVIS_GRACE_PERIOD_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "JARVIS_REQUEST_TIMEOUT_MS";

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Directory holding the per-protocol Unix sockets.
    pub channel_dir: PathBuf,
    /// Relative script references resolve against this directory.
    pub protocols_dir: PathBuf,
    /// Runs `interpreter <script>` instead of executing the script directly.
    pub interpreter: Option<PathBuf>,
    pub activation_timeout: Duration,
    pub grace_period: Duration,
    pub reader_join_timeout: Duration,
    /// Default bound of requests a protocol sends itself.
    pub request_timeout: Duration,
    pub log_dir: Option<PathBuf>,
}

impl LifecycleConfig {
    pub fn new(channel_dir: impl Into<PathBuf>, protocols_dir: impl Into<PathBuf>) -> Self {
        Self {
            channel_dir: channel_dir.into(),
            protocols_dir: protocols_dir.into(),
            interpreter: None,
            activation_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            reader_join_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            log_dir: None,
        }
    }

    /// Settings a spawned protocol inherits from whoever activated it.
    pub fn from_env() -> Result<Self> {
        let channel_dir =
            std::env::var_os(CHANNEL_DIR_ENV).ok_or(ProtocolError::MissingEnv(CHANNEL_DIR_ENV))?;
        let protocols_dir = std::env::var_os(PROTOCOLS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::new(channel_dir, protocols_dir);
        config.interpreter = std::env::var_os(INTERPRETER_ENV).map(PathBuf::from);
        config.log_dir = std::env::var_os(LOG_DIR_ENV).map(PathBuf::from);
        if let Some(ms) = env_millis(ACTIVATION_TIMEOUT_ENV) {
            config.activation_timeout = ms;
        }
        if let Some(ms) = env_millis(GRACE_PERIOD_ENV) {
            config.grace_period = ms;
        }
        if let Some(ms) = env_millis(REQUEST_TIMEOUT_ENV) {
            config.request_timeout = ms;
        }
        Ok(config)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key).ok()?.trim().parse().ok().map(Duration::from_millis)
}

/// Who owns a registry: the hub, or a protocol acting as hub for its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Hub,
    Worker { worker_id: String, root_id: String },
}

impl Owner {
    pub fn address(&self) -> String {
        match self {
            Owner::Hub => address::HUB.to_string(),
            Owner::Worker { worker_id, .. } => address::worker(worker_id),
        }
    }

    fn id(&self) -> Option<&str> {
        match self {
            Owner::Hub => None,
            Owner::Worker { worker_id, .. } => Some(worker_id),
        }
    }
}

/// Raised by reader tasks for whatever the registry does not consume itself.
#[derive(Debug)]
pub enum InboundEvent {
    Envelope { from: String, envelope: Envelope },
    Disconnected { worker_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub script_reference: String,
    pub mother_id: Option<String>,
    pub root_id: String,
    pub ready: bool,
    pub pid: Option<u32>,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminatedWorker {
    pub worker_id: String,
    pub stopped_at: DateTime<Utc>,
}

struct ProtocolRecord {
    worker_id: String,
    script_reference: String,
    /// `None` when the registry owner activated it directly.
    mother_id: Option<String>,
    root_id: String,
    process: Option<Child>,
    pid: Option<u32>,
    channel: Arc<ChannelEndpoint>,
    ready: bool,
    reader: Option<JoinHandle<()>>,
    activated_at: DateTime<Utc>,
    stopping: bool,
}

impl ProtocolRecord {
    fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            worker_id: self.worker_id.clone(),
            script_reference: self.script_reference.clone(),
            mother_id: self.mother_id.clone(),
            root_id: self.root_id.clone(),
            ready: self.ready,
            pid: self.pid,
            activated_at: self.activated_at,
        }
    }
}

pub struct ProcessRegistry {
    owner: Owner,
    config: LifecycleConfig,
    records: Mutex<HashMap<String, ProtocolRecord>>,
    correlator: Arc<Correlator>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    removed: Notify,
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("owner", &self.owner)
            .field("workers", &self.worker_ids())
            .finish()
    }
}

impl ProcessRegistry {
    pub fn new(
        owner: Owner,
        config: LifecycleConfig,
        correlator: Arc<Correlator>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let me = Arc::new(Self {
            owner,
            config,
            records: Mutex::new(HashMap::new()),
            correlator,
            inbound: tx,
            removed: Notify::new(),
        });
        (me, rx)
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProtocolRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.lock().contains_key(worker_id)
    }

    pub fn is_ready(&self, worker_id: &str) -> bool {
        self.lock().get(worker_id).map(|r| r.ready).unwrap_or(false)
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Direct dependents of `worker_id`.
    pub fn dependents(&self, worker_id: &str) -> Vec<String> {
        self.lock()
            .values()
            .filter(|r| r.mother_id.as_deref() == Some(worker_id))
            .map(|r| r.worker_id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<WorkerSummary> {
        let mut rows: Vec<WorkerSummary> = self.lock().values().map(|r| r.summary()).collect();
        rows.sort_by(|a, b| a.activated_at.cmp(&b.activated_at));
        rows
    }

    pub fn summary(&self, worker_id: &str) -> Option<WorkerSummary> {
        self.lock().get(worker_id).map(|r| r.summary())
    }

    /// Channel of a live protocol.
    pub fn channel(&self, worker_id: &str) -> Option<Arc<ChannelEndpoint>> {
        self.lock().get(worker_id).map(|r| r.channel.clone())
    }

    pub async fn send_to(&self, worker_id: &str, envelope: &Envelope) -> Result<()> {
        let channel = self
            .channel(worker_id)
            .ok_or_else(|| ProtocolError::UnknownWorker(worker_id.to_string()))?;
        channel.send(envelope).await
    }

    /// Blocking request to one of the registry's protocols.
    pub async fn request(&self, worker_id: &str, request: Envelope, bound: Duration) -> Result<Envelope> {
        let channel = self
            .channel(worker_id)
            .ok_or_else(|| ProtocolError::UnknownWorker(worker_id.to_string()))?;
        self.correlator.send_request(&channel, request, bound).await
    }

    /// Spawns `script_reference`, hands it its identity, waits for its
    /// channel and for the `loaded` signal.
    ///
    /// `mother_id` of `None` (or the owner's own id) roots the protocol at the
    /// owner. Fails with `ActivationTimeout` when the protocol never becomes
    /// ready; it is force-killed in that case.
    pub async fn activate(&self, script_reference: &str, mother_id: Option<&str>) -> Result<String> {
        let deadline = Instant::now() + self.config.activation_timeout;
        let worker_id = id::worker_id(script_reference);
        let mother = mother_id.filter(|m| Some(*m) != self.owner.id()).map(str::to_string);
        let root_id = self.resolve_root(&worker_id, mother.as_deref())?;

        let (listener, socket_path) = bind_channel(&self.config.channel_dir, &worker_id)?;
        let mut child = match self.spawn(script_reference) {
            Ok(child) => child,
            Err(err) => {
                let _ = std::fs::remove_file(&socket_path);
                return Err(err);
            }
        };
        let pid = child.id();
        info!(%worker_id, script = script_reference, ?pid, "protocol spawned");

        let handoff = WorkerHandoff {
            worker_id: worker_id.clone(),
            root_id: root_id.clone(),
            mother_id: mother.clone().or_else(|| self.owner.id().map(str::to_string)),
        };
        if let Err(err) = write_handoff(&mut child, &handoff).await {
            let _ = std::fs::remove_file(&socket_path);
            let _ = child.kill().await;
            return Err(err);
        }

        let accepted = timeout(deadline.saturating_duration_since(Instant::now()), listener.accept()).await;
        let _ = std::fs::remove_file(&socket_path);
        let stream = match accepted {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                let _ = child.kill().await;
                return Err(err.into());
            }
            Err(_) => {
                warn!(%worker_id, "protocol never connected its channel");
                let _ = child.kill().await;
                return Err(ProtocolError::ActivationTimeout {
                    worker_id,
                    timeout: self.config.activation_timeout,
                });
            }
        };

        let channel = Arc::new(ChannelEndpoint::from_unix(worker_id.clone(), stream));
        let (ready_tx, ready_rx) = oneshot::channel();
        // the mother check and the insert share one critical section
        let orphaned = {
            let mut records = self.lock();
            let gone = mother
                .as_deref()
                .filter(|m| !records.get(*m).is_some_and(|r| !r.stopping))
                .map(str::to_string);
            match gone {
                Some(m) => Some((m, child)),
                None => {
                    let reader = tokio::spawn(read_loop(
                        worker_id.clone(),
                        channel.clone(),
                        self.correlator.clone(),
                        self.inbound.clone(),
                        ready_tx,
                    ));
                    records.insert(
                        worker_id.clone(),
                        ProtocolRecord {
                            worker_id: worker_id.clone(),
                            script_reference: script_reference.to_string(),
                            mother_id: mother,
                            root_id,
                            process: Some(child),
                            pid,
                            channel: channel.clone(),
                            ready: false,
                            reader: Some(reader),
                            activated_at: Utc::now(),
                            stopping: false,
                        },
                    );
                    None
                }
            }
        };
        if let Some((m, mut child)) = orphaned {
            warn!(%worker_id, mother = %m, "mother went away during activation");
            channel.close().await;
            let _ = child.kill().await;
            return Err(ProtocolError::UnknownWorker(m));
        }

        match timeout(deadline.saturating_duration_since(Instant::now()), ready_rx).await {
            Ok(Ok(())) => {
                if let Some(rec) = self.lock().get_mut(&worker_id) {
                    rec.ready = true;
                }
                info!(%worker_id, "protocol loaded");
                Ok(worker_id)
            }
            Ok(Err(_)) => {
                warn!(%worker_id, "channel closed before the protocol loaded");
                self.teardown(&worker_id, true).await;
                Err(ProtocolError::closed(&worker_id))
            }
            Err(_) => {
                warn!(%worker_id, "protocol did not load in time, killing it");
                self.teardown(&worker_id, true).await;
                Err(ProtocolError::ActivationTimeout {
                    worker_id,
                    timeout: self.config.activation_timeout,
                })
            }
        }
    }

    fn resolve_root(&self, worker_id: &str, mother: Option<&str>) -> Result<String> {
        match mother {
            None => Ok(match &self.owner {
                Owner::Hub => worker_id.to_string(),
                Owner::Worker { root_id, .. } => root_id.clone(),
            }),
            Some(m) => match self.lock().get(m) {
                Some(rec) if !rec.stopping => Ok(rec.root_id.clone()),
                _ => Err(ProtocolError::UnknownWorker(m.to_string())),
            },
        }
    }

    fn spawn(&self, script_reference: &str) -> Result<Child> {
        let script = self.config.protocols_dir.join(script_reference);
        let mut cmd = match &self.config.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&script);
                cmd
            }
            None => Command::new(&script),
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .env(CHANNEL_DIR_ENV, &self.config.channel_dir)
            .env(PROTOCOLS_DIR_ENV, &self.config.protocols_dir)
            .env(ACTIVATION_TIMEOUT_ENV, self.config.activation_timeout.as_millis().to_string())
            .env(GRACE_PERIOD_ENV, self.config.grace_period.as_millis().to_string())
            .env(REQUEST_TIMEOUT_ENV, self.config.request_timeout.as_millis().to_string())
            .kill_on_drop(true);
        if let Some(interpreter) = &self.config.interpreter {
            cmd.env(INTERPRETER_ENV, interpreter);
        }
        if let Some(dir) = &self.config.log_dir {
            cmd.env(LOG_DIR_ENV, dir);
        }
        cmd.spawn().map_err(|source| ProtocolError::Spawn {
            script: script.display().to_string(),
            source,
        })
    }

    /// Tears `worker_id` down after all of its dependents.
    ///
    /// Returns the terminated protocols in termination order. Unknown ids are
    /// reported and yield an empty list.
    pub fn deactivate<'a>(&'a self, worker_id: &'a str) -> BoxFuture<'a, Vec<TerminatedWorker>> {
        Box::pin(async move {
            {
                let mut records = self.lock();
                match records.get_mut(worker_id) {
                    None => {
                        warn!(%worker_id, "deactivate: protocol does not exist");
                        return Vec::new();
                    }
                    Some(rec) if rec.stopping => {
                        debug!(%worker_id, "deactivate: already stopping");
                        return Vec::new();
                    }
                    Some(rec) => rec.stopping = true,
                }
            }

            let mut terminated = Vec::new();
            for dependent in self.dependents(worker_id) {
                terminated.extend(self.deactivate(&dependent).await);
            }
            self.wait_for_dependents(worker_id).await;

            if let Some(done) = self.teardown(worker_id, false).await {
                terminated.push(done);
            }
            terminated
        })
    }

    /// Dependents torn down by a concurrent caller still count.
    async fn wait_for_dependents(&self, worker_id: &str) {
        let bound = self.config.grace_period + self.config.reader_join_timeout;
        loop {
            let removed = self.removed.notified();
            if self.dependents(worker_id).is_empty() {
                return;
            }
            if timeout(bound, removed).await.is_err() {
                warn!(%worker_id, "dependents still present after waiting, continuing teardown");
                return;
            }
        }
    }

    async fn teardown(&self, worker_id: &str, force: bool) -> Option<TerminatedWorker> {
        let (channel, child, reader) = {
            let mut records = self.lock();
            let rec = records.get_mut(worker_id)?;
            rec.stopping = true;
            (rec.channel.clone(), rec.process.take(), rec.reader.take())
        };

        channel.close().await;
        self.correlator.fail_peer(worker_id);

        if let Some(child) = child {
            terminate(worker_id, child, force, self.config.grace_period).await;
        }

        if let Some(reader) = reader {
            let abort = reader.abort_handle();
            if timeout(self.config.reader_join_timeout, reader).await.is_err() {
                warn!(%worker_id, "reader task did not finish, aborting it");
                abort.abort();
            }
        }

        self.lock().remove(worker_id);
        self.removed.notify_waiters();
        info!(%worker_id, "protocol deactivated");
        Some(TerminatedWorker { worker_id: worker_id.to_string(), stopped_at: Utc::now() })
    }

    /// Reacts to a channel that closed underneath us: the protocol is gone,
    /// so it and its dependents are deactivated.
    pub async fn handle_disconnect(&self, worker_id: &str) -> Vec<TerminatedWorker> {
        let live = self.lock().get(worker_id).is_some_and(|r| !r.stopping);
        if !live {
            return Vec::new();
        }
        warn!(%worker_id, "protocol channel closed unexpectedly");
        self.deactivate(worker_id).await
    }

    /// Deactivates every protocol rooted at the owner.
    pub async fn shutdown(&self) -> Vec<TerminatedWorker> {
        let roots: Vec<String> = self
            .lock()
            .values()
            .filter(|r| r.mother_id.is_none())
            .map(|r| r.worker_id.clone())
            .collect();
        let mut terminated = Vec::new();
        for root in roots {
            terminated.extend(self.deactivate(&root).await);
        }
        // orphans whose mother vanished concurrently
        for leftover in self.worker_ids() {
            terminated.extend(self.deactivate(&leftover).await);
        }
        terminated
    }
}

async fn write_handoff(child: &mut Child, handoff: &WorkerHandoff) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| ProtocolError::closed(&handoff.worker_id))?;
    stdin.write_all(handoff.to_line()?.as_bytes()).await?;
    stdin.flush().await?;
    drop(stdin);
    Ok(())
}

/// SIGTERM, wait for the grace period, then SIGKILL.
async fn terminate(worker_id: &str, mut child: Child, force: bool, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(%worker_id, %status, "protocol already exited");
        return;
    }
    if !force {
        if let Some(pid) = child.id() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(%worker_id, pid, error = %e, "failed to send SIGTERM");
                }
            }
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(%worker_id, %status, "protocol exited");
                    return;
                }
                Ok(Err(e)) => warn!(%worker_id, error = %e, "waiting for protocol failed"),
                Err(_) => warn!(%worker_id, "protocol ignored SIGTERM, killing it"),
            }
        }
    }
    if let Err(e) = child.kill().await {
        warn!(%worker_id, error = %e, "failed to kill protocol");
    }
}

/// Drains one protocol channel: readiness and correlated responses are
/// consumed here, everything else goes to the owner's inbound queue.
async fn read_loop(
    worker_id: String,
    channel: Arc<ChannelEndpoint>,
    correlator: Arc<Correlator>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    loop {
        match channel.receive().await {
            Ok(Some(envelope)) => {
                if envelope.is_loaded() && address::worker_id(&envelope.sender) == Some(&worker_id) {
                    match ready_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(());
                        }
                        None => debug!(%worker_id, "duplicate loaded signal"),
                    }
                    continue;
                }
                if let Some(envelope) = correlator.resolve(envelope) {
                    let _ = inbound.send(InboundEvent::Envelope { from: worker_id.clone(), envelope });
                }
            }
            Ok(None) => break,
            Err(ProtocolError::MalformedEnvelope { reason }) => {
                warn!(%worker_id, %reason, "skipping malformed envelope");
            }
            Err(err) => {
                warn!(%worker_id, error = %err, "channel failed");
                break;
            }
        }
    }
    correlator.fail_peer(&worker_id);
    let _ = inbound.send(InboundEvent::Disconnected { worker_id });
}
