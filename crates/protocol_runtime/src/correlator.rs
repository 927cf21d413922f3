use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::channel::ChannelEndpoint;
use crate::envelope::{Envelope, Kind};
use crate::error::{ProtocolError, Result};

type Slot = oneshot::Sender<Result<Envelope>>;

struct PendingRequest {
    request: Envelope,
    peer: String,
    slot: Slot,
}

/// Pairs outgoing requests with the responses that come back on any channel.
///
/// Registration always happens before the request is written so a fast
/// response can never overtake it.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator").field("pending", &self.len()).finish()
    }
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.lock().map(|p| p.contains_key(message_id)).unwrap_or(false)
    }

    /// Registers `request` as awaiting a response from `peer`.
    pub fn register(&self, request: &Envelope, peer: &str) -> Result<oneshot::Receiver<Result<Envelope>>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&request.message_id) {
            return Err(ProtocolError::DuplicateRequest(request.message_id.clone()));
        }
        pending.insert(
            request.message_id.clone(),
            PendingRequest { request: request.clone(), peer: peer.to_string(), slot: tx },
        );
        Ok(rx)
    }

    /// Hands `response` to its waiter. Gives the envelope back when nothing
    /// is waiting for it so the caller can report or route it.
    pub fn resolve(&self, response: Envelope) -> Option<Envelope> {
        if response.kind != Kind::Response {
            return Some(response);
        }
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&response.message_id);
        match entry {
            Some(pending) => {
                debug!(
                    message_id = %response.message_id,
                    command = ?pending.request.command,
                    "response correlated"
                );
                // a dropped receiver means the waiter gave up already
                let _ = pending.slot.send(Ok(response));
                None
            }
            None => Some(response),
        }
    }

    /// Drops a registration without resolving it.
    pub fn cancel(&self, message_id: &str) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(message_id);
    }

    /// Fails every request sent to `peer` with `ChannelClosed`.
    pub fn fail_peer(&self, peer: &str) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.peer == peer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = failed.len();
        for pending in failed {
            let _ = pending.slot.send(Err(ProtocolError::closed(peer)));
        }
        if count > 0 {
            warn!(peer, count, "failed pending requests on closed channel");
        }
        count
    }

    /// Fails everything still pending, used on shutdown.
    pub fn fail_all(&self) {
        let drained: Vec<PendingRequest> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, p)| p)
            .collect();
        for pending in drained {
            let _ = pending.slot.send(Err(ProtocolError::closed(&pending.peer)));
        }
    }

    /// Waits for a registration made with [`Correlator::register`].
    pub async fn wait(
        &self,
        message_id: &str,
        peer: &str,
        rx: oneshot::Receiver<Result<Envelope>>,
        bound: Duration,
    ) -> Result<Envelope> {
        self.wait_until(message_id, peer, rx, Instant::now() + bound, bound).await
    }

    async fn wait_until(
        &self,
        message_id: &str,
        peer: &str,
        rx: oneshot::Receiver<Result<Envelope>>,
        deadline: Instant,
        bound: Duration,
    ) -> Result<Envelope> {
        match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::closed(peer)),
            Err(_) => Err(self.timed_out(message_id, bound)),
        }
    }

    fn timed_out(&self, message_id: &str, bound: Duration) -> ProtocolError {
        self.cancel(message_id);
        ProtocolError::CorrelationTimeout {
            message_id: message_id.to_string(),
            timeout: bound,
        }
    }

    /// Sends `request` over `channel` and blocks the calling task until the
    /// matching response, a closed channel, or `bound` elapses. The bound
    /// covers the write too, so a peer that stopped reading cannot stall it.
    pub async fn send_request(
        &self,
        channel: &ChannelEndpoint,
        request: Envelope,
        bound: Duration,
    ) -> Result<Envelope> {
        let deadline = Instant::now() + bound;
        let peer = channel.peer().to_string();
        let rx = self.register(&request, &peer)?;
        match timeout_at(deadline, channel.send(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.cancel(&request.message_id);
                return Err(err);
            }
            Err(_) => {
                warn!(%peer, message_id = %request.message_id, "request could not be written in time");
                return Err(self.timed_out(&request.message_id, bound));
            }
        }
        self.wait_until(&request.message_id, &peer, rx, deadline, bound).await
    }

    /// Non-blocking variant: `on_response` runs once with the outcome.
    pub fn send_request_async<F>(
        self: &Arc<Self>,
        channel: Arc<ChannelEndpoint>,
        request: Envelope,
        bound: Duration,
        on_response: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<Envelope>) + Send + 'static,
    {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = me.send_request(&channel, request, bound).await;
            on_response(outcome);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Framing;
    use serde_json::json;
    use tokio::io::duplex;

    fn pair() -> (Arc<ChannelEndpoint>, Arc<ChannelEndpoint>) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Arc::new(ChannelEndpoint::new("worker", Framing::Lines, ar, aw)),
            Arc::new(ChannelEndpoint::new("hub", Framing::Lines, br, bw)),
        )
    }

    /// Answers every request on `ep` with `{"status":"ok"}`.
    fn echo_peer(ep: Arc<ChannelEndpoint>) {
        tokio::spawn(async move {
            while let Ok(Some(req)) = ep.receive().await {
                let rsp = Envelope::response_to(&req, json!({"status": "ok"}));
                let _ = ep.send(&rsp).await;
            }
        });
    }

    /// Reader side of the caller: feeds responses into the correlator.
    fn reader(ep: Arc<ChannelEndpoint>, corr: Arc<Correlator>) {
        tokio::spawn(async move {
            while let Ok(Some(env)) = ep.receive().await {
                corr.resolve(env);
            }
            corr.fail_peer(ep.peer());
        });
    }

    #[tokio::test]
    async fn response_matches_request_id() {
        let (hub, worker) = pair();
        let corr = Correlator::new();
        echo_peer(worker);
        reader(hub.clone(), corr.clone());

        let req = Envelope::request("start", json!({}), "hub", "worker:w").with_message_id("abc");
        let rsp = corr.send_request(&hub, req, Duration::from_secs(2)).await.unwrap();
        assert_eq!(rsp.message_id, "abc");
        assert_eq!(rsp.input, json!({"status": "ok"}));
        assert!(corr.is_empty());
    }

    #[tokio::test]
    async fn silence_times_out_and_unregisters() {
        let (hub, _worker) = pair();
        let corr = Correlator::new();
        let req = Envelope::request("hang", json!({}), "hub", "worker:w");
        let id = req.message_id.clone();
        let err = corr.send_request(&hub, req, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::CorrelationTimeout { .. }));
        assert!(!corr.is_pending(&id));
    }

    #[tokio::test]
    async fn peer_that_stopped_reading_cannot_stall_the_bound() {
        let (a, _b) = duplex(64);
        let (ar, aw) = tokio::io::split(a);
        let hub = ChannelEndpoint::new("worker", Framing::Lines, ar, aw);
        let corr = Correlator::new();
        let req = Envelope::request("blob", json!("x".repeat(4096)), "hub", "worker:w");
        let id = req.message_id.clone();

        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            corr.send_request(&hub, req, Duration::from_millis(100)),
        )
        .await
        .expect("send_request outlived its bound");
        assert!(matches!(outcome, Err(ProtocolError::CorrelationTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!corr.is_pending(&id));
    }

    #[tokio::test]
    async fn closed_peer_fails_waiters() {
        let (hub, worker) = pair();
        let corr = Correlator::new();
        reader(hub.clone(), corr.clone());

        let req = Envelope::request("hang", json!({}), "hub", "worker:w");
        let waiting = {
            let corr = corr.clone();
            let hub = hub.clone();
            tokio::spawn(async move { corr.send_request(&hub, req, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        worker.close().await;
        drop(worker);

        let res = tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
        assert!(matches!(res, Err(ProtocolError::ChannelClosed { .. })));
    }

    #[tokio::test]
    async fn unmatched_response_is_handed_back() {
        let corr = Correlator::new();
        let req = Envelope::request("x", json!({}), "hub", "worker:w");
        let stray = Envelope::response_to(&req, json!(1));
        assert_eq!(corr.resolve(stray.clone()), Some(stray));

        let action = Envelope::action("x", json!({}), "a", "b");
        assert!(corr.resolve(action).is_some());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let corr = Correlator::new();
        let req = Envelope::request("x", json!({}), "hub", "worker:w");
        let _rx = corr.register(&req, "w").unwrap();
        assert!(matches!(corr.register(&req, "w"), Err(ProtocolError::DuplicateRequest(_))));
    }

    #[tokio::test]
    async fn async_variant_calls_back() {
        let (hub, worker) = pair();
        let corr = Correlator::new();
        echo_peer(worker);
        reader(hub.clone(), corr.clone());

        let (tx, rx) = oneshot::channel();
        let req = Envelope::request("start", json!({}), "hub", "worker:w");
        let id = req.message_id.clone();
        corr.send_request_async(hub, req, Duration::from_secs(2), move |res| {
            let _ = tx.send(res.map(|r| r.message_id));
        });
        assert_eq!(rx.await.unwrap().unwrap(), id);
    }
}
