use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::{ProtocolError, Result};

/// Destination for every envelope whose receiver starts with a given prefix.
#[async_trait]
pub trait RouteHandler: Send + Sync + 'static {
    async fn deliver(&self, envelope: Envelope) -> Result<()>;
}

/// Closures work as handlers, mostly handy in tests.
#[async_trait]
impl<F> RouteHandler for F
where
    F: Fn(Envelope) -> Result<()> + Send + Sync + 'static,
{
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self(envelope)
    }
}

/// Ordered `(prefix, handler)` table. The longest matching prefix wins.
#[derive(Default, Clone)]
pub struct Router {
    routes: Vec<(String, Arc<dyn RouteHandler>)>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.routes.iter().map(|(p, _)| p)).finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `prefix`, replacing an earlier registration.
    pub fn with_route(mut self, prefix: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        self.add_route(prefix, handler);
        self
    }

    pub fn add_route(&mut self, prefix: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        let prefix = prefix.into();
        self.routes.retain(|(p, _)| *p != prefix);
        self.routes.push((prefix, handler));
        // longest first, so the first hit is the best one
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(p, _)| p.as_str())
    }

    /// Prefix that would receive `receiver`, if any.
    pub fn resolve(&self, receiver: &str) -> Option<&str> {
        self.lookup(receiver).map(|(p, _)| p.as_str())
    }

    fn lookup(&self, receiver: &str) -> Option<&(String, Arc<dyn RouteHandler>)> {
        self.routes.iter().find(|(p, _)| receiver.starts_with(p.as_str()))
    }

    /// Hands `envelope` to the handler of its receiver.
    pub async fn route(&self, envelope: Envelope) -> Result<()> {
        let Some((prefix, handler)) = self.lookup(&envelope.receiver) else {
            warn!(
                receiver = %envelope.receiver,
                message_id = %envelope.message_id,
                "dropping envelope without a route"
            );
            return Err(ProtocolError::UnroutableAddress { receiver: envelope.receiver });
        };
        debug!(
            target: "route",
            %prefix,
            kind = %envelope.kind,
            command = envelope.command.as_deref().unwrap_or(""),
            sender = %envelope.sender,
            receiver = %envelope.receiver,
            message_id = %envelope.message_id,
            "routing"
        );
        handler.deliver(envelope).await
    }
}
