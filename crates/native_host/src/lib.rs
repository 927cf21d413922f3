//! Bridge between the browser extension and the hub.
//!
//! The browser talks native messaging (length-prefixed JSON frames on
//! stdin/stdout) and polls: every frame it sends gets exactly one reply,
//! either the next envelope the hub wrote for it or an `idle` status.

use std::path::PathBuf;

use jarvis::comms::{CommsSurface, CommsTail};
use protocol_runtime::{ChannelEndpoint, Envelope, ProtocolError, Result, address};
use serde_json::json;
use tracing::{debug, info, warn};

pub const ACTIVATE: &str = "activate";
pub const KEEP_ALIVE: &str = "keep_alive";
pub const IDLE: &str = "idle";

/// Sender of the host's own replies.
pub const HOST_ADDRESS: &str = "native_host";

#[derive(Debug)]
pub struct NativeHost {
    comms: CommsSurface,
    tail: CommsTail,
}

impl NativeHost {
    /// Resumes from the offset persisted by a previous run.
    pub async fn open(comms_dir: impl Into<PathBuf>) -> Result<Self> {
        let comms = CommsSurface::new(comms_dir);
        comms.ensure().await?;
        let offset = load_offset(&comms).await;
        debug!(offset, "resuming outbound tail");
        let tail = comms.tail_outbound(offset);
        Ok(Self { comms, tail })
    }

    pub fn offset(&self) -> u64 {
        self.tail.offset()
    }

    /// Handles one frame from the browser and builds its reply.
    pub async fn handle(&mut self, envelope: Envelope) -> Result<Envelope> {
        if is_command(&envelope, ACTIVATE) {
            info!("browser side activated, starting a fresh exchange");
            self.comms.clear().await?;
            self.tail.reset();
            self.save_offset().await?;
            return Ok(idle(&envelope));
        }
        if !is_command(&envelope, KEEP_ALIVE) {
            debug!(message_id = %envelope.message_id, "forwarding to the hub");
            self.comms.send_inbound(&envelope).await?;
        }
        self.next_outbound(&envelope).await
    }

    async fn next_outbound(&mut self, trigger: &Envelope) -> Result<Envelope> {
        loop {
            let next = self.tail.next().await?;
            self.save_offset().await?;
            match next {
                None => return Ok(idle(trigger)),
                Some(Ok(envelope)) => return Ok(envelope),
                Some(Err(err)) => warn!(error = %err, "skipping unreadable hub envelope"),
            }
        }
    }

    async fn save_offset(&self) -> Result<()> {
        tokio::fs::write(self.comms.position_path(), self.tail.offset().to_string()).await?;
        Ok(())
    }

    /// Answers frames from `browser` until it closes.
    pub async fn serve(&mut self, browser: &ChannelEndpoint) -> Result<()> {
        loop {
            let envelope = match browser.receive().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    info!("browser closed the connection");
                    return Ok(());
                }
                Err(ProtocolError::MalformedEnvelope { reason }) => {
                    warn!(%reason, "ignoring malformed frame");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let reply = self.handle(envelope).await?;
            match browser.send(&reply).await {
                Ok(()) => {}
                Err(err @ ProtocolError::FrameTooLarge { .. }) => {
                    // the browser still expects an answer to its frame
                    warn!(message_id = %reply.message_id, error = %err, "reply too large for native messaging");
                    browser.send(&Envelope::status(IDLE, json!({}), HOST_ADDRESS, &reply.receiver)).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_command(envelope: &Envelope, command: &str) -> bool {
    envelope.command.as_deref() == Some(command)
}

fn idle(trigger: &Envelope) -> Envelope {
    let receiver = if trigger.sender.is_empty() { address::CLIENT } else { trigger.sender.as_str() };
    Envelope::status(IDLE, json!({}), HOST_ADDRESS, receiver)
}

async fn load_offset(comms: &CommsSurface) -> u64 {
    match tokio::fs::read_to_string(comms.position_path()).await {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(%raw, "unreadable saved offset, starting from the beginning");
            0
        }),
        Err(_) => 0,
    }
}
