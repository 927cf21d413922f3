use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong between the hub, its protocols and the client.
///
/// Transport failures surface as [`ProtocolError::ChannelClosed`]; protocol
/// level failures are answered to the sender as failure responses.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol `{worker_id}` did not signal ready within {timeout:?}")]
    ActivationTimeout { worker_id: String, timeout: Duration },

    #[error("channel to `{peer}` is closed")]
    ChannelClosed { peer: String },

    #[error("no response to `{message_id}` within {timeout:?}")]
    CorrelationTimeout { message_id: String, timeout: Duration },

    #[error("no route for receiver `{receiver}`")]
    UnroutableAddress { receiver: String },

    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    #[error("unknown protocol `{0}`")]
    UnknownWorker(String),

    #[error("request `{0}` is already in flight")]
    DuplicateRequest(String),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// A peer answered with a failure response.
    #[error("`{command}` was rejected: {reason}")]
    Rejected { command: String, reason: String },

    #[error("environment variable `{0}` is not set")]
    MissingEnv(&'static str),

    #[error("could not spawn `{script}`: {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn closed(peer: impl Into<String>) -> Self {
        ProtocolError::ChannelClosed { peer: peer.into() }
    }

    pub fn malformed(reason: impl ToString) -> Self {
        ProtocolError::MalformedEnvelope { reason: reason.to_string() }
    }
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
