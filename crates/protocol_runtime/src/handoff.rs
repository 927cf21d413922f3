use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::error::{ProtocolError, Result};

/// One-shot identity record a protocol receives on stdin right after spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandoff {
    pub worker_id: String,
    pub root_id: String,
    /// `None` when the hub itself activated the protocol.
    pub mother_id: Option<String>,
}

impl WorkerHandoff {
    pub fn to_line(&self) -> Result<String> {
        Ok(format!("{}\n", serde_json::to_string(self)?))
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ProtocolError::malformed("stdin closed before the handoff line"));
        }
        serde_json::from_str(line.trim()).map_err(ProtocolError::malformed)
    }

    pub async fn from_stdin() -> Result<Self> {
        let mut stdin = BufReader::new(tokio::io::stdin());
        Self::read_from(&mut stdin).await
    }
}
