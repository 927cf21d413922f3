//! File based exchange with the browser side.
//!
//! Two append-only files of one JSON envelope per line: the hub appends to
//! `computer_comms.log` and tails `extension_comms.log`; the native host does
//! the opposite. Every reader keeps its own byte offset.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use protocol_runtime::{Envelope, ProtocolError, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Hub → external.
pub const OUTBOUND_FILE: &str = "computer_comms.log";
/// External → hub.
pub const INBOUND_FILE: &str = "extension_comms.log";
/// Where the native host persists its read offset into the outbound file.
pub const POSITION_FILE: &str = "last_position.log";

#[derive(Debug, Clone)]
pub struct CommsSurface {
    dir: PathBuf,
}

impl CommsSurface {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn outbound_path(&self) -> PathBuf {
        self.dir.join(OUTBOUND_FILE)
    }

    pub fn inbound_path(&self) -> PathBuf {
        self.dir.join(INBOUND_FILE)
    }

    pub fn position_path(&self) -> PathBuf {
        self.dir.join(POSITION_FILE)
    }

    /// Creates the directory and both files when missing.
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        for path in [self.outbound_path(), self.inbound_path()] {
            OpenOptions::new().create(true).append(true).open(&path).await?;
        }
        Ok(())
    }

    /// Truncates both exchange files. Readers notice and start over.
    pub async fn clear(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        for path in [self.outbound_path(), self.inbound_path()] {
            File::create(&path).await?;
        }
        debug!(dir = %self.dir.display(), "comms files cleared");
        Ok(())
    }

    pub async fn send_outbound(&self, envelope: &Envelope) -> Result<()> {
        append(&self.outbound_path(), envelope).await
    }

    pub async fn send_inbound(&self, envelope: &Envelope) -> Result<()> {
        append(&self.inbound_path(), envelope).await
    }

    pub fn tail_inbound(&self) -> CommsTail {
        CommsTail::new(self.inbound_path(), 0)
    }

    pub fn tail_outbound(&self, offset: u64) -> CommsTail {
        CommsTail::new(self.outbound_path(), offset)
    }
}

/// Appends `envelope` as one line.
pub async fn append(path: &Path, envelope: &Envelope) -> Result<()> {
    let mut line = envelope.encode()?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Reader of one exchange file that remembers how far it got.
#[derive(Debug)]
pub struct CommsTail {
    path: PathBuf,
    offset: u64,
}

impl CommsTail {
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self { path: path.into(), offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Every complete line appended since the last call. Malformed lines come
    /// back as `MalformedEnvelope` items and are consumed all the same.
    pub async fn poll(&mut self) -> Result<Vec<Result<Envelope>>> {
        self.read(None).await
    }

    /// Next complete, non-blank line, if any.
    pub async fn next(&mut self) -> Result<Option<Result<Envelope>>> {
        Ok(self.read(Some(1)).await?.pop())
    }

    async fn read(&mut self, limit: Option<usize>) -> Result<Vec<Result<Envelope>>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();
        if len < self.offset {
            debug!(path = %self.path.display(), "comms file shrank, reading from the start");
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf).await?;

        let mut items = Vec::new();
        let mut consumed = 0usize;
        for chunk in buf.split_inclusive(|b| *b == b'\n') {
            // a writer may be halfway through this one
            if !chunk.ends_with(b"\n") {
                break;
            }
            consumed += chunk.len();
            let line = String::from_utf8_lossy(chunk);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            items.push(Envelope::decode(line).map_err(ProtocolError::malformed));
            if limit.is_some_and(|limit| items.len() >= limit) {
                break;
            }
        }
        self.offset += consumed as u64;
        Ok(items)
    }
}
