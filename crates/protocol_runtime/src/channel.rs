//! Bidirectional, message framed connection between two parties.
//!
//! One endpoint type serves both boundaries:
//! * [`Framing::Lines`]: one JSON envelope per line, used on the hub ↔
//!   protocol Unix sockets.
//! * [`Framing::LengthPrefixed`]: 4-byte little-endian length followed by the
//!   UTF-8 JSON payload, used between the native host and the browser.
//!
//! `close()` may race a blocked `receive()`; the receiver then sees a clean
//! `Ok(None)`.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::envelope::Envelope;
use crate::error::{ProtocolError, Result};
use crate::id::ID_LEN;

/// Upper bound for a single length-prefixed frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Environment variable carrying the directory that holds channel sockets.
pub const CHANNEL_DIR_ENV: &str = "JARVIS_CHANNEL_DIR";

type BoxedReader = BufReader<Pin<Box<dyn AsyncRead + Send>>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Lines,
    LengthPrefixed,
}

pub struct ChannelEndpoint {
    peer: String,
    framing: Framing,
    reader: Mutex<BoxedReader>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("peer", &self.peer)
            .field("framing", &self.framing)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl ChannelEndpoint {
    pub fn new<R, W>(peer: impl Into<String>, framing: Framing, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(reader);
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            peer: peer.into(),
            framing,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        }
    }

    /// Line framed endpoint over a connected Unix socket.
    pub fn from_unix(peer: impl Into<String>, stream: UnixStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self::new(peer, Framing::Lines, rd, wr)
    }

    /// Length-prefixed endpoint over this process' stdin/stdout.
    pub fn native_stdio(peer: impl Into<String>) -> Self {
        Self::new(peer, Framing::LengthPrefixed, tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close()` has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Writes one envelope. A blocked write gives up as soon as the channel
    /// is closed. An oversized frame is refused and the channel stays open.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::closed(&self.peer));
        }
        let payload = envelope.encode()?;
        if self.framing == Framing::LengthPrefixed && payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { size: payload.len(), max: MAX_FRAME_LEN });
        }
        let written = tokio::select! {
            _ = self.closed.cancelled() => return Err(ProtocolError::closed(&self.peer)),
            written = self.write(&payload) => written,
        };
        if let Err(err) = written {
            debug!(peer = %self.peer, error = %err, "write failed, closing channel");
            self.close().await;
            return Err(ProtocolError::closed(&self.peer));
        }
        trace!(peer = %self.peer, message_id = %envelope.message_id, "sent");
        Ok(())
    }

    async fn write(&self, payload: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| ProtocolError::closed(&self.peer))?;
        match self.framing {
            Framing::Lines => write_line(writer, payload).await,
            Framing::LengthPrefixed => write_frame(writer, payload.as_bytes()).await,
        }
    }

    /// Next envelope, `Ok(None)` once the channel is closed by either side.
    ///
    /// A frame that is not a valid envelope yields `MalformedEnvelope`; the
    /// channel stays usable and the caller may keep reading.
    pub async fn receive(&self) -> Result<Option<Envelope>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        let frame = tokio::select! {
            _ = self.closed.cancelled() => return Ok(None),
            frame = read_frame(&mut reader, self.framing) => frame,
        };
        match frame {
            Ok(Some(raw)) => Envelope::decode(&raw).map(Some).map_err(ProtocolError::malformed),
            Ok(None) => {
                self.closed.cancel();
                Ok(None)
            }
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                // the stream is out of sync after an oversized frame
                self.closed.cancel();
                Err(ProtocolError::FrameTooLarge { size, max })
            }
            Err(ProtocolError::MalformedEnvelope { reason }) => {
                Err(ProtocolError::MalformedEnvelope { reason })
            }
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "read failed, treating channel as closed");
                self.closed.cancel();
                Ok(None)
            }
        }
    }

    /// Idempotent; safe to call while other tasks are blocked in `receive`
    /// or `send`. Those see the cancellation and release the writer.
    pub async fn close(&self) {
        self.closed.cancel();
        let shutdown = async {
            let writer = self.writer.lock().await.take();
            if let Some(mut writer) = writer {
                let _ = writer.shutdown().await;
                debug!(peer = %self.peer, "channel closed");
            }
        };
        if timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            warn!(peer = %self.peer, "writer did not shut down in time, leaving it to drop");
        }
    }
}

async fn write_line(writer: &mut BoxedWriter, payload: &str) -> Result<()> {
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { size: payload.len(), max: MAX_FRAME_LEN });
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame; `Ok(None)` on a clean end of stream.
pub async fn read_length_prefixed<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = u32::from_le_bytes(len) as usize;
    if size > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { size, max: MAX_FRAME_LEN });
    }
    let mut buf = vec![0u8; size];
    match reader.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    String::from_utf8(buf).map(Some).map_err(ProtocolError::malformed)
}

async fn read_frame(reader: &mut BoxedReader, framing: Framing) -> Result<Option<String>> {
    match framing {
        Framing::LengthPrefixed => read_length_prefixed(reader).await,
        Framing::Lines => {
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(None);
                }
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    return Ok(Some(trimmed.to_string()));
                }
            }
        }
    }
}

/// Socket path of a protocol's channel, derived from its id alone so the
/// child can find it without a discovery step.
pub fn channel_path(dir: &Path, worker_id: &str) -> PathBuf {
    let tail_start = worker_id.len().saturating_sub(ID_LEN);
    let tail: String = worker_id[tail_start..]
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!("{tail}.sock"))
}

/// Binds the listening side of a fresh channel, replacing a stale socket.
pub fn bind_channel(dir: &Path, worker_id: &str) -> Result<(UnixListener, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let path = channel_path(dir, worker_id);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    Ok((listener, path))
}

/// Child side: the listener may not be bound yet when the child starts.
pub async fn connect_with_retry(path: &Path, attempts: u32, delay: Duration) -> Result<UnixStream> {
    let mut last = None;
    for attempt in 0..attempts.max(1) {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                trace!(attempt, path = %path.display(), error = %err, "channel not ready");
                last = Some(err);
                sleep(delay).await;
            }
        }
    }
    Err(last
        .map(ProtocolError::Io)
        .unwrap_or_else(|| ProtocolError::closed(path.display().to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn pair(framing: Framing) -> (ChannelEndpoint, ChannelEndpoint) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            ChannelEndpoint::new("b", framing, ar, aw),
            ChannelEndpoint::new("a", framing, br, bw),
        )
    }

    #[tokio::test]
    async fn delivers_in_send_order_for_both_framings() {
        for framing in [Framing::Lines, Framing::LengthPrefixed] {
            let (a, b) = pair(framing);
            for i in 0..5 {
                let env = Envelope::status("tick", json!(i), "a", "b");
                a.send(&env).await.unwrap();
            }
            for i in 0..5 {
                let env = b.receive().await.unwrap().unwrap();
                assert_eq!(env.input, json!(i));
            }
        }
    }

    #[tokio::test]
    async fn close_unblocks_pending_receive() {
        let (a, _b) = pair(Framing::Lines);
        let a = Arc::new(a);
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await;
        a.close().await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(got, Ok(None)));
        assert!(matches!(
            a.send(&Envelope::status("x", json!(null), "a", "b")).await,
            Err(ProtocolError::ChannelClosed { .. })
        ));
    }

    #[tokio::test]
    async fn peer_close_is_end_of_channel() {
        let (a, b) = pair(Framing::LengthPrefixed);
        a.close().await;
        drop(a);
        assert!(b.receive().await.unwrap().is_none());
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn malformed_line_is_skippable() {
        let (a, b) = duplex(1024);
        let (_ar, mut aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let ep = ChannelEndpoint::new("a", Framing::Lines, br, bw);
        let good = Envelope::action("go", json!({}), "a", "b");
        aw.write_all(b"{not json}\n\n").await.unwrap();
        aw.write_all(format!("{}\n", good.encode().unwrap()).as_bytes()).await.unwrap();

        assert!(matches!(ep.receive().await, Err(ProtocolError::MalformedEnvelope { .. })));
        assert_eq!(ep.receive().await.unwrap().unwrap(), good);
    }

    #[tokio::test]
    async fn length_prefix_is_little_endian() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, br#"{"a":1}"#).await.unwrap();
        assert_eq!(&buf[..4], &[7, 0, 0, 0]);
        let mut rd = &buf[..];
        assert_eq!(read_length_prefixed(&mut rd).await.unwrap().unwrap(), r#"{"a":1}"#);
        assert!(read_length_prefixed(&mut rd).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let bytes = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        let mut rd = &bytes[..];
        assert!(matches!(
            read_length_prefixed(&mut rd).await,
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn close_releases_a_send_blocked_on_a_silent_peer() {
        // the peer never reads, so a 4 KiB write cannot fit a 64 byte pipe
        let (a, _b) = duplex(64);
        let (ar, aw) = tokio::io::split(a);
        let ep = Arc::new(ChannelEndpoint::new("silent", Framing::Lines, ar, aw));
        let blocked = {
            let ep = ep.clone();
            tokio::spawn(async move {
                let big = Envelope::status("blob", json!("x".repeat(4096)), "a", "b");
                ep.send(&big).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        tokio::time::timeout(Duration::from_secs(3), ep.close()).await.unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert!(matches!(sent, Err(ProtocolError::ChannelClosed { .. })));
    }

    #[tokio::test]
    async fn oversized_send_leaves_the_channel_open() {
        let (a, b) = pair(Framing::LengthPrefixed);
        let huge = Envelope::status("blob", json!("x".repeat(MAX_FRAME_LEN)), "a", "b");
        assert!(matches!(a.send(&huge).await, Err(ProtocolError::FrameTooLarge { .. })));
        assert!(!a.is_closed());

        let small = Envelope::status("tick", json!(1), "a", "b");
        a.send(&small).await.unwrap();
        assert_eq!(b.receive().await.unwrap().unwrap(), small);
    }

    #[tokio::test]
    async fn unix_channel_connects_after_bind() {
        let dir = tempfile::tempdir().unwrap();
        let id = crate::id::worker_id("proto");
        let (listener, path) = bind_channel(dir.path(), &id).unwrap();
        assert_eq!(path, channel_path(dir.path(), &id));

        let client = tokio::spawn(async move {
            connect_with_retry(&path, 10, Duration::from_millis(10)).await.unwrap()
        });
        let (server, _) = listener.accept().await.unwrap();
        let server = ChannelEndpoint::from_unix("child", server);
        let client = ChannelEndpoint::from_unix("hub", client.await.unwrap());

        let env = Envelope::loaded("worker:x", "hub");
        client.send(&env).await.unwrap();
        assert_eq!(server.receive().await.unwrap().unwrap(), env);
    }

    #[tokio::test]
    async fn connect_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        assert!(connect_with_retry(&path, 2, Duration::from_millis(1)).await.is_err());
    }
}
