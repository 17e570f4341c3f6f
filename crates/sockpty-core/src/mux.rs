//! Framed channel multiplexer over one unix-socket connection.
//!
//! Carves a single stream into independently ordered logical channels.
//! Every channel is announced with an explicit role tag and delivered to
//! the accepting side in exactly the order the peer opened it, so a role
//! mismatch fails the session instead of silently cross-wiring streams.
//!
//! Frames are `kind (u8) | channel (u32 LE) | len (u32 LE) | payload`.
//! Payloads of one channel arrive in order and uncorrupted; distinct
//! channels are independent. A full per-channel queue exerts backpressure
//! on the whole connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// Largest frame payload either side will accept.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const FRAME_HEADER_LEN: usize = 9;
const FRAME_OPEN: u8 = 0;
const FRAME_DATA: u8 = 1;
const FRAME_CLOSE: u8 = 2;

/// Frames buffered per channel before the reader stalls the connection.
const CHANNEL_QUEUE: usize = 64;

/// Pending accepted channels before the reader stalls the connection.
const ACCEPT_QUEUE: usize = 8;

/// Role a logical channel plays within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Spawn negotiation and final exit status
    Info,
    /// Resize events
    Control,
    /// Raw terminal bytes, both directions
    Data,
}

impl ChannelRole {
    fn tag(self) -> u8 {
        match self {
            ChannelRole::Info => 0,
            ChannelRole::Control => 1,
            ChannelRole::Data => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ChannelRole::Info),
            1 => Some(ChannelRole::Control),
            2 => Some(ChannelRole::Data),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Info => write!(f, "info"),
            ChannelRole::Control => write!(f, "control"),
            ChannelRole::Data => write!(f, "data"),
        }
    }
}

/// Errors surfaced by the multiplexer.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The underlying connection is gone; every pending operation on the
    /// session resolves to this.
    #[error("transport closed")]
    Closed,
    /// The peer opened a channel with a different role than this side
    /// expected at this point in the handshake.
    #[error("channel role mismatch: expected {expected}, peer opened {actual}")]
    RoleMismatch {
        expected: ChannelRole,
        actual: ChannelRole,
    },
}

enum Frame {
    Open { channel: u32, role: ChannelRole },
    Data { channel: u32, payload: Bytes },
    Close { channel: u32 },
}

type InboundMap = Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>;

/// One multiplexed session over a connected unix stream.
///
/// Dropping the session (together with every channel handle) shuts the
/// write half down; the peer observes end-of-stream on all channels.
pub struct MuxSession {
    frame_tx: mpsc::Sender<Frame>,
    accept_rx: mpsc::Receiver<Channel>,
    next_id: AtomicU32,
    inbound: InboundMap,
}

impl MuxSession {
    /// Wrap the dialing side of a connection. Channels opened here get odd
    /// ids so they can never collide with the peer's.
    pub fn client(stream: UnixStream) -> Self {
        Self::new(stream, 1)
    }

    /// Wrap the accepting side of a connection.
    pub fn server(stream: UnixStream) -> Self {
        Self::new(stream, 2)
    }

    fn new(stream: UnixStream, first_id: u32) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::channel(CHANNEL_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
        let inbound: InboundMap = Arc::new(Mutex::new(HashMap::new()));

        // The reader only holds a weak writer handle: once every channel
        // and the session itself are gone, the writer drains and shuts
        // down instead of being kept alive by its own demultiplexer.
        tokio::spawn(write_loop(write_half, frame_rx));
        tokio::spawn(read_loop(
            read_half,
            inbound.clone(),
            accept_tx,
            frame_tx.downgrade(),
        ));

        Self {
            frame_tx,
            accept_rx,
            next_id: AtomicU32::new(first_id),
            inbound,
        }
    }

    /// Open a new channel and announce its role to the peer.
    pub async fn open(&self, role: ChannelRole) -> Result<Channel, MuxError> {
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
        self.inbound.lock().insert(id, tx);
        self.frame_tx
            .send(Frame::Open { channel: id, role })
            .await
            .map_err(|_| MuxError::Closed)?;
        Ok(Channel::new(id, role, self.frame_tx.clone(), rx))
    }

    /// Accept the next channel the peer opened, in open order.
    pub async fn accept(&mut self) -> Result<Channel, MuxError> {
        self.accept_rx.recv().await.ok_or(MuxError::Closed)
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    inbound: InboundMap,
    accept_tx: mpsc::Sender<Channel>,
    frame_tx: mpsc::WeakSender<Frame>,
) {
    let mut header = [0u8; FRAME_HEADER_LEN];
    loop {
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        let kind = header[0];
        let channel = u32::from_le_bytes(header[1..5].try_into().unwrap());
        let len = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            tracing::warn!("oversized frame ({len} bytes) on channel {channel}");
            break;
        }
        let mut payload = vec![0u8; len];
        if len > 0 && read_half.read_exact(&mut payload).await.is_err() {
            break;
        }
        match kind {
            FRAME_OPEN => {
                let Some(role) = payload.first().copied().and_then(ChannelRole::from_tag) else {
                    tracing::warn!("open frame without a valid role tag on channel {channel}");
                    break;
                };
                // No strong writer handle left means every local owner is
                // gone; nobody can accept or answer on this channel.
                let Some(writer) = frame_tx.upgrade() else {
                    break;
                };
                let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
                inbound.lock().insert(channel, tx);
                let accepted = Channel::new(channel, role, writer, rx);
                if accept_tx.send(accepted).await.is_err() {
                    // Session handle is gone; nobody will accept this one.
                    inbound.lock().remove(&channel);
                }
            }
            FRAME_DATA => {
                let tx = inbound.lock().get(&channel).cloned();
                if let Some(tx) = tx {
                    if tx.send(Bytes::from(payload)).await.is_err() {
                        inbound.lock().remove(&channel);
                    }
                }
            }
            FRAME_CLOSE => {
                inbound.lock().remove(&channel);
            }
            other => {
                tracing::warn!("unknown frame kind {other}");
                break;
            }
        }
    }
    // Connection gone: every receiver sees end-of-stream.
    inbound.lock().clear();
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut frame_rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = frame_rx.recv().await {
        let (kind, channel, payload) = match &frame {
            Frame::Open { channel, role } => {
                (FRAME_OPEN, *channel, Bytes::copy_from_slice(&[role.tag()]))
            }
            Frame::Data { channel, payload } => (FRAME_DATA, *channel, payload.clone()),
            Frame::Close { channel } => (FRAME_CLOSE, *channel, Bytes::new()),
        };
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.push(kind);
        buf.extend_from_slice(&channel.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        if write_half.write_all(&buf).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// One logical channel: a send half and a receive half.
#[derive(Debug)]
pub struct Channel {
    tx: ChannelSender,
    rx: ChannelReceiver,
}

impl Channel {
    fn new(id: u32, role: ChannelRole, frame_tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            tx: ChannelSender {
                id,
                role,
                frame_tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx: ChannelReceiver { role, rx },
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.tx.role
    }

    /// Fail fast unless the peer opened this channel with the given role.
    pub fn expect_role(self, expected: ChannelRole) -> Result<Self, MuxError> {
        if self.tx.role == expected {
            Ok(self)
        } else {
            Err(MuxError::RoleMismatch {
                expected,
                actual: self.tx.role,
            })
        }
    }

    /// Send one message on this channel.
    pub async fn send(&self, payload: &[u8]) -> Result<(), MuxError> {
        self.tx.send(payload).await
    }

    /// Receive the next message; `None` once the peer closed the channel
    /// or the connection went away.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Announce that this side will send no more on the channel.
    pub async fn close(&self) {
        self.tx.close().await;
    }

    /// Break the channel into independently owned halves.
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.tx, self.rx)
    }
}

/// Sending half of a channel. Cheap to clone; all clones share one
/// close latch.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    id: u32,
    role: ChannelRole,
    frame_tx: mpsc::Sender<Frame>,
    closed: Arc<AtomicBool>,
}

impl ChannelSender {
    /// Send one message, splitting payloads above [`MAX_FRAME_LEN`] into
    /// multiple frames.
    pub async fn send(&self, payload: &[u8]) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(MuxError::Closed);
        }
        for chunk in payload.chunks(MAX_FRAME_LEN.max(1)) {
            self.frame_tx
                .send(Frame::Data {
                    channel: self.id,
                    payload: Bytes::copy_from_slice(chunk),
                })
                .await
                .map_err(|_| MuxError::Closed)?;
        }
        Ok(())
    }

    /// Blocking variant of [`send`](Self::send), for use off the runtime.
    pub fn blocking_send(&self, payload: &[u8]) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(MuxError::Closed);
        }
        for chunk in payload.chunks(MAX_FRAME_LEN.max(1)) {
            self.frame_tx
                .blocking_send(Frame::Data {
                    channel: self.id,
                    payload: Bytes::copy_from_slice(chunk),
                })
                .map_err(|_| MuxError::Closed)?;
        }
        Ok(())
    }

    /// Announce end-of-stream to the peer. Idempotent across clones.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            let _ = self.frame_tx.send(Frame::Close { channel: self.id }).await;
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }
}

/// Receiving half of a channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    role: ChannelRole,
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelReceiver {
    /// Next message, in the order the peer sent them. `None` means the
    /// peer closed the channel or the connection is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Blocking variant of [`recv`](Self::recv), for use off the runtime.
    pub fn blocking_recv(&mut self) -> Option<Bytes> {
        self.rx.blocking_recv()
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pair() -> (MuxSession, MuxSession) {
        let (a, b) = UnixStream::pair().unwrap();
        (MuxSession::client(a), MuxSession::server(b))
    }

    #[tokio::test]
    async fn test_accept_preserves_open_order_and_roles() {
        let (client, mut server) = pair();

        client.open(ChannelRole::Info).await.unwrap();
        client.open(ChannelRole::Control).await.unwrap();
        client.open(ChannelRole::Data).await.unwrap();

        let first = server.accept().await.unwrap();
        let second = server.accept().await.unwrap();
        let third = server.accept().await.unwrap();
        assert_eq!(first.role(), ChannelRole::Info);
        assert_eq!(second.role(), ChannelRole::Control);
        assert_eq!(third.role(), ChannelRole::Data);
    }

    #[tokio::test]
    async fn test_role_mismatch_is_an_error() {
        let (client, mut server) = pair();
        client.open(ChannelRole::Control).await.unwrap();

        let accepted = server.accept().await.unwrap();
        let err = accepted.expect_role(ChannelRole::Info).unwrap_err();
        assert!(matches!(
            err,
            MuxError::RoleMismatch {
                expected: ChannelRole::Info,
                actual: ChannelRole::Control,
            }
        ));
    }

    #[tokio::test]
    async fn test_data_flows_both_directions_in_order() {
        let (client, mut server) = pair();
        let mut opened = client.open(ChannelRole::Data).await.unwrap();
        let mut accepted = server.accept().await.unwrap();

        opened.send(b"first").await.unwrap();
        opened.send(b"second").await.unwrap();
        assert_eq!(accepted.recv().await.unwrap().as_ref(), b"first");
        assert_eq!(accepted.recv().await.unwrap().as_ref(), b"second");

        accepted.send(b"reply").await.unwrap();
        assert_eq!(opened.recv().await.unwrap().as_ref(), b"reply");
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let (client, mut server) = pair();
        let info = client.open(ChannelRole::Info).await.unwrap();
        let data = client.open(ChannelRole::Data).await.unwrap();
        let mut server_info = server.accept().await.unwrap();
        let mut server_data = server.accept().await.unwrap();

        data.send(b"on data").await.unwrap();
        info.send(b"on info").await.unwrap();

        assert_eq!(server_info.recv().await.unwrap().as_ref(), b"on info");
        assert_eq!(server_data.recv().await.unwrap().as_ref(), b"on data");
    }

    #[tokio::test]
    async fn test_close_delivers_end_of_stream() {
        let (client, mut server) = pair();
        let opened = client.open(ChannelRole::Data).await.unwrap();
        let mut accepted = server.accept().await.unwrap();

        opened.send(b"last words").await.unwrap();
        opened.close().await;

        assert_eq!(accepted.recv().await.unwrap().as_ref(), b"last words");
        assert!(accepted.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, mut server) = pair();
        let opened = client.open(ChannelRole::Data).await.unwrap();
        let _accepted = server.accept().await.unwrap();

        opened.close().await;
        assert!(matches!(opened.send(b"too late").await, Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn test_dropping_session_ends_peer_channels() {
        let (client, mut server) = pair();
        let opened = client.open(ChannelRole::Data).await.unwrap();
        let mut accepted = server.accept().await.unwrap();

        drop(opened);
        drop(client);

        assert!(accepted.recv().await.is_none());
        assert!(server.accept().await.is_err());
    }

    #[tokio::test]
    async fn test_large_payload_survives_chunking() {
        let (client, mut server) = pair();
        let opened = client.open(ChannelRole::Data).await.unwrap();
        let mut accepted = server.accept().await.unwrap();

        let payload: Vec<u8> = (0..3 * MAX_FRAME_LEN + 17).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let send_task = tokio::spawn(async move {
            opened.send(&payload).await.unwrap();
            opened
        });

        let mut received = Vec::new();
        while received.len() < expected.len() {
            let chunk = accepted.recv().await.expect("stream ended early");
            assert!(chunk.len() <= MAX_FRAME_LEN);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, expected);
        send_task.await.unwrap();
    }
}
