//! # Framed TCP Transport
//!
//! Reliable, ordered, bidirectional exchange of discrete messages over TCP,
//! plus the server-side accept loop.
//!
//! ## Wire Protocol
//!
//! Every message is sent with a 4-byte length prefix (little-endian) followed
//! by the JSON serialization of a [`NetworkMessage`]:
//! ```text
//! [4 bytes: body length] [N bytes: JSON body]
//! ```
//! The length counts the body only, never itself.
//!
//! ## Ownership
//!
//! The transport owns every socket. Each connection is split into a reader
//! task and a cloneable [`ConnectionHandle`] for writes. Inbound messages are
//! published as [`NetEvent`]s on a bounded channel whose receiving end the
//! consumer (master dispatcher or worker node) owns; the transport registers
//! no callbacks.
//!
//! The same machinery serves both directions: a connection accepted by
//! [`serve`] and a connection dialed by [`connect`] run the identical reader
//! loop, which is what lets one socket carry requests out and results in.

use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

use super::messages::NetworkMessage;

/// Maximum allowed frame body size. Frames above this are drained and skipped
/// so the reader stays in sync with the stream.
pub const MAX_FRAME_SIZE: usize = 50_000_000;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// EVENTS
// ============================================================================

/// What the transport publishes to its consumer.
#[derive(Debug)]
pub enum NetEvent {
    /// A complete frame arrived. Sender fields are already overwritten with
    /// the connection's observed remote endpoint.
    Message {
        msg: NetworkMessage,
        conn: ConnectionHandle,
    },
    /// The peer closed the connection cleanly.
    Disconnected { conn: ConnectionHandle },
    /// An IO or parse error terminated the connection's reader.
    ConnectionError { peer: SocketAddr, error: String },
}

// ============================================================================
// CONNECTION HANDLE
// ============================================================================

/// Cloneable write handle to one live connection.
///
/// Cheap to clone; all clones share the same underlying socket writer. The
/// dispatcher stores these in its maps and never owns the socket itself.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Wrap a writer into a handle. Used by [`serve`]/[`connect`] and by
    /// tests that substitute an in-process stream for a real socket.
    pub fn new(peer: SocketAddr, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: Arc::new(Mutex::new(writer)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stable id for this connection, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The remote endpoint as observed at accept/connect time.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once the reader saw EOF or a fatal error on this connection.
    /// A send to a closed handle still fails on its own; this is a cheap
    /// pre-check for the "is the submitter still there" case.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Serialize, length-prefix, write and flush one message.
    ///
    /// Success means the bytes left the local buffer, nothing more.
    pub async fn send(&self, msg: &NetworkMessage) -> Result<()> {
        let body = msg.to_bytes()?;
        if body.len() > MAX_FRAME_SIZE {
            bail!(
                "refusing to send oversize frame: {} bytes (max {})",
                body.len(),
                MAX_FRAME_SIZE
            );
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// FRAME READING
// ============================================================================

/// Read the 4-byte length word.
///
/// `Ok(None)` means the peer disconnected cleanly (zero bytes at a frame
/// boundary). A partial length word (1-3 bytes then EOF) is peer misbehavior
/// and comes back as an error.
async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < 4 {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended inside length word ({} of 4 bytes)", filled),
            ));
        }
        filled += n;
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

/// Read frames until one parses, the peer disconnects, or an error occurs.
///
/// Oversize frames are drained from the stream and skipped, keeping the
/// reader aligned on the next length word.
pub(crate) async fn read_one_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<NetworkMessage>> {
    loop {
        let length = match read_length(reader).await? {
            Some(len) => len as usize,
            None => return Ok(None),
        };

        if length > MAX_FRAME_SIZE {
            warn!(
                "⚠️  Skipping oversize frame: {} bytes (max {})",
                length, MAX_FRAME_SIZE
            );
            let mut remaining = length;
            let mut scratch = [0u8; 64 * 1024];
            while remaining > 0 {
                let chunk = remaining.min(scratch.len());
                reader.read_exact(&mut scratch[..chunk]).await?;
                remaining -= chunk;
            }
            continue;
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;

        return match NetworkMessage::from_bytes(&body) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body did not parse: {}", e),
            )),
        };
    }
}

/// Per-connection reader loop. Publishes every frame on the event channel
/// with the connection handle attached; terminates on disconnect, error, or
/// shutdown.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    conn: ConnectionHandle,
    events: mpsc::Sender<NetEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = conn.peer();
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                debug!("🔌 Reader for {} stopping on shutdown", peer);
                return;
            }
            frame = read_one_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(mut msg)) => {
                msg.stamp_sender(peer);
                let event = NetEvent::Message {
                    msg,
                    conn: conn.clone(),
                };
                if events.send(event).await.is_err() {
                    // Consumer is gone; nothing left to deliver to.
                    return;
                }
            }
            Ok(None) => {
                debug!("🔌 Peer {} disconnected", peer);
                conn.mark_closed();
                let _ = events.send(NetEvent::Disconnected { conn }).await;
                return;
            }
            Err(e) => {
                error!("❌ Connection to {} failed: {}", peer, e);
                conn.mark_closed();
                let _ = events
                    .send(NetEvent::ConnectionError {
                        peer,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
}

// ============================================================================
// SERVER AND CLIENT ENTRY POINTS
// ============================================================================

/// Spawn the reader for an established stream and return its write handle.
fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<NetEvent>,
    shutdown: watch::Receiver<bool>,
) -> ConnectionHandle {
    let (read_half, write_half) = stream.into_split();
    let conn = ConnectionHandle::new(peer, Box::new(write_half));
    tokio::spawn(read_loop(read_half, conn.clone(), events, shutdown));
    conn
}

/// Accept connections until shutdown, handing each to its own reader task.
///
/// Connections are independent; frames from different peers interleave on the
/// event channel in arrival order with no cross-connection promise.
pub async fn serve(
    listener: TcpListener,
    events: mpsc::Sender<NetEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!("📡 Listening on {}", local);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("🔌 Accept loop on {} stopping", local);
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("🔗 Accepted connection from {}", peer);
                        spawn_connection(stream, peer, events.clone(), shutdown.clone());
                    }
                    Err(e) => error!("❌ Accept error on {}: {}", local, e),
                }
            }
        }
    }
}

/// Dial a peer. The returned handle writes to the socket; inbound frames from
/// the peer arrive on the same event channel as everything else.
pub async fn connect(
    addr: &str,
    events: mpsc::Sender<NetEvent>,
    shutdown: watch::Receiver<bool>,
) -> Result<ConnectionHandle> {
    let stream = TcpStream::connect(addr).await?;
    let peer = stream.peer_addr()?;
    info!("🤝 Connected to {}", peer);
    Ok(spawn_connection(stream, peer, events, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::MessageKind;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (mut read_side, _keep) = tokio::io::split(server);
        let (_unused, write_side) = tokio::io::split(client);

        let handle = ConnectionHandle::new(test_addr(), Box::new(write_side));
        let sent = NetworkMessage::new(MessageKind::ImageRequest, b"hello frames");
        handle.send(&sent).await.unwrap();

        let received = read_one_frame(&mut read_side).await.unwrap().unwrap();
        assert_eq!(received.kind, MessageKind::ImageRequest);
        assert_eq!(received.payload_bytes().unwrap(), b"hello frames");
        assert_eq!(received.message_id, sent.message_id);
    }

    #[tokio::test]
    async fn test_clean_disconnect_reads_as_none() {
        let (client, server) = tokio::io::duplex(64);
        let (mut read_side, _keep) = tokio::io::split(server);
        drop(client);

        let frame = read_one_frame(&mut read_side).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_partial_length_word_is_an_error() {
        let (client, server) = tokio::io::duplex(64);
        let (mut read_side, _keep) = tokio::io::split(server);
        let (_unused, mut write_side) = tokio::io::split(client);

        write_side.write_all(&[0x10, 0x00]).await.unwrap();
        drop(write_side);
        drop(_unused);

        let err = read_one_frame(&mut read_side).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_garbage_body_is_an_error() {
        let (client, server) = tokio::io::duplex(64);
        let (mut read_side, _keep) = tokio::io::split(server);
        let (_unused, mut write_side) = tokio::io::split(client);

        let body = b"not json at all";
        write_side
            .write_all(&(body.len() as u32).to_le_bytes())
            .await
            .unwrap();
        write_side.write_all(body).await.unwrap();

        let err = read_one_frame(&mut read_side).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversize_frame_is_skipped_and_next_frame_parses() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut read_side, _keep) = tokio::io::split(server);
        let (_unused, mut write_side) = tokio::io::split(client);

        let oversize = (MAX_FRAME_SIZE + 1) as u32;
        let writer = tokio::spawn(async move {
            write_side.write_all(&oversize.to_le_bytes()).await.unwrap();
            let chunk = vec![0u8; 64 * 1024];
            let mut remaining = oversize as usize;
            while remaining > 0 {
                let n = remaining.min(chunk.len());
                write_side.write_all(&chunk[..n]).await.unwrap();
                remaining -= n;
            }
            let msg = NetworkMessage::new(MessageKind::Acknowledgment, b"OK");
            let body = msg.to_bytes().unwrap();
            write_side
                .write_all(&(body.len() as u32).to_le_bytes())
                .await
                .unwrap();
            write_side.write_all(&body).await.unwrap();
        });

        let frame = read_one_frame(&mut read_side).await.unwrap().unwrap();
        assert_eq!(frame.kind, MessageKind::Acknowledgment);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_loop_stamps_sender_and_publishes() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read_side, _keep) = tokio::io::split(server);
        let (_unused, write_side) = tokio::io::split(client);

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let peer = test_addr();
        let conn = ConnectionHandle::new(peer, Box::new(tokio::io::sink()));
        tokio::spawn(read_loop(read_side, conn, event_tx, shutdown_rx));

        let sender = ConnectionHandle::new(peer, Box::new(write_side));
        let mut msg = NetworkMessage::new(MessageKind::SlaveRegister, b"{}");
        msg.sender_ip = "8.8.8.8".to_string();
        msg.sender_port = 53;
        sender.send(&msg).await.unwrap();

        match event_rx.recv().await.unwrap() {
            NetEvent::Message { msg, conn } => {
                assert_eq!(msg.sender_ip, peer.ip().to_string());
                assert_eq!(msg.sender_port, peer.port());
                assert_eq!(conn.peer(), peer);
            }
            other => panic!("expected a message event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_marks_handle_closed() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_side, _keep) = tokio::io::split(server);

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let conn = ConnectionHandle::new(test_addr(), Box::new(tokio::io::sink()));
        let watcher = conn.clone();
        tokio::spawn(read_loop(read_side, conn, event_tx, shutdown_rx));

        assert!(!watcher.is_closed());
        drop(client);

        match event_rx.recv().await.unwrap() {
            NetEvent::Disconnected { conn } => assert!(conn.is_closed()),
            other => panic!("expected a disconnect event, got {:?}", other),
        }
        assert!(watcher.is_closed());
    }

    #[tokio::test]
    async fn test_server_and_client_exchange_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_tx, mut server_rx) = mpsc::channel(8);
        let (client_tx, _client_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(serve(listener, server_tx, shutdown_rx.clone()));

        let conn = connect(&addr.to_string(), client_tx, shutdown_rx)
            .await
            .unwrap();
        let msg = NetworkMessage::new(MessageKind::SlaveRegister, b"{}");
        conn.send(&msg).await.unwrap();

        match server_rx.recv().await.unwrap() {
            NetEvent::Message { msg: got, .. } => {
                assert_eq!(got.kind, MessageKind::SlaveRegister);
                assert_eq!(got.message_id, msg.message_id);
            }
            other => panic!("expected a message event, got {:?}", other),
        }
    }
}
