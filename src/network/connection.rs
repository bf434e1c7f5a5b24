//! One TCP connection: framed read loop, single-writer queue, and the
//! connection state machine.
//!
//! The reader takes exactly 32 header bytes, validates them, reads exactly
//! `payload_size` payload bytes, verifies the CRC, decodes the typed
//! payload, and hands the message upward. Any violation is fatal: the
//! connection closes, preserving the invariant that every peer on an open
//! connection is protocol-compliant.
//!
//! Writes go through an unbounded FIFO drained by a single writer task, so
//! frames are never interleaved. Senders enqueue a contiguous
//! `header ++ payload` buffer from any task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::messages::Message;
use super::protocol::{MessageHeader, ProtocolError, MESSAGE_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Closing,
}

/// Events surfaced to the owner of the connection set.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete, validated message arrived.
    Message {
        connection: Arc<Connection>,
        header: MessageHeader,
        message: Message,
    },
    /// The connection finished closing (error, protocol violation, or
    /// orderly shutdown).
    Closed {
        connection: Arc<Connection>,
        reason: String,
    },
}

pub struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    state: Mutex<ConnectionState>,
    /// Zero until the handshake completes.
    peer_id: AtomicU32,
    last_activity: Mutex<Instant>,
    created_at: Instant,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an established TCP stream and spawn its reader and writer
    /// tasks. Events flow out through `event_tx`.
    pub fn spawn(
        id: u64,
        stream: TcpStream,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let remote_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            id,
            remote_addr,
            state: Mutex::new(ConnectionState::Connected),
            peer_id: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
            created_at: Instant::now(),
            writer_tx,
            close_tx,
        });

        tokio::spawn(Self::read_loop(
            connection.clone(),
            read_half,
            event_tx,
            close_rx.clone(),
        ));
        tokio::spawn(Self::write_loop(
            connection.clone(),
            write_half,
            writer_rx,
            close_rx,
        ));

        connection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id.load(Ordering::Relaxed)
    }

    /// Transition `Connected -> Authenticated` once the handshake finishes.
    pub fn set_authenticated(&self, peer_id: u32) {
        self.peer_id.store(peer_id, Ordering::Relaxed);
        self.set_state(ConnectionState::Authenticated);
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("activity lock poisoned")
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Enqueue a typed message. Fails once the connection is closing.
    pub fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        self.send_frame(message.to_frame())
    }

    /// Enqueue a pre-framed buffer.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.writer_tx
            .send(frame)
            .map_err(|_| ProtocolError::Malformed("connection closed".to_string()))
    }

    /// Begin an orderly close. Both loops observe the signal and exit; the
    /// reader reports `Closed` to the owner.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == ConnectionState::Closing || *state == ConnectionState::Disconnected {
            return;
        }
        *state = ConnectionState::Closing;
        drop(state);
        let _ = self.close_tx.send(true);
    }

    async fn read_loop(
        connection: Arc<Connection>,
        mut read_half: OwnedReadHalf,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
        mut close_rx: watch::Receiver<bool>,
    ) {
        let reason = loop {
            if *close_rx.borrow() {
                break "closed locally".to_string();
            }

            let mut header_buf = [0u8; MESSAGE_HEADER_SIZE];
            let read_result = tokio::select! {
                result = read_half.read_exact(&mut header_buf) => result,
                _ = close_rx.changed() => break "closed locally".to_string(),
            };
            if let Err(e) = read_result {
                break format!("read error: {}", e);
            }

            let header = match MessageHeader::decode(&header_buf) {
                Ok(header) => header,
                Err(e) => break format!("protocol violation: {}", e),
            };

            let mut payload = vec![0u8; header.payload_size as usize];
            if header.payload_size > 0 {
                let read_result = tokio::select! {
                    result = read_half.read_exact(&mut payload) => result,
                    _ = close_rx.changed() => break "closed locally".to_string(),
                };
                if let Err(e) = read_result {
                    break format!("read error: {}", e);
                }
            }

            if !header.verify_checksum(&payload) {
                break format!("protocol violation: {}", ProtocolError::ChecksumMismatch);
            }

            let message = match Message::decode(header.msg_type, &payload) {
                Ok(message) => message,
                Err(e) => break format!("protocol violation: {}", e),
            };

            connection.touch();
            trace!(
                conn = connection.id,
                msg_type = ?header.msg_type,
                size = header.payload_size,
                "message received"
            );

            if event_tx
                .send(ConnectionEvent::Message {
                    connection: connection.clone(),
                    header,
                    message,
                })
                .is_err()
            {
                break "event channel closed".to_string();
            }
        };

        debug!(conn = connection.id, reason = %reason, "connection reader stopped");
        connection.set_state(ConnectionState::Disconnected);
        let _ = connection.close_tx.send(true);
        let _ = event_tx.send(ConnectionEvent::Closed {
            connection: connection.clone(),
            reason,
        });
    }

    async fn write_loop(
        connection: Arc<Connection>,
        mut write_half: OwnedWriteHalf,
        mut writer_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut close_rx: watch::Receiver<bool>,
    ) {
        loop {
            if *close_rx.borrow() {
                break;
            }
            let frame = tokio::select! {
                frame = writer_rx.recv() => frame,
                _ = close_rx.changed() => None,
            };
            let Some(frame) = frame else {
                break;
            };
            if let Err(e) = write_half.write_all(&frame).await {
                warn!(conn = connection.id, error = %e, "write failed");
                break;
            }
        }

        let _ = write_half.shutdown().await;
        let _ = connection.close_tx.send(true);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}
