//! Node assembly: wires discovery, connections, the secure handshake,
//! routing, storage, and the transfer engine into a running daemon.
//!
//! Data flow for a download: discovery (or the operator) names a peer, the
//! connection engine dials it and runs the handshake, a `FileRequest`
//! fetches the metadata, and the transfer engine requests chunks inside the
//! congestion window, verifying each against its BLAKE3 hash, persisting
//! progress for resume, and reassembling the file when the last chunk
//! lands. Serving the chunks on the other side is the mirror image.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::ipc::{IpcHandler, IpcResponse, IpcServer};
use crate::network::connection::{Connection, ConnectionEvent};
use crate::network::discovery::{Discovery, DiscoveryEvent};
use crate::network::manager::ConnectionManager;
use crate::network::messages::{
    ChunkAckMessage, ChunkDataMessage, ChunkRequestMessage, ErrorCode, ErrorMessage,
    FileAnnounceMessage, FileRequestMessage, FileResponseMessage, HandshakeMessage, Message,
};
use crate::network::protocol::MessageType;
use crate::network::router::PeerRouter;
use crate::security::handshake::Handshake;
use crate::security::identity::{fingerprint_of, IdentityKeyPair};
use crate::security::secure_message::{SecureChannel, SecureMessage};
use crate::storage::chunker::{verify_file, Chunker};
use crate::storage::file_index::FileIndex;
use crate::storage::layout::StorageLayout;
use crate::storage::metadata::FileMetadata;
use crate::storage::resume::{ResumeStore, DEFAULT_RESUME_MAX_AGE_SECS};
use crate::transfer::bandwidth::BandwidthLimiter;
use crate::transfer::flow::FlowController;
use crate::transfer::manager::TransferManager;
use crate::transfer::monitor::PerformanceMonitor;
use crate::transfer::session::TransferState;

/// Capability bits advertised in the handshake.
const CAPABILITIES: u32 = 0x03; // chunk transfer + resume

/// Transfer maintenance cadence.
const TRANSFER_TICK: Duration = Duration::from_secs(5);

pub struct Node {
    config: Config,
    layout: StorageLayout,
    identity: IdentityKeyPair,
    local_peer_id: u32,
    peer_name: String,
    listen_port: AtomicU16,

    connections: Arc<ConnectionManager>,
    router: Arc<PeerRouter>,
    discovery: Mutex<Option<Arc<Discovery>>>,

    file_index: Mutex<FileIndex>,
    resume_store: Mutex<ResumeStore>,
    chunker: Chunker,

    transfers: Mutex<TransferManager>,
    monitor: Mutex<PerformanceMonitor>,
    bandwidth: Mutex<BandwidthLimiter>,
    flows: Mutex<HashMap<String, FlowController>>,

    /// Established encrypted sessions, keyed by connection id.
    channels: Mutex<HashMap<u64, SecureChannel>>,
    /// Handshake state per connection, kept for key rotation.
    handshakes: Mutex<HashMap<u64, Handshake>>,

    event_tx: mpsc::UnboundedSender<NodeEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
    conn_event_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,

    ipc_server: Mutex<Option<IpcServer>>,
    running: AtomicBool,
}

impl Node {
    /// Build a node from configuration: storage layout, identity, stores.
    /// No sockets are opened until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Arc<Self>, NodeError> {
        if config.chunk_size() == 0 {
            return Err(NodeError::Config(
                "transfer.chunk_size must be nonzero".to_string(),
            ));
        }

        let layout = StorageLayout::new(config.storage_base_dir());
        layout
            .create_directories()
            .map_err(|e| NodeError::StartFailed(format!("storage layout: {}", e)))?;

        let identity = IdentityKeyPair::load_or_generate(&layout.identity_key_path())?;
        info!(fingerprint = %identity.fingerprint(), "identity loaded");

        let local_peer_id = loop {
            let id = rand::rngs::OsRng.next_u32();
            if id != 0 {
                break id;
            }
        };

        let file_index = FileIndex::open(&layout.database_path())?;
        let resume_store = ResumeStore::open(&layout.database_path())?;

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let peer_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "hypershare".to_string());
        let chunker = Chunker::new(config.chunk_size());

        Ok(Arc::new(Self {
            connections: ConnectionManager::new(conn_tx),
            router: PeerRouter::new(local_peer_id),
            discovery: Mutex::new(None),
            file_index: Mutex::new(file_index),
            resume_store: Mutex::new(resume_store),
            chunker,
            transfers: Mutex::new(TransferManager::new()),
            monitor: Mutex::new(PerformanceMonitor::new()),
            bandwidth: Mutex::new(BandwidthLimiter::default()),
            flows: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            handshakes: Mutex::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            conn_event_rx: Mutex::new(Some(conn_rx)),
            ipc_server: Mutex::new(None),
            listen_port: AtomicU16::new(config.server_port()),
            local_peer_id,
            peer_name,
            identity,
            layout,
            config,
            running: AtomicBool::new(false),
        }))
    }

    pub fn local_peer_id(&self) -> u32 {
        self.local_peer_id
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    /// The routing fabric, for peer and file-location queries.
    pub fn router(&self) -> &Arc<PeerRouter> {
        &self.router
    }

    /// Take the node event stream. Callable once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<NodeEvent>> {
        self.event_rx.lock().expect("event rx lock poisoned").take()
    }

    /// Open the listener, start discovery and all background loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        self.running.store(true, Ordering::Relaxed);

        let bound = self
            .connections
            .listen(SocketAddr::from(([0, 0, 0, 0], self.config.server_port())))
            .await?;
        self.listen_port.store(bound.port(), Ordering::Relaxed);
        self.connections.spawn_supervisor();

        // Router sinks send through the connection layer, encrypted when a
        // channel exists. Invoked only with the router's locks released.
        let node = self.clone();
        self.router.set_message_sender(Box::new(move |dest, message| {
            node.send_routed(dest, &message);
        }));
        let node = self.clone();
        self.router.set_broadcast_sender(Box::new(move |message| {
            node.broadcast_secure(&message);
        }));
        self.router.spawn_maintenance();

        if self.config.discovery_enabled() {
            let (disc_tx, disc_rx) = mpsc::unbounded_channel();
            let discovery = Discovery::start(
                self.local_peer_id,
                self.listen_port(),
                self.config.discovery_port(),
                disc_tx,
            )
            .await?;
            *self.discovery.lock().expect("discovery lock poisoned") = Some(discovery);
            self.clone().spawn_discovery_loop(disc_rx);
        }

        let conn_rx = self
            .conn_event_rx
            .lock()
            .expect("conn rx lock poisoned")
            .take()
            .ok_or(NodeError::StartFailed("node already started".to_string()))?;
        self.clone().spawn_dispatch_loop(conn_rx);
        self.clone().spawn_transfer_loop();
        self.start_ipc()?;

        info!(
            peer = self.local_peer_id,
            port = self.listen_port(),
            "node started"
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        info!("node shutting down");
        if let Some(discovery) = self.discovery.lock().expect("discovery lock poisoned").take() {
            discovery.shutdown();
        }
        self.router.shutdown();
        self.connections.shutdown();
        self.ipc_server.lock().expect("ipc lock poisoned").take();
    }

    // ------------------------------------------------------------------
    // Outbound plumbing
    // ------------------------------------------------------------------

    /// Dial a peer and initiate the secure handshake.
    pub async fn connect_to_peer(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<Arc<Connection>, NodeError> {
        let connection = self.connections.connect(addr).await?;

        let mut handshake = Handshake::new(self.identity.clone());
        let message = handshake.initiate(
            self.local_peer_id,
            self.listen_port(),
            &self.peer_name,
            CAPABILITIES,
        )?;
        self.handshakes
            .lock()
            .expect("handshakes lock poisoned")
            .insert(connection.id(), handshake);

        connection.send(&Message::SecureHandshake(message))?;
        Ok(connection)
    }

    /// Send over one connection, encrypted when a secure channel exists.
    fn send_on(&self, connection: &Connection, message: &Message) {
        let frame = {
            let mut channels = self.channels.lock().expect("channels lock poisoned");
            match channels.get_mut(&connection.id()) {
                Some(channel) => {
                    let plaintext = message.encode_payload();
                    match channel.encrypt(message.message_type().as_byte(), &plaintext) {
                        Ok(secure) => Message::Encrypted(secure).to_frame(),
                        Err(e) => {
                            warn!(conn = connection.id(), error = %e, "encrypt failed");
                            return;
                        }
                    }
                }
                None => message.to_frame(),
            }
        };
        let _ = connection.send_frame(frame);
    }

    /// Unicast toward a peer id: direct connection when present, otherwise
    /// one routed hop.
    fn send_routed(&self, peer_id: u32, message: &Message) {
        if let Some(connection) = self.connections.get_by_peer(peer_id) {
            self.send_on(&connection, message);
            return;
        }
        // Not adjacent: relay via the next hop if the table knows one
        if let Some(next_hop) = self.router.get_next_hop(peer_id) {
            if next_hop != peer_id {
                if let Some(connection) = self.connections.get_by_peer(next_hop) {
                    self.send_on(&connection, message);
                    return;
                }
            }
        }
        debug!(peer = peer_id, "no path to peer, message dropped");
    }

    fn broadcast_secure(&self, message: &Message) {
        for peer_id in self.connections.connected_peers() {
            if let Some(connection) = self.connections.get_by_peer(peer_id) {
                self.send_on(&connection, message);
            }
        }
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    fn spawn_discovery_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DiscoveryEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    DiscoveryEvent::PeerDiscovered(peer) => {
                        let _ = self.event_tx.send(NodeEvent::PeerDiscovered {
                            peer_id: peer.peer_id,
                            ip: peer.ip,
                            tcp_port: peer.tcp_port,
                        });
                        // Dial newly discovered peers eagerly
                        let addr = SocketAddr::new(peer.ip, peer.tcp_port);
                        let node = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = node.connect_to_peer(addr).await {
                                debug!(peer = peer.peer_id, error = %e, "dial failed");
                            }
                        });
                    }
                    DiscoveryEvent::PeerLost(peer_id) => {
                        let _ = self.event_tx.send(NodeEvent::PeerLost { peer_id });
                    }
                }
            }
        });
    }

    fn spawn_dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !self.running.load(Ordering::Relaxed) {
                    break;
                }
                match event {
                    ConnectionEvent::Message {
                        connection,
                        message,
                        ..
                    } => {
                        self.handle_message(&connection, message).await;
                    }
                    ConnectionEvent::Closed { connection, reason } => {
                        self.handle_closed(&connection, &reason);
                    }
                }
            }
        });
    }

    fn spawn_transfer_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick: u64 = 0;
            while self.running.load(Ordering::Relaxed) {
                tokio::time::sleep(TRANSFER_TICK).await;
                tick += 1;
                self.retry_timed_out_chunks();
                self.rotate_stale_keys();
                if tick % 12 == 0 {
                    self.transfers
                        .lock()
                        .expect("transfers lock poisoned")
                        .prune_terminal();
                }
                if tick % 720 == 0 {
                    let pruned = self
                        .resume_store
                        .lock()
                        .expect("resume lock poisoned")
                        .cleanup_old_resume_states(DEFAULT_RESUME_MAX_AGE_SECS)
                        .unwrap_or(0);
                    if pruned > 0 {
                        info!(pruned, "old resume states cleaned up");
                    }
                }
            }
        });
    }

    fn retry_timed_out_chunks(&self) {
        // Collect resends under the lock, send after releasing it
        let mut resends: Vec<(u32, ChunkRequestMessage)> = Vec::new();
        {
            let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
            let mut flows = self.flows.lock().expect("flows lock poisoned");
            let session_ids: Vec<String> = transfers
                .all_sessions()
                .filter(|s| s.state() == TransferState::Transferring)
                .map(|s| s.session_id().to_string())
                .collect();

            for session_id in session_ids {
                let Some(session) = transfers.session_mut(&session_id) else {
                    continue;
                };
                let timed_out = session.get_timed_out_chunks();
                if timed_out.is_empty() {
                    continue;
                }
                if let Some(flow) = flows.get_mut(&session_id) {
                    flow.on_timeout();
                }
                let peer_id = session.peer_id();
                let file_id = session.file_id().to_string();
                let chunk_size = session.metadata().map(|m| m.chunk_size).unwrap_or_default();
                for index in timed_out {
                    if session.retry_chunk(index).is_ok() {
                        resends.push((
                            peer_id,
                            ChunkRequestMessage {
                                file_id: file_id.clone(),
                                chunk_index: u64::from(index),
                                chunk_size,
                            },
                        ));
                    }
                }
            }
        }

        for (peer_id, request) in resends {
            debug!(peer = peer_id, chunk = request.chunk_index, "re-requesting timed-out chunk");
            self.router
                .update_peer_reliability(peer_id, false);
            self.send_routed(peer_id, &Message::ChunkRequest(request));
        }
    }

    fn rotate_stale_keys(&self) {
        let due: Vec<u64> = {
            let channels = self.channels.lock().expect("channels lock poisoned");
            channels
                .iter()
                .filter(|(_, channel)| channel.should_rotate() || channel.past_hard_limit())
                .map(|(id, _)| *id)
                .collect()
        };

        for connection_id in due {
            let rotation = {
                let mut handshakes = self.handshakes.lock().expect("handshakes lock poisoned");
                let Some(handshake) = handshakes.get_mut(&connection_id) else {
                    continue;
                };
                if handshake.rotation_pending() {
                    continue;
                }
                match handshake.initiate_rotation() {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(conn = connection_id, error = %e, "rotation not initiated");
                        continue;
                    }
                }
            };
            if let Some(connection) = self.connections.get(connection_id) {
                info!(conn = connection_id, "session key rotation initiated");
                // Rotation messages are self-authenticating; send in clear
                let _ = connection.send(&Message::KeyRotation(rotation));
            }
        }
    }

    fn start_ipc(self: &Arc<Self>) -> Result<(), NodeError> {
        let node = self.clone();
        let handler: IpcHandler = Arc::new(move |command| node.handle_ipc(command));
        let server = IpcServer::start(&self.config.ipc_socket_path(), handler)
            .map_err(|e| NodeError::StartFailed(format!("ipc: {}", e)))?;
        *self.ipc_server.lock().expect("ipc lock poisoned") = Some(server);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------

    async fn handle_message(self: &Arc<Self>, connection: &Arc<Connection>, message: Message) {
        // Unwrap encrypted payloads first; crypto failures drop the message
        let message = match message {
            Message::Encrypted(secure) => match self.decrypt_incoming(connection, &secure) {
                Some(inner) => inner,
                None => return,
            },
            other => other,
        };

        match message {
            Message::SecureHandshake(msg) => self.handle_secure_handshake(connection, msg),
            Message::SecureHandshakeAck(ack) => self.handle_secure_handshake_ack(connection, ack),
            Message::KeyRotation(msg) => self.handle_key_rotation(connection, msg),
            Message::Handshake(msg) => self.handle_plain_handshake(connection, msg),
            Message::HandshakeAck(_) => {}
            Message::Heartbeat(_) => {}
            Message::Disconnect => connection.close(),
            Message::Error(err) => self.handle_error_message(connection, err),

            Message::FileAnnounce(msg) => {
                let _ = self.event_tx.send(NodeEvent::FileAnnounced {
                    file_id: msg.file_id.clone(),
                    filename: msg.filename.clone(),
                    file_size: msg.file_size,
                    peer_id: connection.peer_id(),
                });
                self.router.handle_file_announce(connection.peer_id(), &msg);
            }
            Message::RouteUpdate(msg) => self.router.handle_route_update(&msg),
            Message::TopologySync(msg) => self.router.handle_topology_sync(&msg),
            Message::FileQuery(msg) => self.router.handle_file_query(&msg),
            Message::FileQueryResponse(msg) => self.router.handle_file_query_response(&msg),

            Message::FileRequest(msg) => self.handle_file_request(connection, msg),
            Message::FileResponse(msg) => self.handle_file_response(connection, msg),
            Message::ChunkRequest(msg) => {
                // Serving a chunk may suspend on the bandwidth limiter, so
                // it must not stall the dispatch loop
                let node = self.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    node.handle_chunk_request(&connection, msg).await;
                });
            }
            Message::ChunkData(msg) => self.handle_chunk_data(connection, msg),
            Message::ChunkAck(msg) => self.handle_chunk_ack(connection, msg),

            // Discovery messages belong on the UDP socket
            Message::PeerAnnounce(_) | Message::PeerQuery | Message::PeerResponse(_) => {}
            Message::Encrypted(_) => {
                // Nested encryption is a protocol violation
                warn!(conn = connection.id(), "nested encrypted message");
                connection.close();
            }
        }
    }

    fn decrypt_incoming(
        &self,
        connection: &Arc<Connection>,
        secure: &SecureMessage,
    ) -> Option<Message> {
        let Some(inner_type) = MessageType::from_byte(secure.original_type) else {
            warn!(conn = connection.id(), "encrypted message with unknown inner type");
            connection.close();
            return None;
        };

        let plaintext = {
            let mut channels = self.channels.lock().expect("channels lock poisoned");
            let Some(channel) = channels.get_mut(&connection.id()) else {
                warn!(conn = connection.id(), "encrypted message before handshake");
                connection.close();
                return None;
            };
            match channel.decrypt(secure) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    // Authenticated session: drop the offending message only
                    warn!(conn = connection.id(), error = %e, "message dropped");
                    return None;
                }
            }
        };

        match Message::decode(inner_type, &plaintext) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(conn = connection.id(), error = %e, "inner payload malformed");
                connection.close();
                None
            }
        }
    }

    fn handle_secure_handshake(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        msg: crate::security::handshake::SecureHandshakeMessage,
    ) {
        let mut handshake = Handshake::new(self.identity.clone());
        match handshake.respond(&msg, self.local_peer_id) {
            Ok(ack) => {
                let keys = match handshake.server_session_keys() {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!(conn = connection.id(), error = %e, "key derivation failed");
                        connection.close();
                        return;
                    }
                };

                // Ack travels in clear; everything after is encrypted
                let _ = connection.send(&Message::SecureHandshakeAck(ack));
                self.install_session(connection, handshake, keys, msg.peer_id);
                self.router.add_direct_peer(
                    msg.peer_id,
                    connection.remote_addr().ip(),
                    msg.listen_port,
                );
                let _ = self.event_tx.send(NodeEvent::PeerAuthenticated {
                    peer_id: msg.peer_id,
                    fingerprint: fingerprint_of(&msg.identity_public_key),
                });
                info!(
                    peer = msg.peer_id,
                    name = %msg.peer_name,
                    fingerprint = %fingerprint_of(&msg.identity_public_key),
                    "peer authenticated"
                );
            }
            Err(e) => {
                warn!(conn = connection.id(), error = %e, "handshake rejected");
                let _ = connection.send(&Message::Error(ErrorMessage::new(
                    ErrorCode::AuthenticationFailed,
                    "AUTHENTICATION_FAILED",
                    0,
                )));
                connection.close();
            }
        }
    }

    fn handle_secure_handshake_ack(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        ack: crate::security::handshake::SecureHandshakeAckMessage,
    ) {
        let result = {
            let mut handshakes = self.handshakes.lock().expect("handshakes lock poisoned");
            match handshakes.get_mut(&connection.id()) {
                Some(handshake) => handshake.complete(&ack),
                None => {
                    warn!(conn = connection.id(), "unsolicited handshake ack");
                    connection.close();
                    return;
                }
            }
        };

        match result {
            Ok(keys) => {
                self.channels
                    .lock()
                    .expect("channels lock poisoned")
                    .insert(connection.id(), SecureChannel::new(keys));
                connection.set_authenticated(ack.peer_id);
                // We dialed their listen address, so it doubles as the route
                self.router.add_direct_peer(
                    ack.peer_id,
                    connection.remote_addr().ip(),
                    connection.remote_addr().port(),
                );
                let _ = self.event_tx.send(NodeEvent::PeerAuthenticated {
                    peer_id: ack.peer_id,
                    fingerprint: fingerprint_of(&ack.identity_public_key),
                });
                info!(peer = ack.peer_id, "handshake completed");
            }
            Err(e) => {
                warn!(conn = connection.id(), error = %e, "handshake completion failed");
                connection.close();
            }
        }
    }

    fn install_session(
        &self,
        connection: &Arc<Connection>,
        handshake: Handshake,
        keys: crate::security::session::SessionKeys,
        peer_id: u32,
    ) {
        self.channels
            .lock()
            .expect("channels lock poisoned")
            .insert(connection.id(), SecureChannel::new(keys));
        self.handshakes
            .lock()
            .expect("handshakes lock poisoned")
            .insert(connection.id(), handshake);
        connection.set_authenticated(peer_id);
    }

    fn handle_key_rotation(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        msg: crate::security::handshake::KeyRotationMessage,
    ) {
        let mut handshakes = self.handshakes.lock().expect("handshakes lock poisoned");
        let Some(handshake) = handshakes.get_mut(&connection.id()) else {
            warn!(conn = connection.id(), "rotation before handshake");
            connection.close();
            return;
        };

        match handshake.pending_rotation_id() {
            // Our own rotation is in flight and this is its reply
            Some(pending_id) if msg.rotation_id == pending_id => {
                match handshake.complete_rotation(&msg) {
                    Ok(keys) => {
                        drop(handshakes);
                        self.rekey_channel(connection, keys);
                        info!(conn = connection.id(), "session keys rotated");
                    }
                    Err(e) => {
                        warn!(conn = connection.id(), error = %e, "rotation completion failed");
                        connection.close();
                    }
                }
            }
            // Simultaneous initiations crossed: the lower rotation id wins.
            // Ours is lower, so the peer will answer it; ignore theirs.
            Some(pending_id) if pending_id < msg.rotation_id => {
                debug!(conn = connection.id(), "crossed rotation ignored, ours wins");
            }
            // Theirs wins: abandon ours and respond to theirs
            other => {
                if other.is_some() {
                    handshake.abandon_rotation();
                }
                match handshake.handle_rotation(&msg) {
                    Ok((reply, keys)) => {
                        drop(handshakes);
                        let _ = connection.send(&Message::KeyRotation(reply));
                        self.rekey_channel(connection, keys);
                        info!(conn = connection.id(), "session keys rotated (responder)");
                    }
                    Err(e) => {
                        warn!(conn = connection.id(), error = %e, "rotation rejected");
                        connection.close();
                    }
                }
            }
        }
    }

    fn rekey_channel(&self, connection: &Arc<Connection>, keys: crate::security::session::SessionKeys) {
        if let Some(channel) = self
            .channels
            .lock()
            .expect("channels lock poisoned")
            .get_mut(&connection.id())
        {
            channel.rekey(keys);
        }
    }

    fn handle_plain_handshake(&self, connection: &Arc<Connection>, msg: HandshakeMessage) {
        // Legacy peer-info exchange; authentication still requires the
        // secure handshake, so the connection stays unauthenticated.
        debug!(peer = msg.peer_id, name = %msg.peer_name, "plaintext handshake received");
        let _ = connection.send(&Message::HandshakeAck(HandshakeMessage {
            peer_id: self.local_peer_id,
            listen_port: self.listen_port(),
            peer_name: self.peer_name.clone(),
            capabilities: CAPABILITIES,
        }));
    }

    fn handle_error_message(&self, connection: &Arc<Connection>, err: ErrorMessage) {
        warn!(
            conn = connection.id(),
            code = err.error_code,
            message = %err.error_message,
            "peer reported error"
        );
        if err.code() == ErrorCode::AuthenticationFailed {
            connection.close();
        }
    }

    fn handle_closed(&self, connection: &Arc<Connection>, reason: &str) {
        debug!(conn = connection.id(), reason, "connection closed");
        self.channels
            .lock()
            .expect("channels lock poisoned")
            .remove(&connection.id());
        self.handshakes
            .lock()
            .expect("handshakes lock poisoned")
            .remove(&connection.id());
        self.connections.remove(connection.id());

        let peer_id = connection.peer_id();
        if peer_id != 0 {
            self.router.remove_peer(peer_id);
            let _ = self.event_tx.send(NodeEvent::PeerDisconnected { peer_id });
        }
    }

    // ------------------------------------------------------------------
    // File serving (upload side)
    // ------------------------------------------------------------------

    fn handle_file_request(&self, connection: &Arc<Connection>, msg: FileRequestMessage) {
        let metadata = self
            .file_index
            .lock()
            .expect("file index lock poisoned")
            .get_by_file_id(&msg.file_id)
            .unwrap_or(None);

        let response = match metadata {
            Some(metadata) => FileResponseMessage {
                file_id: msg.file_id,
                accepted: true,
                error_message: String::new(),
                metadata: Some(metadata),
            },
            None => FileResponseMessage {
                file_id: msg.file_id,
                accepted: false,
                error_message: "file not found".to_string(),
                metadata: None,
            },
        };
        self.send_on(connection, &Message::FileResponse(response));
    }

    async fn handle_chunk_request(&self, connection: &Arc<Connection>, msg: ChunkRequestMessage) {
        let metadata = self
            .file_index
            .lock()
            .expect("file index lock poisoned")
            .get_by_file_id(&msg.file_id)
            .unwrap_or(None);

        let Some(metadata) = metadata else {
            self.send_on(
                connection,
                &Message::Error(ErrorMessage::new(
                    ErrorCode::FileNotFound,
                    format!("no such file: {}", msg.file_id),
                    0,
                )),
            );
            return;
        };

        let chunk_index = msg.chunk_index as u32;
        let data = self.read_chunk_bytes(&metadata, chunk_index);
        let Some(data) = data else {
            self.send_on(
                connection,
                &Message::Error(ErrorMessage::new(
                    ErrorCode::ChunkNotAvailable,
                    format!("chunk {} not available", chunk_index),
                    0,
                )),
            );
            return;
        };

        // Bandwidth limiter: suspend while the bucket refills
        let size = data.len() as u64;
        for _ in 0..250 {
            let allowed = {
                let mut bandwidth = self.bandwidth.lock().expect("bandwidth lock poisoned");
                if bandwidth.can_send(size) {
                    bandwidth.consume(size);
                    true
                } else {
                    false
                }
            };
            if allowed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let chunk_hash = metadata
            .chunk_hashes
            .get(chunk_index as usize)
            .cloned()
            .unwrap_or_default();
        self.send_on(
            connection,
            &Message::ChunkData(ChunkDataMessage {
                file_id: msg.file_id,
                chunk_index: msg.chunk_index,
                data,
                chunk_hash,
            }),
        );
    }

    fn read_chunk_bytes(&self, metadata: &FileMetadata, chunk_index: u32) -> Option<Vec<u8>> {
        if chunk_index >= metadata.chunk_count {
            return None;
        }
        // Prefer the original file; fall back to the chunk store
        if !metadata.file_path.is_empty() {
            let path = Path::new(&metadata.file_path);
            if path.exists() {
                if let Ok(data) = self.chunker.read_chunk_from_file(path, metadata, chunk_index) {
                    return Some(data);
                }
            }
        }
        self.chunker
            .read_chunk(&self.layout.incomplete_dir(), &metadata.file_hash, chunk_index)
            .ok()
    }

    fn handle_chunk_ack(&self, connection: &Arc<Connection>, msg: ChunkAckMessage) {
        if !msg.success {
            debug!(
                peer = connection.peer_id(),
                chunk = msg.chunk_index,
                error = %msg.error_message,
                "chunk rejected by peer"
            );
            self.router
                .update_peer_reliability(connection.peer_id(), false);
        }
    }

    // ------------------------------------------------------------------
    // Download side
    // ------------------------------------------------------------------

    /// Share a local file: chunk it, index it, announce it.
    pub fn share_file(&self, path: &Path) -> Result<FileMetadata, NodeError> {
        let metadata = self.chunker.chunk_file(path)?;
        self.file_index
            .lock()
            .expect("file index lock poisoned")
            .add_file(&metadata)?;

        self.router.announce_file(FileAnnounceMessage {
            file_id: metadata.file_id.clone(),
            filename: metadata.filename.clone(),
            file_size: metadata.file_size,
            file_hash: metadata.file_hash.clone(),
            tags: metadata.tags.clone(),
        });

        let count = self
            .file_index
            .lock()
            .expect("file index lock poisoned")
            .file_count()
            .unwrap_or(0);
        self.connections.set_available_files(count as u32);

        info!(file = %metadata.file_id, size = metadata.file_size, "file shared");
        Ok(metadata)
    }

    /// Begin downloading a file from a specific peer. The transfer proceeds
    /// asynchronously; progress arrives as [`NodeEvent`]s.
    pub fn download_file(&self, file_id: &str, peer_id: u32) -> Result<String, NodeError> {
        if self.connections.get_by_peer(peer_id).is_none() {
            return Err(NodeError::Policy("PEER_UNAVAILABLE".to_string()));
        }

        let session_id = self
            .transfers
            .lock()
            .expect("transfers lock poisoned")
            .start_download(file_id, peer_id)?;

        self.send_routed(
            peer_id,
            &Message::FileRequest(FileRequestMessage {
                file_id: file_id.to_string(),
                start_offset: 0,
                length: 0,
                preferred_chunk_size: self.chunker.chunk_size(),
            }),
        );
        info!(file = file_id, peer = peer_id, session = %session_id, "download started");
        Ok(session_id)
    }

    fn handle_file_response(&self, connection: &Arc<Connection>, msg: FileResponseMessage) {
        if !msg.accepted {
            let failed = {
                let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
                transfers.session_for_file(&msg.file_id).map(|session| {
                    session.set_state(TransferState::Failed);
                    session.session_id().to_string()
                })
            };
            if let Some(session_id) = failed {
                warn!(file = %msg.file_id, "download refused: {}", msg.error_message);
                let _ = self.event_tx.send(NodeEvent::TransferFailed {
                    session_id,
                    file_id: msg.file_id,
                    reason: msg.error_message,
                });
            }
            return;
        }

        let Some(metadata) = msg.metadata else {
            warn!(file = %msg.file_id, "accepted response without metadata");
            return;
        };
        if !metadata.is_consistent() {
            warn!(file = %msg.file_id, "inconsistent metadata rejected");
            return;
        }

        // Resume state from previous runs
        let completed: Vec<u32> = self
            .resume_store
            .lock()
            .expect("resume lock poisoned")
            .get_completed_chunks(&msg.file_id)
            .map(|set| set.into_iter().map(|i| i as u32).collect())
            .unwrap_or_default();

        let (session_id, requests) = {
            let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
            let Some(session) = transfers.session_for_file(&msg.file_id) else {
                debug!(file = %msg.file_id, "file response without a session");
                return;
            };
            let session_id = session.session_id().to_string();
            session.start_transfer(metadata.clone());
            session.mark_resumed_chunks(completed.iter().copied());

            self.monitor
                .lock()
                .expect("monitor lock poisoned")
                .start_session(&session_id, metadata.file_size);
            self.flows
                .lock()
                .expect("flows lock poisoned")
                .insert(session_id.clone(), FlowController::new());

            // Empty files and fully resumed transfers have nothing to fetch
            if metadata.chunk_count == 0 {
                session.set_state(TransferState::Completed);
            }
            if session.is_complete() {
                (session_id, None)
            } else {
                let window = self.config.max_parallel().max(1);
                (
                    session_id,
                    Some(session.request_next_chunks(window).unwrap_or_default()),
                )
            }
        };

        let Some(requests) = requests else {
            self.finalize_download(&session_id, &metadata);
            return;
        };

        let _ = self
            .file_index
            .lock()
            .expect("file index lock poisoned")
            .add_incomplete_file(&metadata);
        for index in &completed {
            let _ = self
                .file_index
                .lock()
                .expect("file index lock poisoned")
                .update_chunk_progress(
                    &metadata.file_hash,
                    *index,
                    metadata
                        .chunk_hashes
                        .get(*index as usize)
                        .map(String::as_str)
                        .unwrap_or(""),
                );
        }

        for index in requests {
            self.send_on(
                connection,
                &Message::ChunkRequest(ChunkRequestMessage {
                    file_id: msg.file_id.clone(),
                    chunk_index: u64::from(index),
                    chunk_size: metadata.chunk_size,
                }),
            );
        }
    }

    fn handle_chunk_data(&self, connection: &Arc<Connection>, msg: ChunkDataMessage) {
        let chunk_index = msg.chunk_index as u32;

        // Validate inside the transfer lock, then do IO outside it
        let outcome = {
            let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
            let Some(session) = transfers.session_for_file(&msg.file_id) else {
                debug!(file = %msg.file_id, "chunk for unknown session dropped");
                return;
            };
            let session_id = session.session_id().to_string();
            match session.handle_chunk_received(chunk_index, &msg.data) {
                Ok(()) => {
                    let metadata = session.metadata().cloned();
                    let complete = session.is_complete();
                    let percent = session.progress_percentage();
                    let bytes = session.bytes_transferred();
                    Ok((session_id, metadata, complete, percent, bytes))
                }
                Err(e) => Err((session_id, e)),
            }
        };

        match outcome {
            Err((_session_id, e)) => {
                debug!(file = %msg.file_id, chunk = chunk_index, error = %e, "chunk rejected");
                self.send_on(
                    connection,
                    &Message::ChunkAck(ChunkAckMessage {
                        file_id: msg.file_id,
                        chunk_index: msg.chunk_index,
                        success: false,
                        error_message: e.to_string(),
                    }),
                );
            }
            Ok((session_id, metadata, complete, percent, bytes)) => {
                let Some(metadata) = metadata else { return };

                // Persist the verified chunk and the progress trail
                if let Err(e) = self.chunker.write_chunk(
                    &self.layout.incomplete_dir(),
                    &metadata.file_hash,
                    chunk_index,
                    &msg.data,
                ) {
                    warn!(error = %e, "chunk write failed");
                }
                let verified_hash = metadata
                    .chunk_hashes
                    .get(chunk_index as usize)
                    .cloned()
                    .unwrap_or_else(|| msg.chunk_hash.clone());
                let _ = self
                    .file_index
                    .lock()
                    .expect("file index lock poisoned")
                    .update_chunk_progress(&metadata.file_hash, chunk_index, &verified_hash);
                let _ = self
                    .resume_store
                    .lock()
                    .expect("resume lock poisoned")
                    .update_chunk_completed(&msg.file_id, &session_id, u64::from(chunk_index));

                self.monitor
                    .lock()
                    .expect("monitor lock poisoned")
                    .on_bytes_transferred(&session_id, msg.data.len() as u64);

                let window = {
                    let mut flows = self.flows.lock().expect("flows lock poisoned");
                    match flows.get_mut(&session_id) {
                        Some(flow) => {
                            flow.on_ack_received();
                            flow.window_size()
                        }
                        None => 1,
                    }
                };

                self.router
                    .update_peer_reliability(connection.peer_id(), true);
                self.router
                    .update_availability(&msg.file_id, connection.peer_id(), true);

                self.send_on(
                    connection,
                    &Message::ChunkAck(ChunkAckMessage {
                        file_id: msg.file_id.clone(),
                        chunk_index: msg.chunk_index,
                        success: true,
                        error_message: String::new(),
                    }),
                );

                let _ = self.event_tx.send(NodeEvent::TransferProgress {
                    session_id: session_id.clone(),
                    file_id: msg.file_id.clone(),
                    percent,
                    bytes_transferred: bytes,
                });

                if complete {
                    self.finalize_download(&session_id, &metadata);
                } else {
                    // Refill the request window
                    let next = {
                        let mut transfers =
                            self.transfers.lock().expect("transfers lock poisoned");
                        transfers
                            .session_mut(&session_id)
                            .and_then(|s| s.request_next_chunks(window).ok())
                            .unwrap_or_default()
                    };
                    for index in next {
                        self.send_on(
                            connection,
                            &Message::ChunkRequest(ChunkRequestMessage {
                                file_id: msg.file_id.clone(),
                                chunk_index: u64::from(index),
                                chunk_size: metadata.chunk_size,
                            }),
                        );
                    }
                }
            }
        }
    }

    fn finalize_download(&self, session_id: &str, metadata: &FileMetadata) {
        let output = self.layout.download_path(&metadata.filename);
        let result = self
            .chunker
            .merge_chunks(
                &self.layout.incomplete_dir(),
                &metadata.file_hash,
                &output,
                metadata.chunk_count,
            )
            .and_then(|_| {
                verify_file(&output, metadata).and_then(|ok| {
                    if ok {
                        Ok(())
                    } else {
                        Err(crate::storage::StorageError::InvalidInput(
                            "reassembled file failed verification".to_string(),
                        ))
                    }
                })
            });

        match result {
            Ok(()) => {
                // The completed copy supersedes partial state
                let mut completed = metadata.clone();
                completed.file_path = output.to_string_lossy().into_owned();
                let _ = self
                    .file_index
                    .lock()
                    .expect("file index lock poisoned")
                    .add_file(&completed);
                let _ = self
                    .resume_store
                    .lock()
                    .expect("resume lock poisoned")
                    .remove_resume_state(&metadata.file_id);
                self.chunker.remove_chunks(
                    &self.layout.incomplete_dir(),
                    &metadata.file_hash,
                    metadata.chunk_count,
                );
                self.monitor
                    .lock()
                    .expect("monitor lock poisoned")
                    .end_session(session_id);
                self.flows
                    .lock()
                    .expect("flows lock poisoned")
                    .remove(session_id);

                info!(file = %metadata.file_id, path = %output.display(), "download complete");
                let _ = self.event_tx.send(NodeEvent::TransferCompleted {
                    session_id: session_id.to_string(),
                    file_id: metadata.file_id.clone(),
                    path: output,
                });
            }
            Err(e) => {
                warn!(file = %metadata.file_id, error = %e, "finalize failed");
                if let Some(session) = self
                    .transfers
                    .lock()
                    .expect("transfers lock poisoned")
                    .session_mut(session_id)
                {
                    session.set_state(TransferState::Failed);
                }
                let _ = self.event_tx.send(NodeEvent::TransferFailed {
                    session_id: session_id.to_string(),
                    file_id: metadata.file_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // IPC surface
    // ------------------------------------------------------------------

    fn handle_ipc(&self, command: &str) -> IpcResponse {
        let mut words = command.split_whitespace();
        match words.next() {
            Some("status") => self.ipc_status(),
            Some("peers") => self.ipc_peers(),
            Some("files") => self.ipc_files(),
            Some("transfers") => self.ipc_transfers(),
            Some("share") => match words.next() {
                Some(path) => match self.share_file(Path::new(path)) {
                    Ok(metadata) => IpcResponse::ok("file shared")
                        .with("file_id", metadata.file_id)
                        .with("file_size", metadata.file_size.to_string())
                        .with("chunks", metadata.chunk_count.to_string()),
                    Err(e) => IpcResponse::error(e.to_string()),
                },
                None => IpcResponse::error("usage: share <path>"),
            },
            Some("download") => {
                let Some(file_id) = words.next() else {
                    return IpcResponse::error("usage: download <file-id> [peer-id]");
                };
                let peer_id = match words.next() {
                    Some(raw) => match raw.parse() {
                        Ok(peer_id) => Some(peer_id),
                        Err(_) => return IpcResponse::error("peer id must be numeric"),
                    },
                    None => self
                        .router
                        .optimal_peers_for_file(file_id, 1)
                        .first()
                        .copied(),
                };
                let Some(peer_id) = peer_id else {
                    return IpcResponse::error("PEER_UNAVAILABLE");
                };
                match self.download_file(file_id, peer_id) {
                    Ok(session_id) => IpcResponse::ok("download started")
                        .with("session_id", session_id)
                        .with("peer_id", peer_id.to_string()),
                    Err(e) => IpcResponse::error(e.to_string()),
                }
            }
            Some(other) => IpcResponse::error(format!("unknown command: {}", other)),
            None => IpcResponse::error("empty command"),
        }
    }

    fn ipc_status(&self) -> IpcResponse {
        let (file_count, total_size) = {
            let index = self.file_index.lock().expect("file index lock poisoned");
            (
                index.file_count().unwrap_or(0),
                index.total_size().unwrap_or(0),
            )
        };
        let stats = self.router.stats();
        IpcResponse::ok("running")
            .with("peer_id", self.local_peer_id.to_string())
            .with("fingerprint", self.identity.fingerprint())
            .with("port", self.listen_port().to_string())
            .with("peers", self.connections.authenticated_count().to_string())
            .with("known_peers", stats.total_peers.to_string())
            .with("files", file_count.to_string())
            .with("total_size", total_size.to_string())
            .with(
                "transfers",
                self.transfers
                    .lock()
                    .expect("transfers lock poisoned")
                    .active_count()
                    .to_string(),
            )
    }

    fn ipc_peers(&self) -> IpcResponse {
        let peers = self.router.known_peers();
        let mut response = IpcResponse::ok(format!("{} peers known", peers.len()));
        for (i, peer) in peers.iter().enumerate() {
            response = response.with(
                format!("peer.{}", i),
                format!(
                    "{}@{}:{} hops={} reliability={:.2}",
                    peer.peer_id, peer.ip_address, peer.port, peer.hop_count, peer.reliability_score
                ),
            );
        }
        response
    }

    fn ipc_files(&self) -> IpcResponse {
        let files = self
            .file_index
            .lock()
            .expect("file index lock poisoned")
            .list_files()
            .unwrap_or_default();
        let mut response = IpcResponse::ok(format!("{} files indexed", files.len()));
        for (i, file) in files.iter().enumerate() {
            response = response.with(
                format!("file.{}", i),
                format!("{}|{}|{}", file.file_id, file.filename, file.file_size),
            );
        }
        response
    }

    fn ipc_transfers(&self) -> IpcResponse {
        let transfers = self.transfers.lock().expect("transfers lock poisoned");
        let monitor = self.monitor.lock().expect("monitor lock poisoned");
        let sessions: Vec<String> = transfers
            .all_sessions()
            .map(|session| {
                let stats = monitor.session_stats(session.session_id());
                format!(
                    "{}|{}|{:?}|{:.1}%|{}bps",
                    session.session_id(),
                    session.file_id(),
                    session.state(),
                    session.progress_percentage(),
                    stats.current_speed_bps,
                )
            })
            .collect();

        let mut response = IpcResponse::ok(format!("{} transfers", sessions.len()));
        for (i, line) in sessions.iter().enumerate() {
            response = response.with(format!("transfer.{}", i), line.clone());
        }
        response
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.local_peer_id)
            .field("listen_port", &self.listen_port())
            .finish()
    }
}
