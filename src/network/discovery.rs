//! LAN peer discovery over UDP multicast.
//!
//! The discovery actor joins group `239.255.42.99`, disables multicast
//! loopback, and announces `{peer_id, tcp_port, timestamp}` every 30
//! seconds. Announcements from other peers update the peer table keyed by
//! peer id, using the datagram's observed source address rather than
//! anything the peer claims. A `PeerQuery` gets an immediate unicast
//! `PeerResponse`. Peers idle past the timeout (2 minutes) are swept every
//! 60 seconds.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use super::messages::{Message, PeerAnnounceMessage};
use super::protocol::{MessageHeader, MessageType, MESSAGE_HEADER_SIZE};

/// Discovery multicast group.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);
/// Default discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8081;
/// How often the local node announces itself.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
/// A peer is dropped after this long without an announcement.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(120);
/// Expiration sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A peer observed on the local network.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub peer_id: u32,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub last_seen: Instant,
}

/// Notifications emitted by the discovery actor.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// First sighting of a peer.
    PeerDiscovered(DiscoveredPeer),
    /// A peer expired from the table.
    PeerLost(u32),
}

pub struct Discovery {
    local_peer_id: u32,
    tcp_port: u16,
    socket: Arc<UdpSocket>,
    multicast_target: SocketAddr,
    peers: Mutex<HashMap<u32, DiscoveredPeer>>,
    event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    running: AtomicBool,
    shutdown: Notify,
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Discovery {
    /// Bind the discovery socket, join the multicast group, and start the
    /// announce, receive, and sweep loops.
    pub async fn start(
        local_peer_id: u32,
        tcp_port: u16,
        discovery_port: u16,
        event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port)).await?;
        if let Err(e) = socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED) {
            warn!(error = %e, "could not join multicast group; discovery limited to unicast");
        }
        let _ = socket.set_multicast_loop_v4(false);
        let bound_port = socket.local_addr()?.port();

        let discovery = Arc::new(Self {
            local_peer_id,
            tcp_port,
            socket: Arc::new(socket),
            multicast_target: SocketAddr::from((MULTICAST_GROUP, bound_port)),
            peers: Mutex::new(HashMap::new()),
            event_tx,
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        });

        info!(
            peer = local_peer_id,
            port = bound_port,
            group = %MULTICAST_GROUP,
            "discovery started"
        );

        discovery.clone().spawn_receive_loop();
        discovery.clone().spawn_announce_loop();
        discovery.clone().spawn_sweep_loop();

        Ok(discovery)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.shutdown.notify_waiters();
    }

    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn peer(&self, peer_id: u32) -> Option<DiscoveredPeer> {
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .get(&peer_id)
            .cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peers lock poisoned").len()
    }

    fn announce_message(&self) -> Message {
        Message::PeerAnnounce(PeerAnnounceMessage {
            peer_id: self.local_peer_id,
            // Receivers use the datagram source address instead.
            ip_address: "0.0.0.0".to_string(),
            port: self.tcp_port,
            last_seen: now_unix_secs(),
        })
    }

    /// Multicast one announcement now.
    pub async fn announce(&self) {
        let frame = self.announce_message().to_frame();
        if let Err(e) = self.socket.send_to(&frame, self.multicast_target).await {
            debug!(error = %e, "announcement send failed");
        } else {
            trace!(peer = self.local_peer_id, "announced");
        }
    }

    /// Multicast a query; peers answer with unicast responses.
    pub async fn query_peers(&self) {
        let frame = Message::PeerQuery.to_frame();
        if let Err(e) = self.socket.send_to(&frame, self.multicast_target).await {
            debug!(error = %e, "peer query send failed");
        }
    }

    /// Parse and dispatch one datagram. Malformed datagrams are dropped
    /// silently; UDP carries no connection to punish.
    pub async fn handle_datagram(&self, source: SocketAddr, data: &[u8]) {
        if data.len() < MESSAGE_HEADER_SIZE {
            return;
        }
        let Ok(header) = MessageHeader::decode(&data[..MESSAGE_HEADER_SIZE]) else {
            return;
        };
        let total = MESSAGE_HEADER_SIZE + header.payload_size as usize;
        if data.len() < total {
            return;
        }
        let payload = &data[MESSAGE_HEADER_SIZE..total];
        if !header.verify_checksum(payload) {
            debug!(source = %source, "discovery datagram failed checksum");
            return;
        }

        match header.msg_type {
            MessageType::PeerAnnounce | MessageType::PeerResponse => {
                if let Ok(Message::PeerAnnounce(msg) | Message::PeerResponse(msg)) =
                    Message::decode(header.msg_type, payload)
                {
                    self.handle_announce(source, &msg);
                }
            }
            MessageType::PeerQuery => self.handle_query(source).await,
            other => {
                trace!(source = %source, msg_type = ?other, "ignoring discovery message");
            }
        }
    }

    /// Update the peer table from an announcement. Self-announcements are
    /// ignored; first sightings emit `PeerDiscovered`.
    pub fn handle_announce(&self, source: SocketAddr, msg: &PeerAnnounceMessage) {
        if msg.peer_id == self.local_peer_id {
            return;
        }

        let peer = DiscoveredPeer {
            peer_id: msg.peer_id,
            ip: source.ip(),
            tcp_port: msg.port,
            last_seen: Instant::now(),
        };

        let is_new = {
            let mut peers = self.peers.lock().expect("peers lock poisoned");
            peers.insert(msg.peer_id, peer.clone()).is_none()
        };

        if is_new {
            info!(peer = msg.peer_id, ip = %peer.ip, port = peer.tcp_port, "peer discovered");
            let _ = self.event_tx.send(DiscoveryEvent::PeerDiscovered(peer));
        } else {
            trace!(peer = msg.peer_id, "peer refreshed");
        }
    }

    async fn handle_query(&self, source: SocketAddr) {
        let response = Message::PeerResponse(PeerAnnounceMessage {
            peer_id: self.local_peer_id,
            ip_address: "0.0.0.0".to_string(),
            port: self.tcp_port,
            last_seen: now_unix_secs(),
        });
        if let Err(e) = self.socket.send_to(&response.to_frame(), source).await {
            debug!(error = %e, source = %source, "peer response send failed");
        }
    }

    /// Drop peers that have not announced within the timeout, emitting
    /// `PeerLost` for each.
    pub fn sweep_expired(&self) {
        let mut lost = Vec::new();
        {
            let mut peers = self.peers.lock().expect("peers lock poisoned");
            peers.retain(|&peer_id, peer| {
                if peer.last_seen.elapsed() > PEER_TIMEOUT {
                    lost.push(peer_id);
                    false
                } else {
                    true
                }
            });
        }
        for peer_id in lost {
            info!(peer = peer_id, "peer expired");
            let _ = self.event_tx.send(DiscoveryEvent::PeerLost(peer_id));
        }
    }

    fn spawn_receive_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            while self.running.load(Ordering::Relaxed) {
                tokio::select! {
                    result = self.socket.recv_from(&mut buf) => match result {
                        Ok((len, source)) => {
                            let data = buf[..len].to_vec();
                            self.handle_datagram(source, &data).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "discovery receive failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    _ = self.shutdown.notified() => break,
                }
            }
            info!("discovery receive loop stopped");
        });
    }

    fn spawn_announce_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            while self.running.load(Ordering::Relaxed) {
                self.announce().await;
                tokio::select! {
                    _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
                    _ = self.shutdown.notified() => break,
                }
            }
            info!("discovery announce loop stopped");
        });
    }

    fn spawn_sweep_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            while self.running.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => self.sweep_expired(),
                    _ = self.shutdown.notified() => break,
                }
            }
            info!("discovery sweep loop stopped");
        });
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("local_peer_id", &self.local_peer_id)
            .field("peer_count", &self.peer_count())
            .finish()
    }
}
