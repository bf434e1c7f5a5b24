//! Connection manager: listener, dialer, the connections map, and the
//! health supervisor.
//!
//! The supervisor runs every 5 seconds. Authenticated connections idle past
//! the heartbeat interval get a heartbeat; connections idle past the
//! connection timeout are closed; connections that never authenticated
//! within the handshake timeout are closed. Disconnected entries are
//! reaped from the map.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionEvent, ConnectionState};
use super::messages::{HeartbeatMessage, Message};

/// Supervisor tick.
pub const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(5);
/// Idle time before a heartbeat is sent.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Idle time before an authenticated connection is closed.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);
/// Time an unauthenticated connection may exist before being closed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConnectionManager {
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_connection_id: AtomicU64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Advertised in heartbeats; maintained by the node.
    available_files: AtomicU32,
    running: AtomicBool,
}

impl ConnectionManager {
    pub fn new(event_tx: mpsc::UnboundedSender<ConnectionEvent>) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            event_tx,
            available_files: AtomicU32::new(0),
            running: AtomicBool::new(true),
        })
    }

    /// Register an established stream and start its IO tasks.
    pub fn add_connection(&self, stream: TcpStream) -> Arc<Connection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::spawn(id, stream, self.event_tx.clone());
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .insert(id, connection.clone());
        debug!(conn = id, remote = %connection.remote_addr(), "connection added");
        connection
    }

    /// Bind and run the accept loop until shutdown.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening for peers");

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if !manager.running.load(Ordering::Relaxed) {
                            break;
                        }
                        debug!(remote = %remote, "inbound connection accepted");
                        manager.add_connection(stream);
                    }
                    Err(e) => {
                        if !manager.running.load(Ordering::Relaxed) {
                            break;
                        }
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            info!("accept loop stopped");
        });

        Ok(local_addr)
    }

    /// Dial a peer and register the connection.
    pub async fn connect(&self, addr: SocketAddr) -> std::io::Result<Arc<Connection>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(self.add_connection(stream))
    }

    pub fn get(&self, connection_id: u64) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .get(&connection_id)
            .cloned()
    }

    /// Find the authenticated connection for a peer id.
    pub fn get_by_peer(&self, peer_id: u32) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .values()
            .find(|c| c.is_authenticated() && c.peer_id() == peer_id)
            .cloned()
    }

    pub fn remove(&self, connection_id: u64) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .remove(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .values()
            .filter(|c| c.is_authenticated())
            .count()
    }

    /// Authenticated peer ids with open connections.
    pub fn connected_peers(&self) -> Vec<u32> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .values()
            .filter(|c| c.is_authenticated())
            .map(|c| c.peer_id())
            .collect()
    }

    pub fn set_available_files(&self, count: u32) {
        self.available_files.store(count, Ordering::Relaxed);
    }

    /// Send to every authenticated connection. Returns how many sends were
    /// enqueued.
    pub fn broadcast(&self, message: &Message) -> usize {
        let connections: Vec<Arc<Connection>> = {
            let map = self.connections.lock().expect("connections lock poisoned");
            map.values()
                .filter(|c| c.is_authenticated())
                .cloned()
                .collect()
        };

        let mut sent = 0;
        for connection in connections {
            if connection.send(message).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Send to one peer by id. `false` when no authenticated connection
    /// exists or the enqueue failed.
    pub fn send_to_peer(&self, peer_id: u32, message: &Message) -> bool {
        match self.get_by_peer(peer_id) {
            Some(connection) => connection.send(message).is_ok(),
            None => false,
        }
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        let connections: Vec<Arc<Connection>> = {
            let map = self.connections.lock().expect("connections lock poisoned");
            map.values().cloned().collect()
        };
        for connection in connections {
            connection.close();
        }
    }

    fn heartbeat_message(&self) -> Message {
        Message::Heartbeat(HeartbeatMessage {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default(),
            active_connections: self.authenticated_count() as u32,
            available_files: self.available_files.load(Ordering::Relaxed),
        })
    }

    /// One supervisor pass over all connections.
    pub fn run_health_check(&self) {
        let connections: Vec<Arc<Connection>> = {
            let map = self.connections.lock().expect("connections lock poisoned");
            map.values().cloned().collect()
        };

        let mut reap = Vec::new();
        for connection in connections {
            match connection.state() {
                ConnectionState::Disconnected => reap.push(connection.id()),
                ConnectionState::Authenticated => {
                    let idle = connection.last_activity().elapsed();
                    if idle > CONNECTION_TIMEOUT {
                        warn!(conn = connection.id(), "connection timed out, closing");
                        connection.close();
                    } else if idle > HEARTBEAT_INTERVAL {
                        let _ = connection.send(&self.heartbeat_message());
                    }
                }
                ConnectionState::Connected => {
                    if connection.created_at().elapsed() > HANDSHAKE_TIMEOUT {
                        warn!(conn = connection.id(), "handshake timed out, closing");
                        connection.close();
                    }
                }
                _ => {}
            }
        }

        if !reap.is_empty() {
            let mut map = self.connections.lock().expect("connections lock poisoned");
            for id in reap {
                map.remove(&id);
            }
        }
    }

    /// Run the health supervisor until shutdown.
    pub fn spawn_supervisor(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            info!("connection supervisor started");
            while manager.running.load(Ordering::Relaxed) {
                tokio::time::sleep(SUPERVISOR_INTERVAL).await;
                manager.run_health_check();
            }
            info!("connection supervisor stopped");
        });
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager_with_listener() -> (
        Arc<ConnectionManager>,
        SocketAddr,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(tx);
        let addr = manager
            .listen(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        (manager, addr, rx)
    }

    #[tokio::test]
    async fn test_connect_registers_connection() {
        let (server, addr, _rx) = manager_with_listener().await;

        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        let client = ConnectionManager::new(client_tx);
        let connection = client.connect(addr).await.unwrap();

        assert_eq!(client.connection_count(), 1);
        assert_eq!(connection.state(), ConnectionState::Connected);

        // Give the accept loop a moment to register the inbound side
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_get_by_peer_requires_authentication() {
        let (_server, addr, _rx) = manager_with_listener().await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        let client = ConnectionManager::new(tx);
        let connection = client.connect(addr).await.unwrap();

        assert!(client.get_by_peer(55).is_none());
        connection.set_authenticated(55);
        assert_eq!(client.get_by_peer(55).unwrap().id(), connection.id());
        assert_eq!(client.authenticated_count(), 1);
        assert_eq!(client.connected_peers(), vec![55]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_authenticated() {
        let (_server, addr, _rx) = manager_with_listener().await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        let client = ConnectionManager::new(tx);

        let authed = client.connect(addr).await.unwrap();
        let _unauthed = client.connect(addr).await.unwrap();
        authed.set_authenticated(9);

        let sent = client.broadcast(&Message::Disconnect);
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn test_health_check_reaps_disconnected() {
        let (_server, addr, _rx) = manager_with_listener().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ConnectionManager::new(tx);
        let connection = client.connect(addr).await.unwrap();

        connection.close();
        // Wait for the reader to report closure
        while let Some(event) = rx.recv().await {
            if matches!(event, ConnectionEvent::Closed { .. }) {
                break;
            }
        }

        client.run_health_check();
        assert_eq!(client.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let (_server, addr, _rx) = manager_with_listener().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ConnectionManager::new(tx);
        let _a = client.connect(addr).await.unwrap();
        let _b = client.connect(addr).await.unwrap();

        client.shutdown();

        let mut closed = 0;
        while closed < 2 {
            match rx.recv().await {
                Some(ConnectionEvent::Closed { .. }) => closed += 1,
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(closed, 2);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(tx);
        assert!(!manager.send_to_peer(404, &Message::Disconnect));
    }
}
