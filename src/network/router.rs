//! Multi-hop peer routing and the distributed file-location index.
//!
//! A distance-vector routing table reaches peers beyond direct connections:
//! route updates advertise known peers, and a route installs when the peer
//! is unknown, the hop count drops, or an equal-hop route has a better
//! metric. The metric blends hop count (20%), reliability (40%, EWMA on
//! delivery outcomes), and inverse bandwidth (40%); lower is better.
//!
//! File queries flood with deduplication: the originator derives a query id
//! from the file id and search terms, caches it, and broadcasts with hop
//! count zero. Holders answer the originator via routed send; everyone else
//! forwards to a random subset of direct peers until the hop limit.
//!
//! Lock order: `routing` before `files`, never the reverse. Senders are
//! invoked only after all locks are released.

use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, trace, warn};

use super::messages::{
    FileAnnounceMessage, FileLocationInfo, FileQueryMessage, FileQueryResponseMessage, Message,
    RouteUpdateMessage, RoutingPeerInfo, TopologySyncMessage,
};
use super::protocol::crc32;

/// Routes beyond this hop count are discarded.
pub const MAX_HOP_COUNT: u8 = 16;
/// Maintenance cycle cadence.
pub const TOPOLOGY_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
/// Routing table size cap; overflowing entries are dropped.
const MAX_ROUTING_ENTRIES: usize = 10_000;
/// File-location index size cap per file id.
const MAX_FILE_LOCATIONS: usize = 50_000;
/// Fan-out of query flooding.
const MAX_FLOODING_TARGETS: usize = 5;
/// Reliability decay per maintenance cycle.
const RELIABILITY_DECAY_FACTOR: f64 = 0.95;
const HOP_COUNT_WEIGHT: f64 = 0.2;
const RELIABILITY_WEIGHT: f64 = 0.4;
const BANDWIDTH_WEIGHT: f64 = 0.4;
/// Known peers and routes expire after this long without refresh.
const ROUTE_TTL: Duration = Duration::from_secs(300);
/// File locations expire after an hour without a fresh announcement.
const FILE_LOCATION_TTL: Duration = Duration::from_secs(3600);
/// Query cache entries suppress duplicates for this long.
const QUERY_DEDUP_WINDOW: Duration = Duration::from_secs(60);
/// Query cache entries are dropped entirely after this long.
const QUERY_CACHE_TTL: Duration = Duration::from_secs(300);

/// One reachable peer as the router sees it.
#[derive(Debug, Clone)]
pub struct RouterPeer {
    pub peer_id: u32,
    pub ip_address: String,
    pub port: u16,
    pub hop_count: u8,
    pub next_hop_peer_id: u32,
    pub reliability_score: f64,
    pub bandwidth_estimate: u64,
    pub last_seen: Instant,
}

impl RouterPeer {
    pub fn is_direct(&self) -> bool {
        self.hop_count == 1
    }

    fn to_wire(&self) -> RoutingPeerInfo {
        let last_seen_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
            .saturating_sub(self.last_seen.elapsed().as_millis() as u64);
        RoutingPeerInfo {
            peer_id: self.peer_id,
            ip_address: self.ip_address.clone(),
            port: self.port,
            last_seen_ms,
            hop_count: self.hop_count,
            next_hop_peer_id: self.next_hop_peer_id,
            reliability_score: self.reliability_score,
            bandwidth_estimate: self.bandwidth_estimate,
        }
    }
}

/// One routing table entry.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub destination_peer_id: u32,
    pub next_hop_peer_id: u32,
    pub hop_count: u8,
    pub last_updated: Instant,
    pub metric: f64,
}

impl RouteEntry {
    pub fn is_expired(&self) -> bool {
        self.last_updated.elapsed() > ROUTE_TTL
    }
}

/// One known location of a file.
#[derive(Debug, Clone)]
pub struct FileLocation {
    pub file_id: String,
    pub peer_id: u32,
    pub file_hash: String,
    pub file_size: u64,
    pub announced_at: Instant,
    pub availability_score: f64,
}

impl FileLocation {
    fn to_wire(&self) -> FileLocationInfo {
        let announced_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
            .saturating_sub(self.announced_at.elapsed().as_millis() as u64);
        FileLocationInfo {
            file_id: self.file_id.clone(),
            peer_id: self.peer_id,
            file_hash: self.file_hash.clone(),
            file_size: self.file_size,
            announced_at_ms,
            availability_score: self.availability_score,
        }
    }
}

/// Counters exposed for the daemon status surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub total_peers: usize,
    pub direct_peers: usize,
    pub route_entries: usize,
    pub known_files: usize,
    pub messages_forwarded: u64,
    pub queries_processed: u64,
}

/// Routed unicast sink: `(destination_peer_id, message)`.
pub type MessageSender = Box<dyn Fn(u32, Message) + Send + Sync>;
/// Broadcast sink to all direct peers.
pub type BroadcastSender = Box<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Default)]
struct RoutingState {
    known_peers: HashMap<u32, RouterPeer>,
    routing_table: HashMap<u32, RouteEntry>,
    query_cache: HashMap<u32, Instant>,
    route_sequence: u64,
}

#[derive(Debug, Default)]
struct FileState {
    file_locations: HashMap<String, Vec<FileLocation>>,
    local_files: HashSet<String>,
}

pub struct PeerRouter {
    local_peer_id: u32,
    routing: Mutex<RoutingState>,
    files: Mutex<FileState>,
    stats: Mutex<RouterStats>,
    message_sender: OnceLock<MessageSender>,
    broadcast_sender: OnceLock<BroadcastSender>,
    running: AtomicBool,
}

fn calculate_route_metric(hop_count: u8, reliability: f64, bandwidth: u64) -> f64 {
    let mut metric = f64::from(hop_count) * HOP_COUNT_WEIGHT;
    metric += (1.0 - reliability) * RELIABILITY_WEIGHT;
    let bandwidth_factor = 1_000_000.0 / (bandwidth as f64).max(1000.0);
    metric + bandwidth_factor * BANDWIDTH_WEIGHT
}

impl PeerRouter {
    pub fn new(local_peer_id: u32) -> Arc<Self> {
        info!(peer = local_peer_id, "peer router created");
        Arc::new(Self {
            local_peer_id,
            routing: Mutex::new(RoutingState::default()),
            files: Mutex::new(FileState::default()),
            stats: Mutex::new(RouterStats::default()),
            message_sender: OnceLock::new(),
            broadcast_sender: OnceLock::new(),
            running: AtomicBool::new(true),
        })
    }

    pub fn local_peer_id(&self) -> u32 {
        self.local_peer_id
    }

    pub fn set_message_sender(&self, sender: MessageSender) {
        let _ = self.message_sender.set(sender);
    }

    pub fn set_broadcast_sender(&self, sender: BroadcastSender) {
        let _ = self.broadcast_sender.set(sender);
    }

    fn send_routed(&self, destination: u32, message: Message) -> bool {
        match self.message_sender.get() {
            Some(sender) => {
                sender(destination, message);
                true
            }
            None => false,
        }
    }

    fn broadcast(&self, message: Message) {
        if let Some(sender) = self.broadcast_sender.get() {
            sender(message);
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Register a directly connected peer: hop count 1, full reliability,
    /// route installed immediately.
    pub fn add_direct_peer(&self, peer_id: u32, ip: IpAddr, port: u16) {
        {
            let mut routing = self.routing.lock().expect("routing lock poisoned");
            let peer = RouterPeer {
                peer_id,
                ip_address: ip.to_string(),
                port,
                hop_count: 1,
                next_hop_peer_id: peer_id,
                reliability_score: 1.0,
                bandwidth_estimate: 1_000_000,
                last_seen: Instant::now(),
            };
            let metric =
                calculate_route_metric(1, peer.reliability_score, peer.bandwidth_estimate);
            routing.known_peers.insert(peer_id, peer);
            routing.routing_table.insert(
                peer_id,
                RouteEntry {
                    destination_peer_id: peer_id,
                    next_hop_peer_id: peer_id,
                    hop_count: 1,
                    last_updated: Instant::now(),
                    metric,
                },
            );
        }
        self.refresh_stats();
        info!(peer = peer_id, ip = %ip, port, "direct peer added");
    }

    /// Drop a peer and every route that relayed through it.
    pub fn remove_peer(&self, peer_id: u32) {
        {
            let mut routing = self.routing.lock().expect("routing lock poisoned");
            routing.known_peers.remove(&peer_id);
            routing.routing_table.remove(&peer_id);
            routing
                .routing_table
                .retain(|_, route| route.next_hop_peer_id != peer_id);
        }
        self.refresh_stats();
        info!(peer = peer_id, "peer removed");
    }

    /// Record a locally shared file and broadcast its announcement.
    pub fn announce_file(&self, announce: FileAnnounceMessage) {
        {
            let mut files = self.files.lock().expect("files lock poisoned");
            files.local_files.insert(announce.file_id.clone());
            let locations = files
                .file_locations
                .entry(announce.file_id.clone())
                .or_default();
            locations.retain(|l| l.peer_id != self.local_peer_id);
            locations.push(FileLocation {
                file_id: announce.file_id.clone(),
                peer_id: self.local_peer_id,
                file_hash: announce.file_hash.clone(),
                file_size: announce.file_size,
                announced_at: Instant::now(),
                availability_score: 1.0,
            });
        }
        self.refresh_stats();
        info!(file = %announce.file_id, size = announce.file_size, "file announced");
        self.broadcast(Message::FileAnnounce(announce));
    }

    /// Forget a locally shared file.
    pub fn remove_file(&self, file_id: &str) {
        let mut files = self.files.lock().expect("files lock poisoned");
        files.local_files.remove(file_id);
        if let Some(locations) = files.file_locations.get_mut(file_id) {
            locations.retain(|l| l.peer_id != self.local_peer_id);
            if locations.is_empty() {
                files.file_locations.remove(file_id);
            }
        }
        drop(files);
        self.refresh_stats();
        info!(file = file_id, "file removed");
    }

    /// Record a remote peer's file announcement.
    pub fn handle_file_announce(&self, source_peer_id: u32, announce: &FileAnnounceMessage) {
        let mut files = self.files.lock().expect("files lock poisoned");
        let locations = files
            .file_locations
            .entry(announce.file_id.clone())
            .or_default();
        if locations.len() >= MAX_FILE_LOCATIONS {
            return;
        }
        locations.retain(|l| l.peer_id != source_peer_id);
        locations.push(FileLocation {
            file_id: announce.file_id.clone(),
            peer_id: source_peer_id,
            file_hash: announce.file_hash.clone(),
            file_size: announce.file_size,
            announced_at: Instant::now(),
            availability_score: 1.0,
        });
        drop(files);
        debug!(file = %announce.file_id, peer = source_peer_id, "file location recorded");
    }

    /// Query id: CRC32 of the file id joined with its search terms.
    fn query_id_for(file_id: &str, search_terms: &[String]) -> u32 {
        let mut joined = file_id.to_string();
        for term in search_terms {
            joined.push('|');
            joined.push_str(term);
        }
        crc32(joined.as_bytes())
    }

    /// Look up a file. Known locations return immediately; otherwise a
    /// flood query goes out and locations arrive asynchronously through
    /// [`handle_file_query_response`](Self::handle_file_query_response).
    pub fn find_file(&self, file_id: &str, search_terms: &[String]) -> Vec<FileLocation> {
        {
            let files = self.files.lock().expect("files lock poisoned");
            if let Some(locations) = files.file_locations.get(file_id) {
                if !locations.is_empty() {
                    debug!(file = file_id, hits = locations.len(), "file found in local index");
                    return locations.clone();
                }
            }
        }

        let query_id = Self::query_id_for(file_id, search_terms);
        {
            let mut routing = self.routing.lock().expect("routing lock poisoned");
            routing.query_cache.insert(query_id, Instant::now());
        }
        {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.queries_processed += 1;
        }

        let query = FileQueryMessage {
            file_id: file_id.to_string(),
            query_hash: query_id.to_string(),
            source_peer_id: self.local_peer_id,
            query_id,
            hop_count: 0,
            search_terms: search_terms.to_vec(),
        };
        info!(file = file_id, query = query_id, "file query flooded");
        self.broadcast(Message::FileQuery(query));
        Vec::new()
    }

    /// Next hop toward a destination, if a live route exists.
    pub fn get_next_hop(&self, destination_peer_id: u32) -> Option<u32> {
        let routing = self.routing.lock().expect("routing lock poisoned");
        routing
            .routing_table
            .get(&destination_peer_id)
            .filter(|route| !route.is_expired())
            .map(|route| route.next_hop_peer_id)
    }

    /// Rank known holders of a file by `availability / (1 + hop_count)`,
    /// best first.
    pub fn optimal_peers_for_file(&self, file_id: &str, max_peers: usize) -> Vec<u32> {
        // routing before files, per the lock order
        let routing = self.routing.lock().expect("routing lock poisoned");
        let files = self.files.lock().expect("files lock poisoned");

        let Some(locations) = files.file_locations.get(file_id) else {
            return Vec::new();
        };

        let mut scored: Vec<(u32, f64)> = locations
            .iter()
            .map(|location| {
                let hop_count = routing
                    .routing_table
                    .get(&location.peer_id)
                    .map(|route| route.hop_count)
                    .unwrap_or(0);
                (
                    location.peer_id,
                    location.availability_score / (1.0 + f64::from(hop_count)),
                )
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(max_peers).map(|(id, _)| id).collect()
    }

    /// Send a message toward a non-adjacent destination via its next hop.
    /// No retry at this layer.
    pub fn forward_message(&self, destination_peer_id: u32, message: Message) -> bool {
        let Some(next_hop) = self.get_next_hop(destination_peer_id) else {
            warn!(peer = destination_peer_id, "no route to peer");
            return false;
        };
        if self.send_routed(next_hop, message) {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.messages_forwarded += 1;
            true
        } else {
            false
        }
    }

    /// Fold a route update into the table.
    pub fn handle_route_update(&self, message: &RouteUpdateMessage) {
        if message.source_peer_id == self.local_peer_id {
            return;
        }
        if message.hop_count >= MAX_HOP_COUNT {
            warn!(source = message.source_peer_id, "route update over hop limit dropped");
            return;
        }

        let mut routing_changed = false;
        {
            let mut routing = self.routing.lock().expect("routing lock poisoned");
            for advertised in &message.peer_updates {
                if advertised.peer_id == self.local_peer_id {
                    continue;
                }
                let new_hop_count = advertised.hop_count.saturating_add(1);
                if new_hop_count > MAX_HOP_COUNT {
                    continue;
                }

                let new_metric = calculate_route_metric(
                    new_hop_count,
                    advertised.reliability_score,
                    advertised.bandwidth_estimate,
                );
                let should_install = match routing.routing_table.get(&advertised.peer_id) {
                    None => true,
                    Some(existing) => {
                        new_hop_count < existing.hop_count
                            || (new_hop_count == existing.hop_count && new_metric < existing.metric)
                    }
                };

                if should_install && routing.routing_table.len() < MAX_ROUTING_ENTRIES {
                    routing.known_peers.insert(
                        advertised.peer_id,
                        RouterPeer {
                            peer_id: advertised.peer_id,
                            ip_address: advertised.ip_address.clone(),
                            port: advertised.port,
                            hop_count: new_hop_count,
                            next_hop_peer_id: message.source_peer_id,
                            reliability_score: advertised.reliability_score,
                            bandwidth_estimate: advertised.bandwidth_estimate,
                            last_seen: Instant::now(),
                        },
                    );
                    routing.routing_table.insert(
                        advertised.peer_id,
                        RouteEntry {
                            destination_peer_id: advertised.peer_id,
                            next_hop_peer_id: message.source_peer_id,
                            hop_count: new_hop_count,
                            last_updated: Instant::now(),
                            metric: new_metric,
                        },
                    );
                    routing_changed = true;
                    trace!(
                        peer = advertised.peer_id,
                        via = message.source_peer_id,
                        hops = new_hop_count,
                        "route installed"
                    );
                }
            }

            if routing_changed {
                routing.route_sequence += 1;
            }
        }

        if routing_changed {
            self.refresh_stats();
        }
    }

    /// Answer a topology sync with our full peer view.
    pub fn handle_topology_sync(&self, message: &TopologySyncMessage) {
        let response = {
            let routing = self.routing.lock().expect("routing lock poisoned");
            RouteUpdateMessage {
                source_peer_id: self.local_peer_id,
                sequence_number: routing.route_sequence,
                hop_count: 0,
                peer_updates: routing
                    .known_peers
                    .values()
                    .filter(|peer| peer.peer_id != message.requesting_peer_id)
                    .map(RouterPeer::to_wire)
                    .collect(),
            }
        };
        self.send_routed(message.requesting_peer_id, Message::RouteUpdate(response));
        debug!(peer = message.requesting_peer_id, "topology sync answered");
    }

    /// Process a flooded file query: deduplicate, answer if we hold the
    /// file, otherwise forward to a random subset of direct peers.
    pub fn handle_file_query(&self, message: &FileQueryMessage) {
        if message.hop_count >= MAX_HOP_COUNT {
            return;
        }

        // Deduplicate within the window
        {
            let mut routing = self.routing.lock().expect("routing lock poisoned");
            if let Some(seen_at) = routing.query_cache.get(&message.query_id) {
                if seen_at.elapsed() < QUERY_DEDUP_WINDOW {
                    trace!(query = message.query_id, "duplicate query ignored");
                    return;
                }
            }
            routing.query_cache.insert(message.query_id, Instant::now());
        }
        {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.queries_processed += 1;
        }

        // Answer directly when we hold the file
        let matching: Vec<FileLocationInfo> = {
            let files = self.files.lock().expect("files lock poisoned");
            files
                .file_locations
                .get(&message.file_id)
                .map(|locations| {
                    locations
                        .iter()
                        .filter(|l| l.peer_id == self.local_peer_id)
                        .map(FileLocation::to_wire)
                        .collect()
                })
                .unwrap_or_default()
        };

        if !matching.is_empty() {
            let response = FileQueryResponseMessage {
                query_id: message.query_id,
                responding_peer_id: self.local_peer_id,
                file_locations: matching,
            };
            info!(query = message.query_id, peer = message.source_peer_id, "file query answered");
            self.send_routed(message.source_peer_id, Message::FileQueryResponse(response));
            return;
        }

        // Forward with an incremented hop count
        if message.hop_count < MAX_HOP_COUNT - 1 {
            let targets = self.flooding_targets(message.source_peer_id);
            if targets.is_empty() {
                return;
            }
            let mut forwarded = message.clone();
            forwarded.hop_count += 1;
            for target in &targets {
                self.send_routed(*target, Message::FileQuery(forwarded.clone()));
            }
            debug!(query = message.query_id, fanout = targets.len(), "file query forwarded");
        }
    }

    /// Fold response locations into the index.
    pub fn handle_file_query_response(&self, message: &FileQueryResponseMessage) {
        let mut files = self.files.lock().expect("files lock poisoned");
        for info in &message.file_locations {
            let locations = files.file_locations.entry(info.file_id.clone()).or_default();
            let exists = locations
                .iter()
                .any(|l| l.peer_id == info.peer_id && l.file_hash == info.file_hash);
            if !exists && locations.len() < MAX_FILE_LOCATIONS {
                locations.push(FileLocation {
                    file_id: info.file_id.clone(),
                    peer_id: info.peer_id,
                    file_hash: info.file_hash.clone(),
                    file_size: info.file_size,
                    announced_at: Instant::now(),
                    availability_score: info.availability_score,
                });
                debug!(file = %info.file_id, peer = info.peer_id, "file location learned");
            }
        }
        drop(files);
        self.refresh_stats();
    }

    fn flooding_targets(&self, exclude_peer_id: u32) -> Vec<u32> {
        let routing = self.routing.lock().expect("routing lock poisoned");
        let mut candidates: Vec<u32> = routing
            .known_peers
            .values()
            .filter(|peer| peer.is_direct() && peer.peer_id != exclude_peer_id)
            .map(|peer| peer.peer_id)
            .collect();
        drop(routing);

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(MAX_FLOODING_TARGETS);
        candidates
    }

    /// Adjust a peer's reliability after a delivery outcome and refresh its
    /// route metric.
    pub fn update_peer_reliability(&self, peer_id: u32, success: bool) {
        let mut routing = self.routing.lock().expect("routing lock poisoned");
        let Some(peer) = routing.known_peers.get_mut(&peer_id) else {
            return;
        };
        peer.reliability_score = if success {
            (peer.reliability_score + 0.1).min(1.0)
        } else {
            (peer.reliability_score - 0.2).max(0.0)
        };
        let (hops, reliability, bandwidth) = (
            peer.hop_count,
            peer.reliability_score,
            peer.bandwidth_estimate,
        );
        if let Some(route) = routing.routing_table.get_mut(&peer_id) {
            route.metric = calculate_route_metric(hops, reliability, bandwidth);
        }
    }

    /// Adjust a file location's availability after a fetch outcome,
    /// clamped to `[0, 1]`.
    pub fn update_availability(&self, file_id: &str, peer_id: u32, success: bool) {
        let mut files = self.files.lock().expect("files lock poisoned");
        if let Some(locations) = files.file_locations.get_mut(file_id) {
            for location in locations.iter_mut().filter(|l| l.peer_id == peer_id) {
                location.availability_score = if success {
                    (location.availability_score + 0.1).min(1.0)
                } else {
                    (location.availability_score - 0.2).max(0.0)
                };
            }
        }
    }

    pub fn known_peers(&self) -> Vec<RouterPeer> {
        self.routing
            .lock()
            .expect("routing lock poisoned")
            .known_peers
            .values()
            .cloned()
            .collect()
    }

    pub fn routing_table(&self) -> Vec<RouteEntry> {
        self.routing
            .lock()
            .expect("routing lock poisoned")
            .routing_table
            .values()
            .cloned()
            .collect()
    }

    /// Locations for one file, or every known location when `file_id` is
    /// empty.
    pub fn file_locations(&self, file_id: &str) -> Vec<FileLocation> {
        let files = self.files.lock().expect("files lock poisoned");
        if file_id.is_empty() {
            files.file_locations.values().flatten().cloned().collect()
        } else {
            files.file_locations.get(file_id).cloned().unwrap_or_default()
        }
    }

    pub fn stats(&self) -> RouterStats {
        *self.stats.lock().expect("stats lock poisoned")
    }

    fn refresh_stats(&self) {
        // routing before files, per the lock order
        let routing = self.routing.lock().expect("routing lock poisoned");
        let files = self.files.lock().expect("files lock poisoned");
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.total_peers = routing.known_peers.len();
        stats.direct_peers = routing
            .known_peers
            .values()
            .filter(|p| p.is_direct())
            .count();
        stats.route_entries = routing.routing_table.len();
        stats.known_files = files.file_locations.len();
    }

    /// Expire stale entries, decay reliability, and broadcast our route
    /// update; every fifth cycle also broadcasts a topology sync.
    pub fn run_maintenance_cycle(&self, cycle: u64) {
        let (route_update, topology_sync) = {
            let mut routing = self.routing.lock().expect("routing lock poisoned");

            routing
                .known_peers
                .retain(|_, peer| peer.last_seen.elapsed() <= ROUTE_TTL);
            for peer in routing.known_peers.values_mut() {
                peer.reliability_score *= RELIABILITY_DECAY_FACTOR;
            }
            let live_peers: HashSet<u32> = routing.known_peers.keys().copied().collect();
            routing
                .routing_table
                .retain(|dest, route| live_peers.contains(dest) && !route.is_expired());
            routing
                .query_cache
                .retain(|_, seen_at| seen_at.elapsed() <= QUERY_CACHE_TTL);

            if routing.known_peers.is_empty() {
                (None, None)
            } else {
                routing.route_sequence += 1;
                let update = RouteUpdateMessage {
                    source_peer_id: self.local_peer_id,
                    sequence_number: routing.route_sequence,
                    hop_count: 0,
                    peer_updates: routing.known_peers.values().map(RouterPeer::to_wire).collect(),
                };
                let sync = if cycle % 5 == 0 {
                    Some(TopologySyncMessage {
                        requesting_peer_id: self.local_peer_id,
                        last_known_sequence: routing.route_sequence,
                        known_peers: routing.known_peers.keys().copied().collect(),
                    })
                } else {
                    None
                };
                (Some(update), sync)
            }
        };

        {
            let mut files = self.files.lock().expect("files lock poisoned");
            for locations in files.file_locations.values_mut() {
                locations.retain(|l| l.announced_at.elapsed() <= FILE_LOCATION_TTL);
            }
            files.file_locations.retain(|_, locations| !locations.is_empty());
        }

        self.refresh_stats();

        if let Some(update) = route_update {
            self.broadcast(Message::RouteUpdate(update));
        }
        if let Some(sync) = topology_sync {
            self.broadcast(Message::TopologySync(sync));
        }
    }

    /// Run the maintenance loop until shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let router = self.clone();
        tokio::spawn(async move {
            info!("router maintenance started");
            let mut cycle: u64 = 0;
            while router.running.load(Ordering::Relaxed) {
                tokio::time::sleep(TOPOLOGY_UPDATE_INTERVAL).await;
                cycle += 1;
                router.run_maintenance_cycle(cycle);
            }
            info!("router maintenance stopped");
        });
    }
}

impl std::fmt::Debug for PeerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRouter")
            .field("local_peer_id", &self.local_peer_id)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::score_to_wire;
    use std::sync::mpsc as std_mpsc;

    fn router_with_sinks(
        peer_id: u32,
    ) -> (
        Arc<PeerRouter>,
        std_mpsc::Receiver<(u32, Message)>,
        std_mpsc::Receiver<Message>,
    ) {
        let router = PeerRouter::new(peer_id);
        let (unicast_tx, unicast_rx) = std_mpsc::channel();
        let (broadcast_tx, broadcast_rx) = std_mpsc::channel();
        router.set_message_sender(Box::new(move |dest, msg| {
            let _ = unicast_tx.send((dest, msg));
        }));
        router.set_broadcast_sender(Box::new(move |msg| {
            let _ = broadcast_tx.send(msg);
        }));
        (router, unicast_rx, broadcast_rx)
    }

    fn advertised(peer_id: u32, hop_count: u8) -> RoutingPeerInfo {
        RoutingPeerInfo {
            peer_id,
            ip_address: "10.0.0.9".to_string(),
            port: 8080,
            last_seen_ms: 0,
            hop_count,
            next_hop_peer_id: 0,
            reliability_score: 1.0,
            bandwidth_estimate: 1_000_000,
        }
    }

    #[test]
    fn test_direct_peer_route_invariant() {
        let (router, _u, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);

        let routes = router.routing_table();
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        // hop_count == 1 <=> next_hop == destination
        assert_eq!(route.hop_count, 1);
        assert_eq!(route.next_hop_peer_id, route.destination_peer_id);
        assert_eq!(router.get_next_hop(2), Some(2));

        let stats = router.stats();
        assert_eq!(stats.direct_peers, 1);
        assert_eq!(stats.total_peers, 1);
    }

    #[test]
    fn test_remove_peer_drops_dependent_routes() {
        let (router, _u, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);

        // Peer 3 reachable through peer 2
        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 2,
            sequence_number: 1,
            hop_count: 0,
            peer_updates: vec![advertised(3, 1)],
        });
        assert_eq!(router.get_next_hop(3), Some(2));

        router.remove_peer(2);
        assert_eq!(router.get_next_hop(2), None);
        assert_eq!(router.get_next_hop(3), None);
        assert!(router.routing_table().is_empty());
    }

    #[test]
    fn test_route_update_installs_multi_hop() {
        let (router, _u, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);

        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 2,
            sequence_number: 1,
            hop_count: 0,
            peer_updates: vec![advertised(5, 2)],
        });

        let route = router
            .routing_table()
            .into_iter()
            .find(|r| r.destination_peer_id == 5)
            .unwrap();
        assert_eq!(route.hop_count, 3);
        assert_eq!(route.next_hop_peer_id, 2);
    }

    #[test]
    fn test_route_update_prefers_fewer_hops() {
        let (router, _u, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);
        router.add_direct_peer(4, "10.0.0.4".parse().unwrap(), 8080);

        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 2,
            sequence_number: 1,
            hop_count: 0,
            peer_updates: vec![advertised(9, 4)],
        });
        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 4,
            sequence_number: 1,
            hop_count: 0,
            peer_updates: vec![advertised(9, 1)],
        });

        let route = router
            .routing_table()
            .into_iter()
            .find(|r| r.destination_peer_id == 9)
            .unwrap();
        assert_eq!(route.hop_count, 2);
        assert_eq!(route.next_hop_peer_id, 4);
    }

    #[test]
    fn test_hop_limit_enforced() {
        let (router, _u, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);

        // Advertised at the limit: one more hop would exceed it
        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 2,
            sequence_number: 1,
            hop_count: 0,
            peer_updates: vec![advertised(7, MAX_HOP_COUNT)],
        });
        assert_eq!(router.get_next_hop(7), None);

        // A whole update at the hop ceiling is discarded
        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 2,
            sequence_number: 2,
            hop_count: MAX_HOP_COUNT,
            peer_updates: vec![advertised(8, 1)],
        });
        assert_eq!(router.get_next_hop(8), None);
    }

    #[test]
    fn test_own_updates_ignored() {
        let (router, _u, _b) = router_with_sinks(1);
        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 1,
            sequence_number: 1,
            hop_count: 0,
            peer_updates: vec![advertised(5, 1)],
        });
        assert!(router.routing_table().is_empty());
    }

    #[test]
    fn test_forward_message_uses_next_hop() {
        let (router, unicast_rx, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);
        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 2,
            sequence_number: 1,
            hop_count: 0,
            peer_updates: vec![advertised(5, 1)],
        });

        assert!(router.forward_message(5, Message::Disconnect));
        let (dest, _msg) = unicast_rx.try_recv().unwrap();
        assert_eq!(dest, 2);
        assert_eq!(router.stats().messages_forwarded, 1);

        assert!(!router.forward_message(99, Message::Disconnect));
    }

    #[test]
    fn test_announce_file_broadcasts_and_indexes() {
        let (router, _u, broadcast_rx) = router_with_sinks(1);
        router.announce_file(FileAnnounceMessage {
            file_id: "doc".to_string(),
            filename: "doc.txt".to_string(),
            file_size: 1024,
            file_hash: "H".to_string(),
            tags: vec![],
        });

        let locations = router.file_locations("doc");
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].peer_id, 1);
        assert!((locations[0].availability_score - 1.0).abs() < 1e-9);

        match broadcast_rx.try_recv().unwrap() {
            Message::FileAnnounce(msg) => assert_eq!(msg.file_id, "doc"),
            other => panic!("unexpected broadcast: {:?}", other),
        }
    }

    #[test]
    fn test_find_file_floods_when_unknown() {
        let (router, _u, broadcast_rx) = router_with_sinks(1);

        let immediate = router.find_file("doc", &["report".to_string()]);
        assert!(immediate.is_empty());

        match broadcast_rx.try_recv().unwrap() {
            Message::FileQuery(query) => {
                assert_eq!(query.file_id, "doc");
                assert_eq!(query.hop_count, 0);
                assert_eq!(query.source_peer_id, 1);
                assert_eq!(query.query_id, crc32(b"doc|report"));
            }
            other => panic!("unexpected broadcast: {:?}", other),
        }
    }

    #[test]
    fn test_query_response_populates_index() {
        // Scenario: peer X announces, peer Y queries, Y learns the location
        let (router_y, _u, _b) = router_with_sinks(200);
        router_y.find_file("doc", &[]);

        router_y.handle_file_query_response(&FileQueryResponseMessage {
            query_id: crc32(b"doc"),
            responding_peer_id: 100,
            file_locations: vec![FileLocationInfo {
                file_id: "doc".to_string(),
                peer_id: 100,
                file_hash: "H".to_string(),
                file_size: 1024,
                announced_at_ms: 0,
                availability_score: 1.0,
            }],
        });

        let locations = router_y.file_locations("doc");
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].peer_id, 100);
        assert_eq!(locations[0].file_hash, "H");
        assert_eq!(locations[0].file_size, 1024);

        // Duplicate responses do not duplicate entries
        router_y.handle_file_query_response(&FileQueryResponseMessage {
            query_id: crc32(b"doc"),
            responding_peer_id: 100,
            file_locations: vec![FileLocationInfo {
                file_id: "doc".to_string(),
                peer_id: 100,
                file_hash: "H".to_string(),
                file_size: 1024,
                announced_at_ms: 0,
                availability_score: 1.0,
            }],
        });
        assert_eq!(router_y.file_locations("doc").len(), 1);
    }

    #[test]
    fn test_holder_answers_query_directly() {
        let (router, unicast_rx, _b) = router_with_sinks(50);
        router.add_direct_peer(60, "10.0.0.6".parse().unwrap(), 8080);
        router.announce_file(FileAnnounceMessage {
            file_id: "doc".to_string(),
            filename: "doc.txt".to_string(),
            file_size: 64,
            file_hash: "H".to_string(),
            tags: vec![],
        });

        router.handle_file_query(&FileQueryMessage {
            file_id: "doc".to_string(),
            query_hash: "1".to_string(),
            source_peer_id: 60,
            query_id: 777,
            hop_count: 0,
            search_terms: vec![],
        });

        let (dest, message) = unicast_rx.try_recv().unwrap();
        assert_eq!(dest, 60);
        match message {
            Message::FileQueryResponse(response) => {
                assert_eq!(response.query_id, 777);
                assert_eq!(response.file_locations.len(), 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_query_suppressed() {
        let (router, unicast_rx, _b) = router_with_sinks(50);
        router.announce_file(FileAnnounceMessage {
            file_id: "doc".to_string(),
            filename: "doc.txt".to_string(),
            file_size: 64,
            file_hash: "H".to_string(),
            tags: vec![],
        });

        let query = FileQueryMessage {
            file_id: "doc".to_string(),
            query_hash: "1".to_string(),
            source_peer_id: 60,
            query_id: 777,
            hop_count: 0,
            search_terms: vec![],
        };
        router.handle_file_query(&query);
        router.handle_file_query(&query);

        assert!(unicast_rx.try_recv().is_ok());
        assert!(unicast_rx.try_recv().is_err(), "second query must be deduplicated");
    }

    #[test]
    fn test_non_holder_forwards_query() {
        let (router, unicast_rx, _b) = router_with_sinks(50);
        router.add_direct_peer(60, "10.0.0.6".parse().unwrap(), 8080);
        router.add_direct_peer(61, "10.0.0.7".parse().unwrap(), 8080);

        router.handle_file_query(&FileQueryMessage {
            file_id: "elsewhere".to_string(),
            query_hash: "1".to_string(),
            source_peer_id: 60,
            query_id: 888,
            hop_count: 0,
            search_terms: vec![],
        });

        // Forwarded to direct peers excluding the source, hop count bumped
        let (dest, message) = unicast_rx.try_recv().unwrap();
        assert_eq!(dest, 61);
        match message {
            Message::FileQuery(forwarded) => assert_eq!(forwarded.hop_count, 1),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(unicast_rx.try_recv().is_err());
    }

    #[test]
    fn test_optimal_peers_ranked_by_availability_and_distance() {
        let (router, _u, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);
        // Peer 3 is two hops away
        router.handle_route_update(&RouteUpdateMessage {
            source_peer_id: 2,
            sequence_number: 1,
            hop_count: 0,
            peer_updates: vec![advertised(3, 1)],
        });

        router.handle_file_query_response(&FileQueryResponseMessage {
            query_id: 1,
            responding_peer_id: 2,
            file_locations: vec![
                FileLocationInfo {
                    file_id: "doc".to_string(),
                    peer_id: 2,
                    file_hash: "H".to_string(),
                    file_size: 10,
                    announced_at_ms: 0,
                    availability_score: 0.9,
                },
                FileLocationInfo {
                    file_id: "doc".to_string(),
                    peer_id: 3,
                    file_hash: "H".to_string(),
                    file_size: 10,
                    announced_at_ms: 0,
                    availability_score: 0.9,
                },
            ],
        });

        // Same availability: the closer peer (hop 1) ranks first
        let ranked = router.optimal_peers_for_file("doc", 10);
        assert_eq!(ranked, vec![2, 3]);

        // Ranking respects the max count
        assert_eq!(router.optimal_peers_for_file("doc", 1), vec![2]);
    }

    #[test]
    fn test_reliability_updates() {
        let (router, _u, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);

        router.update_peer_reliability(2, false);
        let peer = router
            .known_peers()
            .into_iter()
            .find(|p| p.peer_id == 2)
            .unwrap();
        assert!((peer.reliability_score - 0.8).abs() < 1e-9);

        router.update_peer_reliability(2, true);
        let peer = router
            .known_peers()
            .into_iter()
            .find(|p| p.peer_id == 2)
            .unwrap();
        assert!((peer.reliability_score - 0.9).abs() < 1e-9);

        // Clamped at 1.0
        router.update_peer_reliability(2, true);
        router.update_peer_reliability(2, true);
        let peer = router
            .known_peers()
            .into_iter()
            .find(|p| p.peer_id == 2)
            .unwrap();
        assert!((peer.reliability_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_availability_updates_clamped() {
        let (router, _u, _b) = router_with_sinks(1);
        router.handle_file_query_response(&FileQueryResponseMessage {
            query_id: 1,
            responding_peer_id: 2,
            file_locations: vec![FileLocationInfo {
                file_id: "doc".to_string(),
                peer_id: 2,
                file_hash: "H".to_string(),
                file_size: 10,
                announced_at_ms: 0,
                availability_score: 0.1,
            }],
        });

        for _ in 0..3 {
            router.update_availability("doc", 2, false);
        }
        let location = &router.file_locations("doc")[0];
        assert!((location.availability_score - 0.0).abs() < 1e-9);

        for _ in 0..20 {
            router.update_availability("doc", 2, true);
        }
        let location = &router.file_locations("doc")[0];
        assert!((location.availability_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_maintenance_decays_and_broadcasts() {
        let (router, _u, broadcast_rx) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);

        router.run_maintenance_cycle(1);

        let peer = router
            .known_peers()
            .into_iter()
            .find(|p| p.peer_id == 2)
            .unwrap();
        assert!((peer.reliability_score - 0.95).abs() < 1e-9);

        match broadcast_rx.try_recv().unwrap() {
            Message::RouteUpdate(update) => {
                assert_eq!(update.source_peer_id, 1);
                assert_eq!(update.peer_updates.len(), 1);
            }
            other => panic!("unexpected broadcast: {:?}", other),
        }
        // Cycle 1 is not a multiple of 5: no topology sync
        assert!(broadcast_rx.try_recv().is_err());

        router.run_maintenance_cycle(5);
        let mut saw_sync = false;
        while let Ok(message) = broadcast_rx.try_recv() {
            if matches!(message, Message::TopologySync(_)) {
                saw_sync = true;
            }
        }
        assert!(saw_sync, "fifth cycle broadcasts a topology sync");
    }

    #[test]
    fn test_topology_sync_answered_with_routes() {
        let (router, unicast_rx, _b) = router_with_sinks(1);
        router.add_direct_peer(2, "10.0.0.2".parse().unwrap(), 8080);
        router.add_direct_peer(3, "10.0.0.3".parse().unwrap(), 8080);

        router.handle_topology_sync(&TopologySyncMessage {
            requesting_peer_id: 3,
            last_known_sequence: 0,
            known_peers: vec![],
        });

        let (dest, message) = unicast_rx.try_recv().unwrap();
        assert_eq!(dest, 3);
        match message {
            Message::RouteUpdate(update) => {
                // The requester is excluded from the advertisement
                assert_eq!(update.peer_updates.len(), 1);
                assert_eq!(update.peer_updates[0].peer_id, 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_score_survives_wire_conversion() {
        let location = FileLocation {
            file_id: "doc".to_string(),
            peer_id: 2,
            file_hash: "H".to_string(),
            file_size: 10,
            announced_at: Instant::now(),
            availability_score: 0.654321,
        };
        let wire = location.to_wire();
        assert_eq!(score_to_wire(wire.availability_score), 654321);
    }
}
