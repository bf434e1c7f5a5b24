//! Two full nodes on localhost: share on one, download on the other,
//! verify the reassembled file.

use std::path::PathBuf;
use std::time::Duration;

use hypershare::{Config, Node, NodeEvent};

struct TestNode {
    node: std::sync::Arc<Node>,
    _dir: tempfile::TempDir,
}

async fn spawn_node(tag: &str) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.set(
        "storage.base_dir",
        dir.path().join("store").to_string_lossy().to_string(),
    );
    config.set(
        "ipc.socket",
        dir.path()
            .join(format!("{}.sock", tag))
            .to_string_lossy()
            .to_string(),
    );
    config.set("server.port", "0");
    config.set("discovery.enabled", "false");

    let node = Node::new(config).unwrap();
    node.start().await.unwrap();
    TestNode { node, _dir: dir }
}

async fn wait_authenticated(downloader: &TestNode, sharer: &TestNode) {
    // Authentication is observable through the router's peer view
    for _ in 0..100 {
        let authenticated = downloader
            .node
            .router()
            .known_peers()
            .iter()
            .any(|p| p.peer_id == sharer.node.local_peer_id());
        if authenticated {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("handshake never completed");
}

#[tokio::test]
async fn test_share_connect_download() {
    let sharer = spawn_node("sharer").await;
    let downloader = spawn_node("downloader").await;

    // Sharer publishes a 5-chunk file (4 full chunks + remainder)
    let content: Vec<u8> = (0u8..=255).cycle().take(300_000).collect();
    let shared_path = sharer._dir.path().join("payload.bin");
    std::fs::write(&shared_path, &content).unwrap();
    let metadata = sharer.node.share_file(&shared_path).unwrap();
    assert_eq!(metadata.chunk_count, 5);

    // Downloader dials the sharer and completes the handshake
    let addr: std::net::SocketAddr =
        format!("127.0.0.1:{}", sharer.node.listen_port()).parse().unwrap();
    downloader.node.connect_to_peer(addr).await.unwrap();
    wait_authenticated(&downloader, &sharer).await;

    let mut events = downloader.node.events().unwrap();
    downloader
        .node
        .download_file(&metadata.file_id, sharer.node.local_peer_id())
        .unwrap();

    // Wait for completion
    let completed_path: PathBuf = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await.expect("event stream ended") {
                NodeEvent::TransferCompleted { path, file_id, .. } => {
                    assert_eq!(file_id, metadata.file_id);
                    break path;
                }
                NodeEvent::TransferFailed { reason, .. } => {
                    panic!("transfer failed: {}", reason);
                }
                _ => {}
            }
        }
    })
    .await
    .expect("transfer timed out");

    // Reassembled bytes are identical to the original
    let downloaded = std::fs::read(&completed_path).unwrap();
    assert_eq!(downloaded.len(), content.len());
    assert_eq!(downloaded, content);

    sharer.node.shutdown();
    downloader.node.shutdown();
}

#[tokio::test]
async fn test_download_missing_file_fails() {
    let sharer = spawn_node("s2").await;
    let downloader = spawn_node("d2").await;

    let addr: std::net::SocketAddr =
        format!("127.0.0.1:{}", sharer.node.listen_port()).parse().unwrap();
    downloader.node.connect_to_peer(addr).await.unwrap();
    wait_authenticated(&downloader, &sharer).await;

    let mut events = downloader.node.events().unwrap();
    downloader
        .node
        .download_file("no-such-file", sharer.node.local_peer_id())
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.expect("event stream ended") {
                NodeEvent::TransferFailed { reason, .. } => {
                    assert!(reason.contains("not found"), "reason: {}", reason);
                    break;
                }
                NodeEvent::TransferCompleted { .. } => panic!("transfer should not complete"),
                _ => {}
            }
        }
    })
    .await
    .expect("no failure event arrived");

    sharer.node.shutdown();
    downloader.node.shutdown();
}

#[tokio::test]
async fn test_file_announcement_propagates() {
    let sharer = spawn_node("s3").await;
    let listener = spawn_node("d3").await;

    let addr: std::net::SocketAddr =
        format!("127.0.0.1:{}", sharer.node.listen_port()).parse().unwrap();
    listener.node.connect_to_peer(addr).await.unwrap();
    wait_authenticated(&listener, &sharer).await;

    let mut events = listener.node.events().unwrap();

    // Announce after the session is up so the broadcast reaches the peer
    let shared_path = sharer._dir.path().join("announced.bin");
    std::fs::write(&shared_path, vec![9u8; 1024]).unwrap();
    let metadata = sharer.node.share_file(&shared_path).unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.expect("event stream ended") {
                NodeEvent::FileAnnounced {
                    file_id, file_size, ..
                } => {
                    assert_eq!(file_id, metadata.file_id);
                    assert_eq!(file_size, 1024);
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("announcement never arrived");

    // The listener's location index learned the file
    let locations = listener.node.router().file_locations(&metadata.file_id);
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].peer_id, sharer.node.local_peer_id());

    sharer.node.shutdown();
    listener.node.shutdown();
}
