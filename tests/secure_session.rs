//! End-to-end secure session tests: two peers over real TCP sockets run
//! the authenticated handshake and exchange encrypted traffic.

use std::sync::Arc;

use tokio::sync::mpsc;

use hypershare::network::connection::{Connection, ConnectionEvent};
use hypershare::network::manager::ConnectionManager;
use hypershare::network::messages::{HeartbeatMessage, Message};
use hypershare::security::handshake::Handshake;
use hypershare::security::identity::IdentityKeyPair;
use hypershare::security::secure_message::SecureChannel;
use hypershare::security::CryptoError;

async fn tcp_pair() -> (
    Arc<Connection>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    Arc<Connection>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let server_manager = ConnectionManager::new(server_tx.clone());
    let addr = server_manager
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let client_manager = ConnectionManager::new(client_tx);
    let client_conn = client_manager.connect(addr).await.unwrap();

    // The server side surfaces its connection via the first message it
    // receives, so probe with a heartbeat.
    client_conn
        .send(&Message::Heartbeat(HeartbeatMessage {
            timestamp: 0,
            active_connections: 0,
            available_files: 0,
        }))
        .unwrap();
    let server_conn = loop {
        match server_rx.recv().await.unwrap() {
            ConnectionEvent::Message { connection, .. } => break connection,
            ConnectionEvent::Closed { .. } => panic!("connection closed during setup"),
        }
    };

    (client_conn, client_rx, server_conn, server_rx)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Message {
    loop {
        match rx.recv().await.expect("event stream ended") {
            ConnectionEvent::Message { message, .. } => return message,
            ConnectionEvent::Closed { reason, .. } => panic!("connection closed: {}", reason),
        }
    }
}

/// Run the full handshake over the wire and return both secure channels.
async fn establish_session(
    client_conn: &Arc<Connection>,
    client_rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    server_conn: &Arc<Connection>,
    server_rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
) -> (SecureChannel, Handshake, SecureChannel, Handshake) {
    let mut client_hs = Handshake::new(IdentityKeyPair::generate());
    let mut server_hs = Handshake::new(IdentityKeyPair::generate());

    let hello = client_hs.initiate(1001, 8080, "client", 0x01).unwrap();
    client_conn
        .send(&Message::SecureHandshake(hello))
        .unwrap();

    let ack = match next_message(server_rx).await {
        Message::SecureHandshake(msg) => server_hs.respond(&msg, 1002).unwrap(),
        other => panic!("expected handshake, got {:?}", other),
    };
    let server_keys = server_hs.server_session_keys().unwrap();
    server_conn
        .send(&Message::SecureHandshakeAck(ack))
        .unwrap();

    let client_keys = match next_message(client_rx).await {
        Message::SecureHandshakeAck(ack) => client_hs.complete(&ack).unwrap(),
        other => panic!("expected ack, got {:?}", other),
    };

    assert_eq!(client_keys.encryption_key, server_keys.encryption_key);
    assert_eq!(client_keys.mac_key, server_keys.mac_key);

    (
        SecureChannel::new(client_keys),
        client_hs,
        SecureChannel::new(server_keys),
        server_hs,
    )
}

#[tokio::test]
async fn test_handshake_over_tcp_derives_matching_keys() {
    let (client_conn, mut client_rx, server_conn, mut server_rx) = tcp_pair().await;
    let _ = establish_session(&client_conn, &mut client_rx, &server_conn, &mut server_rx).await;
}

#[tokio::test]
async fn test_encrypted_traffic_roundtrip() {
    let (client_conn, mut client_rx, server_conn, mut server_rx) = tcp_pair().await;
    let (mut client_channel, _, mut server_channel, _) =
        establish_session(&client_conn, &mut client_rx, &server_conn, &mut server_rx).await;

    // Client encrypts a payload and ships it inside an Encrypted message
    let inner = Message::Heartbeat(HeartbeatMessage {
        timestamp: 777,
        active_connections: 3,
        available_files: 9,
    });
    let secure = client_channel
        .encrypt(
            inner.message_type().as_byte(),
            &inner.encode_payload(),
        )
        .unwrap();
    client_conn.send(&Message::Encrypted(secure)).unwrap();

    match next_message(&mut server_rx).await {
        Message::Encrypted(secure) => {
            let plaintext = server_channel.decrypt(&secure).unwrap();
            let decoded = Message::decode(
                hypershare::network::protocol::MessageType::from_byte(secure.original_type)
                    .unwrap(),
                &plaintext,
            )
            .unwrap();
            assert_eq!(decoded, inner);
        }
        other => panic!("expected encrypted message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_replayed_wire_bytes_rejected() {
    let (client_conn, mut client_rx, server_conn, mut server_rx) = tcp_pair().await;
    let (mut client_channel, _, mut server_channel, _) =
        establish_session(&client_conn, &mut client_rx, &server_conn, &mut server_rx).await;

    let secure = client_channel.encrypt(0x03, b"sequence five").unwrap();

    // First delivery decrypts
    client_conn
        .send(&Message::Encrypted(secure.clone()))
        .unwrap();
    match next_message(&mut server_rx).await {
        Message::Encrypted(received) => {
            assert_eq!(server_channel.decrypt(&received).unwrap(), b"sequence five");
        }
        other => panic!("unexpected message: {:?}", other),
    }

    // Identical bytes replayed: rejected with an authentication error
    client_conn.send(&Message::Encrypted(secure)).unwrap();
    match next_message(&mut server_rx).await {
        Message::Encrypted(received) => {
            assert!(matches!(
                server_channel.decrypt(&received),
                Err(CryptoError::NonceReplayed(_))
            ));
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[tokio::test]
async fn test_key_rotation_over_tcp() {
    let (client_conn, mut client_rx, server_conn, mut server_rx) = tcp_pair().await;
    let (mut client_channel, mut client_hs, mut server_channel, mut server_hs) =
        establish_session(&client_conn, &mut client_rx, &server_conn, &mut server_rx).await;

    // Pre-rotation message under old keys
    let old = client_channel.encrypt(0x03, b"old keys").unwrap();

    let rotation = client_hs.initiate_rotation().unwrap();
    client_conn.send(&Message::KeyRotation(rotation)).unwrap();

    let (reply, new_server_keys) = match next_message(&mut server_rx).await {
        Message::KeyRotation(msg) => server_hs.handle_rotation(&msg).unwrap(),
        other => panic!("expected rotation, got {:?}", other),
    };
    server_conn.send(&Message::KeyRotation(reply)).unwrap();
    server_channel.rekey(new_server_keys);

    match next_message(&mut client_rx).await {
        Message::KeyRotation(reply) => {
            let new_client_keys = client_hs.complete_rotation(&reply).unwrap();
            client_channel.rekey(new_client_keys);
        }
        other => panic!("expected rotation reply, got {:?}", other),
    }

    // Forward secrecy: the old ciphertext no longer decrypts
    assert!(server_channel.decrypt(&old).is_err());

    // Fresh traffic flows under the rotated keys
    let secure = client_channel.encrypt(0x03, b"new keys").unwrap();
    client_conn.send(&Message::Encrypted(secure)).unwrap();
    match next_message(&mut server_rx).await {
        Message::Encrypted(received) => {
            assert_eq!(server_channel.decrypt(&received).unwrap(), b"new keys");
        }
        other => panic!("unexpected message: {:?}", other),
    }
}
