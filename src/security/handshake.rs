//! Authenticated key-exchange handshake.
//!
//! Mutually authenticated X25519 ECDH, signed with long-lived Ed25519
//! identities, producing forward-secret session keys per connection.
//!
//! The initiator signs its handshake under the context string
//! `HANDSHAKE_INITIATE`. The responder signs its ack under
//! `HANDSHAKE_RESPOND` with the full channel binding appended: the
//! `HYPERSHARE_HANDSHAKE_V1` context containing both identity keys and both
//! ephemeral keys, which prevents identity or ephemeral substitution. The
//! initiator checks the nonce echo for freshness, verifies the ack under the
//! same binding, and derives keys. Every failure is terminal: the phase
//! machine enters `Failed` and the connection must be closed.
//!
//! Key rotation reuses the same construction: a signed, nonced, timestamped
//! `KeyRotation` message carries a fresh ephemeral; the responder answers
//! with its own, and both sides rederive under a rekey context bound to the
//! rotation id.

use rand::RngCore;
use x25519_dalek::{PublicKey, ReusableSecret};

use crate::network::wire::{WireError, WirePayload, WireReader, WireWriter};

use super::derive::{derive_encryption_key, derive_mac_key};
use super::identity::{verify_signature, IdentityKeyPair, SIGNATURE_SIZE};
use super::session::{rotation_timestamp_fresh, SessionKeys};
use super::CryptoError;

/// Signature context for the initiator's handshake message.
const CONTEXT_INITIATE: &str = "HANDSHAKE_INITIATE";
/// Signature context for the responder's ack.
const CONTEXT_RESPOND: &str = "HANDSHAKE_RESPOND";
/// Signature context for key rotation messages.
const CONTEXT_ROTATION: &str = "KEY_ROTATION";
/// Channel binding label for session key derivation.
const HANDSHAKE_CONTEXT_LABEL: &str = "HYPERSHARE_HANDSHAKE_V1";
/// Channel binding label for key rotation rederivation.
const REKEY_CONTEXT_LABEL: &str = "HYPERSHARE_REKEY_V1";

/// Handshake phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Initiate,
    Respond,
    Complete,
    Failed,
}

/// Client-to-server secure handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureHandshakeMessage {
    pub peer_id: u32,
    pub listen_port: u16,
    pub peer_name: String,
    pub capabilities: u32,
    pub identity_public_key: [u8; 32],
    pub ephemeral_public_key: [u8; 32],
    pub nonce: u64,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl SecureHandshakeMessage {
    /// The serialized-without-signature form covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u32(self.peer_id);
        w.put_u16(self.listen_port);
        w.put_string(&self.peer_name);
        w.put_u32(self.capabilities);
        w.put_bytes(&self.identity_public_key);
        w.put_bytes(&self.ephemeral_public_key);
        w.put_u64(self.nonce);
        w.into_bytes()
    }
}

impl WirePayload for SecureHandshakeMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.peer_id);
        w.put_u16(self.listen_port);
        w.put_string(&self.peer_name);
        w.put_u32(self.capabilities);
        w.put_bytes(&self.identity_public_key);
        w.put_bytes(&self.ephemeral_public_key);
        w.put_u64(self.nonce);
        w.put_bytes(&self.signature);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            peer_id: r.get_u32("peer_id")?,
            listen_port: r.get_u16("listen_port")?,
            peer_name: r.get_string("peer_name")?,
            capabilities: r.get_u32("capabilities")?,
            identity_public_key: r.get_array("identity_public_key")?,
            ephemeral_public_key: r.get_array("ephemeral_public_key")?,
            nonce: r.get_u64("nonce")?,
            signature: r.get_array("signature")?,
        })
    }
}

/// Server-to-client handshake acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureHandshakeAckMessage {
    pub peer_id: u32,
    pub identity_public_key: [u8; 32],
    pub ephemeral_public_key: [u8; 32],
    pub nonce: u64,
    /// Echo of the initiator's nonce, proving freshness.
    pub response_nonce: u64,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl SecureHandshakeAckMessage {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u32(self.peer_id);
        w.put_bytes(&self.identity_public_key);
        w.put_bytes(&self.ephemeral_public_key);
        w.put_u64(self.nonce);
        w.put_u64(self.response_nonce);
        w.into_bytes()
    }
}

impl WirePayload for SecureHandshakeAckMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.peer_id);
        w.put_bytes(&self.identity_public_key);
        w.put_bytes(&self.ephemeral_public_key);
        w.put_u64(self.nonce);
        w.put_u64(self.response_nonce);
        w.put_bytes(&self.signature);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            peer_id: r.get_u32("peer_id")?,
            identity_public_key: r.get_array("identity_public_key")?,
            ephemeral_public_key: r.get_array("ephemeral_public_key")?,
            nonce: r.get_u64("nonce")?,
            response_nonce: r.get_u64("response_nonce")?,
            signature: r.get_array("signature")?,
        })
    }
}

/// Key rotation message (either direction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRotationMessage {
    pub rotation_id: u64,
    pub new_ephemeral_public_key: [u8; 32],
    pub nonce: u64,
    /// Seconds since the epoch; rejected beyond ±5 minutes of skew.
    pub timestamp: u64,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl KeyRotationMessage {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.rotation_id);
        w.put_bytes(&self.new_ephemeral_public_key);
        w.put_u64(self.nonce);
        w.put_u64(self.timestamp);
        w.into_bytes()
    }
}

impl WirePayload for KeyRotationMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.rotation_id);
        w.put_bytes(&self.new_ephemeral_public_key);
        w.put_u64(self.nonce);
        w.put_u64(self.timestamp);
        w.put_bytes(&self.signature);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            rotation_id: r.get_u64("rotation_id")?,
            new_ephemeral_public_key: r.get_array("new_ephemeral_public_key")?,
            nonce: r.get_u64("nonce")?,
            timestamp: r.get_u64("timestamp")?,
            signature: r.get_array("signature")?,
        })
    }
}

/// Prefix the context string to the data being signed.
fn signature_data(context: &str, body: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(4 + context.len() + body.len());
    w.put_string(context);
    w.put_bytes(body);
    w.into_bytes()
}

/// Channel binding context: both identity keys and both ephemeral keys in
/// initiator/responder order. Both sides build the identical byte string.
fn handshake_context(
    initiator_identity: &[u8; 32],
    responder_identity: &[u8; 32],
    initiator_ephemeral: &[u8; 32],
    responder_ephemeral: &[u8; 32],
) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_string(HANDSHAKE_CONTEXT_LABEL);
    w.put_bytes(initiator_identity);
    w.put_bytes(responder_identity);
    w.put_bytes(initiator_ephemeral);
    w.put_bytes(responder_ephemeral);
    w.into_bytes()
}

/// Rekey context, bound to the rotation id and the fresh ephemerals.
fn rekey_context(
    rotation_id: u64,
    initiator_identity: &[u8; 32],
    responder_identity: &[u8; 32],
    initiator_ephemeral: &[u8; 32],
    responder_ephemeral: &[u8; 32],
) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_string(REKEY_CONTEXT_LABEL);
    w.put_u64(rotation_id);
    w.put_bytes(initiator_identity);
    w.put_bytes(responder_identity);
    w.put_bytes(initiator_ephemeral);
    w.put_bytes(responder_ephemeral);
    w.into_bytes()
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// One handshake instance. Owns the ephemeral secret for its lifetime; the
/// secret is dropped (and zeroed) on reset or completion of rotation.
pub struct Handshake {
    identity: IdentityKeyPair,
    phase: HandshakePhase,
    our_ephemeral: Option<ReusableSecret>,
    peer_identity: Option<[u8; 32]>,
    peer_ephemeral: Option<[u8; 32]>,
    our_nonce: u64,
    peer_nonce: u64,
    pending_ephemeral: Option<ReusableSecret>,
    pending_rotation_id: u64,
}

impl Handshake {
    pub fn new(identity: IdentityKeyPair) -> Self {
        Self {
            identity,
            phase: HandshakePhase::Initiate,
            our_ephemeral: None,
            peer_identity: None,
            peer_ephemeral: None,
            our_nonce: 0,
            peer_nonce: 0,
            pending_ephemeral: None,
            pending_rotation_id: 0,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Identity public key of the authenticated peer, once known.
    pub fn peer_identity(&self) -> Option<[u8; 32]> {
        self.peer_identity
    }

    /// Return to the `Initiate` phase, discarding all ephemeral material.
    pub fn reset(&mut self) {
        self.phase = HandshakePhase::Initiate;
        self.our_ephemeral = None;
        self.peer_identity = None;
        self.peer_ephemeral = None;
        self.our_nonce = 0;
        self.peer_nonce = 0;
        self.pending_ephemeral = None;
        self.pending_rotation_id = 0;
    }

    fn our_ephemeral_public(&self) -> Result<[u8; 32], CryptoError> {
        let secret = self
            .our_ephemeral
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidState("no ephemeral key".to_string()))?;
        Ok(PublicKey::from(secret).to_bytes())
    }

    /// Client side: build the signed handshake message. Calling this twice
    /// without a reset is an error.
    pub fn initiate(
        &mut self,
        peer_id: u32,
        listen_port: u16,
        peer_name: &str,
        capabilities: u32,
    ) -> Result<SecureHandshakeMessage, CryptoError> {
        if self.phase != HandshakePhase::Initiate {
            return Err(CryptoError::InvalidState(
                "handshake already in progress".to_string(),
            ));
        }

        let ephemeral = ReusableSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        self.our_ephemeral = Some(ephemeral);
        self.our_nonce = rand::rngs::OsRng.next_u64();

        let mut message = SecureHandshakeMessage {
            peer_id,
            listen_port,
            peer_name: peer_name.to_string(),
            capabilities,
            identity_public_key: self.identity.public_key,
            ephemeral_public_key: ephemeral_public,
            nonce: self.our_nonce,
            signature: [0u8; SIGNATURE_SIZE],
        };

        let data = signature_data(CONTEXT_INITIATE, &message.signing_bytes());
        message.signature = self.identity.sign(&data);

        self.phase = HandshakePhase::Respond;
        Ok(message)
    }

    /// Server side: verify an incoming handshake and build the signed ack.
    pub fn respond(
        &mut self,
        incoming: &SecureHandshakeMessage,
        our_peer_id: u32,
    ) -> Result<SecureHandshakeAckMessage, CryptoError> {
        if let Err(e) = Self::verify_handshake_signature(incoming) {
            self.phase = HandshakePhase::Failed;
            return Err(e);
        }

        self.peer_identity = Some(incoming.identity_public_key);
        self.peer_ephemeral = Some(incoming.ephemeral_public_key);
        self.peer_nonce = incoming.nonce;

        let ephemeral = ReusableSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        self.our_ephemeral = Some(ephemeral);
        self.our_nonce = rand::rngs::OsRng.next_u64();

        let mut ack = SecureHandshakeAckMessage {
            peer_id: our_peer_id,
            identity_public_key: self.identity.public_key,
            ephemeral_public_key: ephemeral_public,
            nonce: self.our_nonce,
            response_nonce: self.peer_nonce,
            signature: [0u8; SIGNATURE_SIZE],
        };

        let context = handshake_context(
            &incoming.identity_public_key,
            &self.identity.public_key,
            &incoming.ephemeral_public_key,
            &ephemeral_public,
        );
        let mut data = signature_data(CONTEXT_RESPOND, &ack.signing_bytes());
        data.extend_from_slice(&context);
        ack.signature = self.identity.sign(&data);

        self.phase = HandshakePhase::Complete;
        Ok(ack)
    }

    /// Client side: check the nonce echo, verify the ack under the channel
    /// binding, and derive session keys.
    pub fn complete(
        &mut self,
        ack: &SecureHandshakeAckMessage,
    ) -> Result<SessionKeys, CryptoError> {
        if self.phase != HandshakePhase::Respond {
            return Err(CryptoError::InvalidState("not in respond phase".to_string()));
        }

        if ack.response_nonce != self.our_nonce {
            self.phase = HandshakePhase::Failed;
            return Err(CryptoError::VerificationFailed("nonce mismatch".to_string()));
        }

        let our_ephemeral_public = self.our_ephemeral_public()?;
        let context = handshake_context(
            &self.identity.public_key,
            &ack.identity_public_key,
            &our_ephemeral_public,
            &ack.ephemeral_public_key,
        );
        let mut data = signature_data(CONTEXT_RESPOND, &ack.signing_bytes());
        data.extend_from_slice(&context);

        if verify_signature(&ack.identity_public_key, &data, &ack.signature).is_err() {
            self.phase = HandshakePhase::Failed;
            return Err(CryptoError::InvalidSignature);
        }

        self.peer_identity = Some(ack.identity_public_key);
        self.peer_ephemeral = Some(ack.ephemeral_public_key);
        self.peer_nonce = ack.nonce;

        let keys = self.derive_keys(&context)?;
        self.phase = HandshakePhase::Complete;
        Ok(keys)
    }

    /// Server side: derive the same session keys after a successful
    /// [`respond`](Self::respond).
    pub fn server_session_keys(&self) -> Result<SessionKeys, CryptoError> {
        if self.phase != HandshakePhase::Complete {
            return Err(CryptoError::InvalidState(
                "handshake not complete".to_string(),
            ));
        }

        let peer_identity = self
            .peer_identity
            .ok_or_else(|| CryptoError::InvalidState("peer identity unknown".to_string()))?;
        let peer_ephemeral = self
            .peer_ephemeral
            .ok_or_else(|| CryptoError::InvalidState("peer ephemeral unknown".to_string()))?;
        let our_ephemeral_public = self.our_ephemeral_public()?;

        let context = handshake_context(
            &peer_identity,
            &self.identity.public_key,
            &peer_ephemeral,
            &our_ephemeral_public,
        );
        self.derive_keys(&context)
    }

    fn derive_keys(&self, context: &[u8]) -> Result<SessionKeys, CryptoError> {
        let secret = self
            .our_ephemeral
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidState("no ephemeral key".to_string()))?;
        let peer_ephemeral = self
            .peer_ephemeral
            .ok_or_else(|| CryptoError::InvalidState("peer ephemeral unknown".to_string()))?;

        // SharedSecret zeroizes itself when dropped at the end of this scope.
        let shared = secret.diffie_hellman(&PublicKey::from(peer_ephemeral));
        let encryption_key = derive_encryption_key(shared.as_bytes(), context);
        let mac_key = derive_mac_key(shared.as_bytes(), context);
        Ok(SessionKeys::new(encryption_key, mac_key))
    }

    /// Verify an initiator's handshake signature against the identity key it
    /// carries.
    pub fn verify_handshake_signature(message: &SecureHandshakeMessage) -> Result<(), CryptoError> {
        let data = signature_data(CONTEXT_INITIATE, &message.signing_bytes());
        verify_signature(&message.identity_public_key, &data, &message.signature)
    }

    /// Whether a rotation we initiated is awaiting the peer's reply.
    pub fn rotation_pending(&self) -> bool {
        self.pending_ephemeral.is_some()
    }

    /// Rotation id of our in-flight rotation, if any.
    pub fn pending_rotation_id(&self) -> Option<u64> {
        self.pending_ephemeral
            .as_ref()
            .map(|_| self.pending_rotation_id)
    }

    /// Abandon an in-flight rotation (used to break a simultaneous-
    /// initiation tie). The pending ephemeral is dropped and zeroed.
    pub fn abandon_rotation(&mut self) {
        self.pending_ephemeral = None;
        self.pending_rotation_id = 0;
    }

    /// Begin a key rotation: generate a fresh ephemeral and the signed
    /// rotation message. The current keys stay in effect until the peer's
    /// reply arrives.
    pub fn initiate_rotation(&mut self) -> Result<KeyRotationMessage, CryptoError> {
        if self.phase != HandshakePhase::Complete {
            return Err(CryptoError::InvalidState(
                "cannot rotate before handshake completes".to_string(),
            ));
        }

        let ephemeral = ReusableSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        self.pending_ephemeral = Some(ephemeral);
        self.pending_rotation_id = rand::rngs::OsRng.next_u64();

        let mut message = KeyRotationMessage {
            rotation_id: self.pending_rotation_id,
            new_ephemeral_public_key: ephemeral_public,
            nonce: rand::rngs::OsRng.next_u64(),
            timestamp: now_unix_secs(),
            signature: [0u8; SIGNATURE_SIZE],
        };
        let data = signature_data(CONTEXT_ROTATION, &message.signing_bytes());
        message.signature = self.identity.sign(&data);
        Ok(message)
    }

    /// Responder side of a rotation: verify the incoming message, generate a
    /// fresh ephemeral, and derive the new keys. Returns the signed reply and
    /// the new keys; the caller installs the keys after sending the reply.
    pub fn handle_rotation(
        &mut self,
        message: &KeyRotationMessage,
    ) -> Result<(KeyRotationMessage, SessionKeys), CryptoError> {
        let peer_identity = self.verify_rotation_message(message)?;

        let ephemeral = ReusableSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();

        let context = rekey_context(
            message.rotation_id,
            &peer_identity,
            &self.identity.public_key,
            &message.new_ephemeral_public_key,
            &ephemeral_public,
        );
        let shared = ephemeral.diffie_hellman(&PublicKey::from(message.new_ephemeral_public_key));
        let keys = SessionKeys::new(
            derive_encryption_key(shared.as_bytes(), &context),
            derive_mac_key(shared.as_bytes(), &context),
        );

        let mut reply = KeyRotationMessage {
            rotation_id: message.rotation_id,
            new_ephemeral_public_key: ephemeral_public,
            nonce: rand::rngs::OsRng.next_u64(),
            timestamp: now_unix_secs(),
            signature: [0u8; SIGNATURE_SIZE],
        };
        let data = signature_data(CONTEXT_ROTATION, &reply.signing_bytes());
        reply.signature = self.identity.sign(&data);

        // The previous ephemeral has no further use once rekeyed.
        self.our_ephemeral = Some(ephemeral);
        self.peer_ephemeral = Some(message.new_ephemeral_public_key);

        Ok((reply, keys))
    }

    /// Initiator side: verify the peer's rotation reply and derive the new
    /// keys. The old keys must be zeroized by the caller once installed.
    pub fn complete_rotation(
        &mut self,
        reply: &KeyRotationMessage,
    ) -> Result<SessionKeys, CryptoError> {
        self.verify_rotation_message(reply)?;

        if reply.rotation_id != self.pending_rotation_id {
            return Err(CryptoError::VerificationFailed(
                "rotation id mismatch".to_string(),
            ));
        }
        let pending = self
            .pending_ephemeral
            .take()
            .ok_or_else(|| CryptoError::InvalidState("no rotation in progress".to_string()))?;
        let peer_identity = self
            .peer_identity
            .ok_or_else(|| CryptoError::InvalidState("peer identity unknown".to_string()))?;

        let our_new_public = PublicKey::from(&pending).to_bytes();
        let context = rekey_context(
            reply.rotation_id,
            &self.identity.public_key,
            &peer_identity,
            &our_new_public,
            &reply.new_ephemeral_public_key,
        );
        let shared = pending.diffie_hellman(&PublicKey::from(reply.new_ephemeral_public_key));
        let keys = SessionKeys::new(
            derive_encryption_key(shared.as_bytes(), &context),
            derive_mac_key(shared.as_bytes(), &context),
        );

        self.our_ephemeral = Some(pending);
        self.peer_ephemeral = Some(reply.new_ephemeral_public_key);
        self.pending_rotation_id = 0;

        Ok(keys)
    }

    fn verify_rotation_message(
        &self,
        message: &KeyRotationMessage,
    ) -> Result<[u8; 32], CryptoError> {
        if self.phase != HandshakePhase::Complete {
            return Err(CryptoError::InvalidState(
                "cannot rotate before handshake completes".to_string(),
            ));
        }
        let peer_identity = self
            .peer_identity
            .ok_or_else(|| CryptoError::InvalidState("peer identity unknown".to_string()))?;

        if !rotation_timestamp_fresh(message.timestamp) {
            return Err(CryptoError::VerificationFailed(
                "rotation timestamp outside allowed skew".to_string(),
            ));
        }

        let data = signature_data(CONTEXT_ROTATION, &message.signing_bytes());
        verify_signature(&peer_identity, &data, &message.signature)?;
        Ok(peer_identity)
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("phase", &self.phase)
            .field(
                "peer_identity",
                &self.peer_identity.map(hex::encode),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Handshake, Handshake) {
        (
            Handshake::new(IdentityKeyPair::generate()),
            Handshake::new(IdentityKeyPair::generate()),
        )
    }

    fn run_handshake(client: &mut Handshake, server: &mut Handshake) -> (SessionKeys, SessionKeys) {
        let msg = client.initiate(1001, 8080, "client", 0x01).unwrap();
        let ack = server.respond(&msg, 1002).unwrap();
        let client_keys = client.complete(&ack).unwrap();
        let server_keys = server.server_session_keys().unwrap();
        (client_keys, server_keys)
    }

    #[test]
    fn test_basic_handshake_flow() {
        let (mut client, mut server) = pair();

        let msg = client.initiate(1001, 8080, "client", 0x01).unwrap();
        assert_eq!(client.phase(), HandshakePhase::Respond);

        let ack = server.respond(&msg, 1002).unwrap();
        assert_eq!(server.phase(), HandshakePhase::Complete);
        assert_eq!(ack.response_nonce, msg.nonce);

        let client_keys = client.complete(&ack).unwrap();
        assert_eq!(client.phase(), HandshakePhase::Complete);

        let server_keys = server.server_session_keys().unwrap();

        // Both sides derive identical keys from the symmetric context
        assert_eq!(client_keys.encryption_key, server_keys.encryption_key);
        assert_eq!(client_keys.mac_key, server_keys.mac_key);
        assert_ne!(client_keys.encryption_key, client_keys.mac_key);
    }

    #[test]
    fn test_initiate_twice_fails() {
        let (mut client, _) = pair();
        client.initiate(1, 8080, "c", 0).unwrap();

        let err = client.initiate(1, 8080, "c", 0).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidState(_)));
    }

    #[test]
    fn test_reset_allows_new_handshake() {
        let (mut client, _) = pair();
        client.initiate(1, 8080, "c", 0).unwrap();
        client.reset();
        assert_eq!(client.phase(), HandshakePhase::Initiate);
        assert!(client.initiate(1, 8080, "c", 0).is_ok());
    }

    #[test]
    fn test_tampered_handshake_rejected() {
        let (mut client, mut server) = pair();
        let mut msg = client.initiate(1001, 8080, "client", 0).unwrap();
        msg.peer_name = "mallory".to_string();

        let err = server.respond(&msg, 1002).unwrap_err();
        assert_eq!(err, CryptoError::InvalidSignature);
        assert_eq!(server.phase(), HandshakePhase::Failed);
    }

    #[test]
    fn test_substituted_ephemeral_rejected() {
        let (mut client, mut server) = pair();
        let mut msg = client.initiate(1001, 8080, "client", 0).unwrap();
        msg.ephemeral_public_key = [0x77u8; 32];

        assert!(server.respond(&msg, 1002).is_err());
    }

    #[test]
    fn test_nonce_mismatch_rejected() {
        let (mut client, mut server) = pair();
        let msg = client.initiate(1001, 8080, "client", 0).unwrap();
        let mut ack = server.respond(&msg, 1002).unwrap();
        ack.response_nonce = ack.response_nonce.wrapping_add(1);

        let err = client.complete(&ack).unwrap_err();
        assert!(matches!(err, CryptoError::VerificationFailed(_)));
        assert_eq!(client.phase(), HandshakePhase::Failed);
    }

    #[test]
    fn test_tampered_ack_rejected() {
        let (mut client, mut server) = pair();
        let msg = client.initiate(1001, 8080, "client", 0).unwrap();
        let mut ack = server.respond(&msg, 1002).unwrap();
        ack.ephemeral_public_key = [0x55u8; 32];

        let err = client.complete(&ack).unwrap_err();
        assert_eq!(err, CryptoError::InvalidSignature);
        assert_eq!(client.phase(), HandshakePhase::Failed);
    }

    #[test]
    fn test_complete_without_initiate_fails() {
        let (mut client, mut server) = pair();
        let msg = Handshake::new(IdentityKeyPair::generate())
            .initiate(1, 1, "x", 0)
            .unwrap();
        let ack = server.respond(&msg, 2).unwrap();

        let err = client.complete(&ack).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidState(_)));
    }

    #[test]
    fn test_handshake_message_roundtrip() {
        let (mut client, _) = pair();
        let msg = client.initiate(1001, 8080, "client node", 0xFF).unwrap();

        let bytes = msg.to_bytes();
        let decoded = SecureHandshakeMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ack_message_roundtrip() {
        let (mut client, mut server) = pair();
        let msg = client.initiate(1001, 8080, "client", 0).unwrap();
        let ack = server.respond(&msg, 1002).unwrap();

        let decoded = SecureHandshakeAckMessage::from_bytes(&ack.to_bytes()).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn test_key_rotation_derives_fresh_keys() {
        let (mut client, mut server) = pair();
        let (old_client_keys, old_server_keys) = run_handshake(&mut client, &mut server);

        let rotation = client.initiate_rotation().unwrap();
        let (reply, new_server_keys) = server.handle_rotation(&rotation).unwrap();
        let new_client_keys = client.complete_rotation(&reply).unwrap();

        assert_eq!(new_client_keys.encryption_key, new_server_keys.encryption_key);
        assert_eq!(new_client_keys.mac_key, new_server_keys.mac_key);

        // Forward secrecy: new keys are unrelated to old keys
        assert_ne!(new_client_keys.encryption_key, old_client_keys.encryption_key);
        assert_ne!(new_server_keys.encryption_key, old_server_keys.encryption_key);
    }

    #[test]
    fn test_rotation_message_roundtrip() {
        let (mut client, mut server) = pair();
        run_handshake(&mut client, &mut server);

        let rotation = client.initiate_rotation().unwrap();
        let decoded = KeyRotationMessage::from_bytes(&rotation.to_bytes()).unwrap();
        assert_eq!(decoded, rotation);
    }

    #[test]
    fn test_stale_rotation_rejected() {
        let (mut client, mut server) = pair();
        run_handshake(&mut client, &mut server);

        let mut rotation = client.initiate_rotation().unwrap();
        rotation.timestamp -= 6 * 60; // six minutes in the past

        let err = server.handle_rotation(&rotation).unwrap_err();
        assert!(matches!(err, CryptoError::VerificationFailed(_)));
    }

    #[test]
    fn test_rotation_before_handshake_fails() {
        let (mut client, _) = pair();
        assert!(matches!(
            client.initiate_rotation().unwrap_err(),
            CryptoError::InvalidState(_)
        ));
    }

    #[test]
    fn test_rotation_reply_id_mismatch_rejected() {
        let (mut client, mut server) = pair();
        run_handshake(&mut client, &mut server);

        let rotation = client.initiate_rotation().unwrap();
        let (reply, _keys) = server.handle_rotation(&rotation).unwrap();

        // Forge a reply with a different rotation id, re-signed by the peer
        let mut forged = reply.clone();
        forged.rotation_id = forged.rotation_id.wrapping_add(1);
        // Signature no longer matches the body either way
        assert!(client.complete_rotation(&forged).is_err());
    }
}
