//! Encrypted message wrapper for authenticated sessions.
//!
//! After the handshake, payloads travel as ChaCha20-Poly1305 IETF
//! ciphertexts. The 12-byte nonce carries a monotonically increasing send
//! counter in its low 8 bytes (little-endian, upper 4 bytes zero). The
//! associated data binds the original message type, the sequence number, and
//! the literal protocol tag `HYPER`, so neither can be altered without
//! failing authentication.
//!
//! Replay protection: the receiver tracks the highest sequence seen plus a
//! sliding window of recent sequences. A sequence already observed, or one
//! below `highest - window`, is rejected before any decryption work.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::collections::BTreeSet;

use crate::network::wire::{WireError, WirePayload, WireReader, WireWriter};

use super::session::SessionKeys;
use super::CryptoError;

/// ChaCha20-Poly1305 nonce size.
pub const NONCE_SIZE: usize = 12;
/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;
/// Default anti-replay window.
pub const REPLAY_WINDOW: u64 = 1000;
/// Associated-data protocol tag.
const AAD_TAG: &[u8] = b"HYPER";

/// One AEAD-encrypted blob: nonce, ciphertext, tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl WirePayload for EncryptedPayload {
    fn encode(&self, w: &mut WireWriter) {
        w.put_bytes(&self.nonce);
        w.put_var_bytes(&self.ciphertext);
        w.put_bytes(&self.tag);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            nonce: r.get_array("nonce")?,
            ciphertext: r.get_var_bytes("ciphertext")?,
            tag: r.get_array("tag")?,
        })
    }
}

/// On-wire form of an encrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureMessage {
    /// Type code of the message inside the ciphertext.
    pub original_type: u8,
    pub sequence: u64,
    pub payload: EncryptedPayload,
}

impl WirePayload for SecureMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u8(self.original_type);
        w.put_u64(self.sequence);
        let blob = self.payload.to_bytes();
        w.put_var_bytes(&blob);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let original_type = r.get_u8("original_type")?;
        let sequence = r.get_u64("sequence")?;
        let blob = r.get_var_bytes("encrypted_payload")?;
        Ok(Self {
            original_type,
            sequence,
            payload: EncryptedPayload::from_bytes(&blob)?,
        })
    }
}

/// Associated data for a secure message.
fn make_aad(original_type: u8, sequence: u64) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(1 + 8 + AAD_TAG.len());
    w.put_u8(original_type);
    w.put_u64(sequence);
    w.put_bytes(AAD_TAG);
    w.into_bytes()
}

/// Encode a send counter into a nonce: low 8 bytes little-endian, upper 4
/// bytes zero.
fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Sliding anti-replay window over received sequence numbers.
#[derive(Debug)]
pub struct NonceWindow {
    highest_seen: u64,
    recent: BTreeSet<u64>,
    window_size: u64,
}

impl NonceWindow {
    pub fn new(window_size: u64) -> Self {
        Self {
            highest_seen: 0,
            recent: BTreeSet::new(),
            window_size,
        }
    }

    /// Whether a sequence would be accepted, without recording it.
    pub fn check(&self, sequence: u64) -> Result<(), CryptoError> {
        if self.recent.contains(&sequence) {
            return Err(CryptoError::NonceReplayed(sequence));
        }
        if sequence.saturating_add(self.window_size) < self.highest_seen {
            return Err(CryptoError::NonceReplayed(sequence));
        }
        Ok(())
    }

    /// Record an accepted sequence and prune entries that fell out of the
    /// window.
    pub fn record(&mut self, sequence: u64) {
        self.recent.insert(sequence);
        self.highest_seen = self.highest_seen.max(sequence);

        let cutoff = self.highest_seen.saturating_sub(self.window_size);
        // BTreeSet iterates in order, so stop at the first kept entry.
        let stale: Vec<u64> = self
            .recent
            .iter()
            .take_while(|&&s| s < cutoff)
            .copied()
            .collect();
        for s in stale {
            self.recent.remove(&s);
        }
    }

    pub fn reset(&mut self) {
        self.highest_seen = 0;
        self.recent.clear();
    }
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW)
    }
}

/// An established encrypted session with one peer: session keys, outgoing
/// counter, and the incoming replay window.
pub struct SecureChannel {
    keys: SessionKeys,
    send_counter: u64,
    replay: NonceWindow,
}

impl SecureChannel {
    pub fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            // Start from 1 so a zero sequence is never valid on the wire.
            send_counter: 1,
            replay: NonceWindow::default(),
        }
    }

    /// Encrypt a plaintext payload for sending.
    pub fn encrypt(
        &mut self,
        original_type: u8,
        plaintext: &[u8],
    ) -> Result<SecureMessage, CryptoError> {
        let sequence = self.send_counter;
        let nonce_bytes = counter_nonce(sequence);
        let aad = make_aad(original_type, sequence);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys.encryption_key));
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        // AEAD output is ciphertext followed by the 16-byte tag.
        let split = sealed.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&sealed[split..]);

        self.send_counter += 1;
        self.keys.record_bytes(plaintext.len() as u64);

        Ok(SecureMessage {
            original_type,
            sequence,
            payload: EncryptedPayload {
                nonce: nonce_bytes,
                ciphertext: sealed[..split].to_vec(),
                tag,
            },
        })
    }

    /// Verify and decrypt a received message. Replayed sequences are
    /// rejected before any decryption work; the sequence is only recorded
    /// after the ciphertext authenticates.
    pub fn decrypt(&mut self, message: &SecureMessage) -> Result<Vec<u8>, CryptoError> {
        self.replay.check(message.sequence)?;

        let aad = make_aad(message.original_type, message.sequence);
        let mut sealed =
            Vec::with_capacity(message.payload.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&message.payload.ciphertext);
        sealed.extend_from_slice(&message.payload.tag);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys.encryption_key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&message.payload.nonce),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        self.replay.record(message.sequence);
        self.keys.record_bytes(plaintext.len() as u64);
        Ok(plaintext)
    }

    /// Install rotated keys. The outgoing counter and the replay window
    /// restart; the old keys are zeroized when dropped here.
    pub fn rekey(&mut self, new_keys: SessionKeys) {
        self.keys = new_keys;
        self.send_counter = 1;
        self.replay.reset();
    }

    pub fn should_rotate(&self) -> bool {
        self.keys.should_rotate()
    }

    pub fn past_hard_limit(&self) -> bool {
        self.keys.past_hard_limit()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.keys.bytes_transferred()
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("send_counter", &self.send_counter)
            .field("bytes_transferred", &self.keys.bytes_transferred())
            .finish()
    }
}
