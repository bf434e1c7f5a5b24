//! Cryptographic core: identities, the authenticated handshake, session
//! keys, and the encrypted message wrapper.

pub mod derive;
pub mod handshake;
pub mod identity;
pub mod secure_message;
pub mod session;

pub use handshake::{Handshake, HandshakePhase};
pub use identity::IdentityKeyPair;
pub use secure_message::{NonceWindow, SecureChannel, SecureMessage};
pub use session::SessionKeys;

/// Errors from cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A key was missing, malformed, or inconsistent.
    InvalidKey(String),
    /// A signature did not verify.
    InvalidSignature,
    /// AEAD encryption failed.
    EncryptionFailed,
    /// AEAD decryption or authentication failed.
    DecryptionFailed,
    /// A nonce was replayed or outside the replay window.
    NonceReplayed(u64),
    /// Freshness check failed (nonce echo or timestamp skew).
    VerificationFailed(String),
    /// Operation called in the wrong handshake or rotation state.
    InvalidState(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidKey(e) => write!(f, "invalid key: {}", e),
            CryptoError::InvalidSignature => write!(f, "signature verification failed"),
            CryptoError::EncryptionFailed => write!(f, "encryption failed"),
            CryptoError::DecryptionFailed => write!(f, "decryption failed"),
            CryptoError::NonceReplayed(seq) => write!(f, "replayed sequence number {}", seq),
            CryptoError::VerificationFailed(e) => write!(f, "verification failed: {}", e),
            CryptoError::InvalidState(e) => write!(f, "invalid state: {}", e),
        }
    }
}

impl std::error::Error for CryptoError {}
