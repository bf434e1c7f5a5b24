//! Session key derivation.
//!
//! Both directions of a session derive their keys from the X25519 shared
//! secret with HKDF-HMAC-SHA256. Domain separation comes from two fixed
//! salts (`hypershare_encrypt`, `hypershare_mac`); the handshake context
//! binding both identity keys and both ephemeral keys is passed as the HKDF
//! `info` parameter, so keys are cryptographically bound to the exact pair
//! of peers and ephemerals that negotiated them.

use hkdf::Hkdf;
use sha2::Sha256;

/// Salt for the encryption key.
const ENCRYPT_SALT: &[u8] = b"hypershare_encrypt";
/// Salt for the MAC key.
const MAC_SALT: &[u8] = b"hypershare_mac";

/// Derive one 32-byte key from the shared secret.
fn derive_key(shared_secret: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Derive the per-session encryption key.
pub fn derive_encryption_key(shared_secret: &[u8], context: &[u8]) -> [u8; 32] {
    derive_key(shared_secret, ENCRYPT_SALT, context)
}

/// Derive the per-session MAC key.
pub fn derive_mac_key(shared_secret: &[u8], context: &[u8]) -> [u8; 32] {
    derive_key(shared_secret, MAC_SALT, context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let secret = [0x42u8; 32];
        let context = b"context bytes";

        assert_eq!(
            derive_encryption_key(&secret, context),
            derive_encryption_key(&secret, context)
        );
    }

    #[test]
    fn test_encryption_and_mac_keys_differ() {
        let secret = [0x42u8; 32];
        let context = b"context bytes";

        assert_ne!(
            derive_encryption_key(&secret, context),
            derive_mac_key(&secret, context)
        );
    }

    #[test]
    fn test_context_separates_keys() {
        let secret = [0x42u8; 32];

        assert_ne!(
            derive_encryption_key(&secret, b"session A"),
            derive_encryption_key(&secret, b"session B")
        );
    }

    #[test]
    fn test_secret_separates_keys() {
        let context = b"same context";

        assert_ne!(
            derive_encryption_key(&[1u8; 32], context),
            derive_encryption_key(&[2u8; 32], context)
        );
    }
}
