//! Long-lived node identity.
//!
//! Each node owns an Ed25519 signing keypair, generated on first run and
//! persisted as a 64-byte file (32 bytes public key followed by 32 bytes
//! secret key). On load the public key is rederived from the secret and
//! compared against the stored copy; a mismatch aborts the load.
//!
//! The secret half is zeroed from memory on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_SIZE: usize = 64;
/// Identity key file size: public key followed by secret key.
pub const IDENTITY_FILE_SIZE: usize = 64;

/// An Ed25519 identity key pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    /// 32-byte secret key (keep this secret!)
    secret_key: [u8; 32],
    /// 32-byte public key (share this freely)
    #[zeroize(skip)]
    pub public_key: [u8; 32],
}

// Custom Debug implementation to prevent accidental secret key exposure in logs
impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("secret_key", &"[REDACTED]")
            .field("public_key", &hex::encode(self.public_key))
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a fresh random identity using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_bytes);

        let signing_key = SigningKey::from_bytes(&secret_bytes);
        let keypair = Self {
            secret_key: signing_key.to_bytes(),
            public_key: signing_key.verifying_key().to_bytes(),
        };

        secret_bytes.zeroize();
        keypair
    }

    /// Restore an identity from existing secret key bytes.
    pub fn from_secret_bytes(secret_key: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret_key);
        Self {
            secret_key: signing_key.to_bytes(),
            public_key: signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign a message with the identity secret key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let signing_key = SigningKey::from_bytes(&self.secret_key);
        signing_key.sign(message).to_bytes()
    }

    /// Human-readable fingerprint: the first 8 bytes of the BLAKE3 hash of
    /// the public key, colon-separated hex pairs.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_key)
    }

    /// Persist the identity as `public_key ++ secret_key` with owner-only
    /// permissions.
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(path)?;
        file.write_all(&self.public_key)?;
        file.write_all(&self.secret_key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load an identity file, verifying that the stored public key matches
    /// the one derived from the secret key.
    pub fn load_from(path: &Path) -> Result<Self, CryptoError> {
        let mut file = fs::File::open(path)
            .map_err(|e| CryptoError::InvalidKey(format!("cannot open key file: {}", e)))?;

        let mut buf = [0u8; IDENTITY_FILE_SIZE];
        file.read_exact(&mut buf)
            .map_err(|_| CryptoError::InvalidKey("invalid key file format".to_string()))?;

        let mut stored_public = [0u8; 32];
        let mut secret = [0u8; 32];
        stored_public.copy_from_slice(&buf[..32]);
        secret.copy_from_slice(&buf[32..]);
        buf.zeroize();

        let keypair = Self::from_secret_bytes(&secret);
        secret.zeroize();

        if keypair.public_key != stored_public {
            return Err(CryptoError::InvalidKey(
                "key pair consistency check failed".to_string(),
            ));
        }

        Ok(keypair)
    }

    /// Load the identity from `path`, or generate and persist a new one if
    /// the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            return Self::load_from(path);
        }

        let keypair = Self::generate();
        keypair
            .save_to(path)
            .map_err(|e| CryptoError::InvalidKey(format!("cannot save key file: {}", e)))?;
        Ok(keypair)
    }
}

/// Verify an Ed25519 signature against a public key.
pub fn verify_signature(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<(), CryptoError> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| CryptoError::InvalidKey("malformed ed25519 public key".to_string()))?;
    let signature = Signature::from_bytes(signature);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Fingerprint of an arbitrary identity public key (see
/// [`IdentityKeyPair::fingerprint`]).
pub fn fingerprint_of(public_key: &[u8; 32]) -> String {
    let hash = blake3::hash(public_key);
    hash.as_bytes()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
