//! # Key Derivation Functions
//!
//! HKDF-SHA256 for everything derived from high-entropy secrets, Argon2id
//! for everything derived from a password.
//!
//! ## Key Derivation Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    KEY DERIVATION HIERARCHY                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  password ──► Argon2id(salt, m, t, p) ──► stretched (32 bytes)         │
//! │                                               │                         │
//! │                   ┌───────────────────────────┴──────────┐             │
//! │                   ▼                                      ▼             │
//! │     HKDF("umbra-e2ee-master-key-v1")    HKDF("umbra-e2ee-password-     │
//! │       → MasterKey (first setup only)          wrap-v1") → wrap key     │
//! │                   │                                                     │
//! │                   ▼                                                     │
//! │     HKDF("umbra-e2ee-storage-v1") → sealed record key                  │
//! │                                                                         │
//! │  recovery code ──► BIP39 seed ──► HKDF("umbra-e2ee-recovery-code-v1")  │
//! │                                      → recovery wrap key               │
//! │                                                                         │
//! │  X3DH / ratchet secrets ──► HKDF (see session::x3dh, session::ratchet) │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Aspect | Choice |
//! |--------|--------|
//! | KDF | HKDF-SHA256 |
//! | Password KDF | Argon2id v1.3 |
//! | Key separation | distinct `info` strings per purpose |
//! | Versioning | "-v1" suffix on every domain string |

use argon2::{Algorithm, Argon2, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::KdfParams;
use crate::crypto::encryption::EncryptionKey;
use crate::error::{Error, Result};

/// Domain separation strings for HKDF and signatures
pub mod domain {
    /// X3DH master secret → root key ‖ chain key
    pub const X3DH: &[u8] = b"umbra-e2ee-x3dh-v1";

    /// Root key ratchet step
    pub const ROOT_RATCHET: &[u8] = b"umbra-e2ee-root-ratchet-v1";

    /// Chain key step → next chain key ‖ message key ‖ nonce
    pub const CHAIN_RATCHET: &[u8] = b"umbra-e2ee-chain-ratchet-v1";

    /// Signed prekey signature prefix
    pub const SIGNED_PREKEY: &[u8] = b"umbra-e2ee-spk-v1";

    /// Stretched password → MasterKey
    pub const MASTER_KEY: &[u8] = b"umbra-e2ee-master-key-v1";

    /// Stretched password → MasterKey wrapping key
    pub const PASSWORD_WRAP: &[u8] = b"umbra-e2ee-password-wrap-v1";

    /// Recovery code seed → MasterKey wrapping key
    pub const RECOVERY_CODE: &[u8] = b"umbra-e2ee-recovery-code-v1";

    /// MasterKey → sealed store record key
    pub const STORAGE: &[u8] = b"umbra-e2ee-storage-v1";
}

/// Size of the Argon2 salt
pub const SALT_SIZE: usize = 16;

/// HKDF-SHA256 extract-and-expand into a fresh buffer of `length` bytes
pub fn hkdf(secret: &[u8], salt: Option<&[u8]>, info: &[u8], length: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(vec![0u8; length]);
    hkdf_into(secret, salt, info, &mut out)?;
    Ok(out)
}

/// HKDF-SHA256 extract-and-expand into `out`
pub fn hkdf_into(secret: &[u8], salt: Option<&[u8]>, info: &[u8], out: &mut [u8]) -> Result<()> {
    let len = out.len();
    Hkdf::<Sha256>::new(salt, secret)
        .expand(info, out)
        .map_err(|_| Error::KeyDerivationFailed(format!("HKDF output of {} bytes", len)))
}

/// Root secret protecting all device private keys at rest
///
/// Never persisted in raw form; only held in memory while unlocked.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("master key must be 32 bytes".into()))?;
        Ok(Self(raw))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Key used to seal store records
    pub fn storage_key(&self) -> Result<EncryptionKey> {
        let mut key = [0u8; 32];
        hkdf_into(&self.0, None, domain::STORAGE, &mut key)?;
        let out = EncryptionKey::from_bytes(key);
        key.zeroize();
        Ok(out)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        // No early exit on the first differing byte
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
    }
}

impl Eq for MasterKey {}

/// Generate a random Argon2 salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    use rand::RngCore;
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Argon2id over the password
///
/// CPU and memory bound by design; call from a blocking worker.
pub fn stretch_password(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);
    let mut out = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(password, salt, &mut *out)
        .map_err(|e| Error::KeyDerivationFailed(format!("argon2: {}", e)))?;
    Ok(out)
}

/// Derive the MasterKey from a password
pub fn derive_master_key(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<MasterKey> {
    let stretched = stretch_password(password, salt, params)?;
    master_key_from_stretched(&stretched)
}

pub(crate) fn master_key_from_stretched(stretched: &[u8; 32]) -> Result<MasterKey> {
    let mut key = [0u8; 32];
    hkdf_into(stretched, None, domain::MASTER_KEY, &mut key)?;
    Ok(MasterKey::from_bytes(key))
}

/// Key that wraps the MasterKey under a stretched password
pub(crate) fn password_wrap_key(stretched: &[u8; 32]) -> Result<EncryptionKey> {
    let mut key = [0u8; 32];
    hkdf_into(stretched, None, domain::PASSWORD_WRAP, &mut key)?;
    let out = EncryptionKey::from_bytes(key);
    key.zeroize();
    Ok(out)
}

/// Key that wraps the MasterKey under a recovery code seed
pub(crate) fn recovery_wrap_key(seed: &[u8]) -> Result<EncryptionKey> {
    let mut key = [0u8; 32];
    hkdf_into(seed, None, domain::RECOVERY_CODE, &mut key)?;
    let out = EncryptionKey::from_bytes(key);
    key.zeroize();
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_deterministic_and_separated() {
        let a = hkdf(b"secret", Some(b"salt"), b"info-a", 32).unwrap();
        let b = hkdf(b"secret", Some(b"salt"), b"info-a", 32).unwrap();
        let c = hkdf(b"secret", Some(b"salt"), b"info-b", 32).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_eq!(hkdf(b"secret", None, b"x", 75).unwrap().len(), 75);
    }

    #[test]
    fn test_hkdf_rejects_oversized_output() {
        // HKDF-SHA256 caps output at 255 * 32 bytes
        assert!(matches!(
            hkdf(b"secret", None, b"x", 255 * 32 + 1),
            Err(Error::KeyDerivationFailed(_))
        ));
    }

    #[test]
    fn test_master_key_derivation() {
        let params = KdfParams::fast_insecure();
        let salt = [1u8; SALT_SIZE];

        let k1 = derive_master_key(b"correct horse", &salt, &params).unwrap();
        let k2 = derive_master_key(b"correct horse", &salt, &params).unwrap();
        let k3 = derive_master_key(b"battery staple", &salt, &params).unwrap();
        let k4 = derive_master_key(b"correct horse", &[2u8; SALT_SIZE], &params).unwrap();

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k1, k4);
    }

    #[test]
    fn test_wrap_keys_independent_of_master() {
        let stretched = stretch_password(b"pw", &[3u8; SALT_SIZE], &KdfParams::fast_insecure()).unwrap();
        let master = master_key_from_stretched(&stretched).unwrap();
        let wrap = password_wrap_key(&stretched).unwrap();
        assert_ne!(master.as_bytes(), wrap.as_bytes());
        assert_ne!(master.storage_key().unwrap().as_bytes(), master.as_bytes());
    }

    #[test]
    fn test_short_salt_rejected() {
        assert!(stretch_password(b"pw", b"abc", &KdfParams::fast_insecure()).is_err());
    }
}
