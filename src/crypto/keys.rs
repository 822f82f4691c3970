//! # Key Types
//!
//! Asymmetric key material used by the E2EE subsystem.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  IdentityKeyPair (long-term, one per device)                           │
//! │  ┌───────────────────────┐    ┌───────────────────────┐               │
//! │  │ SigningKeyPair        │    │ EncryptionKeyPair     │               │
//! │  │ Ed25519               │    │ X25519                │               │
//! │  │ • signs prekeys       │    │ • X3DH DH1 / DH4      │               │
//! │  └───────────────────────┘    └───────────────────────┘               │
//! │                                                                         │
//! │  EncryptionKeyPair (X25519) is also used for:                          │
//! │  • signed prekeys and one-time prekeys                                 │
//! │  • X3DH ephemeral (base) keys                                          │
//! │  • Double Ratchet keys                                                 │
//! │                                                                         │
//! │  IdentityKey = public half: signing (32) ‖ encryption (32)             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Private halves are zeroized on drop and only leave this module as
//! `Zeroizing` buffers headed for a sealed store record.

use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};

/// Size of an X25519 or Ed25519 public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a serialized identity key (signing ‖ encryption)
pub const IDENTITY_KEY_SIZE: usize = 64;

/// Long-term device identity keypair
///
/// ## Security
///
/// - Private keys are zeroized when this struct is dropped
/// - The private half is only ever persisted inside a sealed record
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    /// Ed25519 keypair for signing prekeys
    pub signing: SigningKeyPair,
    /// X25519 keypair for key agreement
    pub encryption: EncryptionKeyPair,
}

impl IdentityKeyPair {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            signing: SigningKeyPair::generate(),
            encryption: EncryptionKeyPair::generate(),
        }
    }

    /// Rebuild from the 64 secret bytes produced by [`Self::secret_bytes`]
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(Error::InvalidKey(format!(
                "Identity secret must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut signing = [0u8; 32];
        let mut encryption = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        encryption.copy_from_slice(&bytes[32..]);

        let pair = Self {
            signing: SigningKeyPair::from_bytes(&signing),
            encryption: EncryptionKeyPair::from_bytes(&encryption),
        };
        signing.zeroize();
        encryption.zeroize();
        Ok(pair)
    }

    /// Secret bytes for sealed storage
    ///
    /// ## Security Warning
    ///
    /// Only use this for sealing. Never log or transmit these bytes.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(64));
        out.extend_from_slice(self.signing.secret_bytes().as_ref());
        out.extend_from_slice(self.encryption.secret_bytes().as_ref());
        out
    }

    /// The public identity key
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey {
            signing: self.signing.public_bytes(),
            encryption: self.encryption.public_bytes(),
        }
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 signing keypair
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)] // ed25519_dalek::SigningKey handles its own zeroization
    secret: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(bytes),
        }
    }

    /// Secret key bytes
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.secret.verifying_key().to_bytes()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }
}

/// X25519 keypair for key agreement
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKeyPair {
    #[zeroize(skip)] // x25519_dalek handles its own zeroization
    secret: StaticSecret,
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl EncryptionKeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from raw secret bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from a secret slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("X25519 secret must be 32 bytes".into()))?;
        let pair = Self::from_bytes(&raw);
        raw.zeroize();
        Ok(pair)
    }

    /// Secret key bytes
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Perform Diffie-Hellman key exchange
    ///
    /// Both `a.diffie_hellman(B)` and `b.diffie_hellman(A)` yield the same
    /// secret. The scalar multiplication is constant-time; a low-order peer
    /// key (all-zero output) is rejected.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> Result<SharedSecret> {
        let their_public = X25519PublicKey::from(*their_public);
        let shared = self.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(Error::InvalidKey("non-contributory X25519 public key".into()));
        }
        Ok(SharedSecret::from_bytes(shared.to_bytes()))
    }
}

impl Clone for EncryptionKeyPair {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.secret.to_bytes())
    }
}

/// Output of an X25519 exchange, zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generate a fresh X25519 keypair
pub fn generate_key_pair() -> EncryptionKeyPair {
    EncryptionKeyPair::generate()
}

/// X25519 Diffie-Hellman
pub fn dh(ours: &EncryptionKeyPair, theirs: &[u8; 32]) -> Result<SharedSecret> {
    ours.diffie_hellman(theirs)
}

/// Public identity key of a device
///
/// This contains only public information and can be serialized,
/// transmitted, and stored without security concerns.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    /// Ed25519 public key for prekey signatures
    #[serde(with = "hex_bytes")]
    pub signing: [u8; 32],

    /// X25519 public key for key agreement
    #[serde(with = "hex_bytes")]
    pub encryption: [u8; 32],
}

impl IdentityKey {
    /// Create from raw bytes
    pub fn from_parts(signing: [u8; 32], encryption: [u8; 32]) -> Self {
        Self {
            signing,
            encryption,
        }
    }

    /// Parse the 64-byte wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != IDENTITY_KEY_SIZE {
            return Err(Error::InvalidKey(format!(
                "Identity key must be {} bytes, got {}",
                IDENTITY_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut signing = [0u8; 32];
        let mut encryption = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        encryption.copy_from_slice(&bytes[32..]);
        Ok(Self {
            signing,
            encryption,
        })
    }

    /// 64-byte wire form: signing ‖ encryption
    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        let mut out = [0u8; IDENTITY_KEY_SIZE];
        out[..32].copy_from_slice(&self.signing);
        out[32..].copy_from_slice(&self.encryption);
        out
    }

    /// Verifying key for prekey signatures
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.signing)
            .map_err(|e| Error::InvalidKey(format!("Invalid signing public key: {}", e)))
    }

    /// Encode as hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Decode from hex string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidKey(format!("Invalid hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({}…)", &hex::encode(self.signing)[..16])
    }
}

/// Serde helper for serializing byte arrays as hex
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid length"))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let kp1 = IdentityKeyPair::generate();
        let kp2 = IdentityKeyPair::generate();

        assert_ne!(kp1.public_key(), kp2.public_key());
    }

    #[test]
    fn test_identity_secret_roundtrip() {
        let kp = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());

        assert!(IdentityKeyPair::from_secret_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_diffie_hellman_agreement() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();

        let ab = dh(&alice, &bob.public_bytes()).unwrap();
        let ba = dh(&bob, &alice.public_bytes()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = generate_key_pair();
        assert!(dh(&alice, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_identity_key_wire_form() {
        let key = IdentityKeyPair::generate().public_key();
        let bytes = key.to_bytes();
        assert_eq!(IdentityKey::from_bytes(&bytes).unwrap(), key);
        assert_eq!(IdentityKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(IdentityKey::from_bytes(&bytes[..63]).is_err());
    }

    #[test]
    fn test_identity_key_serde_is_hex() {
        let key = IdentityKeyPair::generate().public_key();
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains(&hex::encode(key.signing)));
        let back: IdentityKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
