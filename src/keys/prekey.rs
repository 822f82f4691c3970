//! Prekey records.
//!
//! Private records are what gets sealed into the key store; the `*Public`
//! types are what goes into a bundle.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{sign_prekey, verify_prekey, EncryptionKeyPair, IdentityKey, Signature, SigningKeyPair};
use crate::error::Result;

/// Medium-term prekey signed by the identity key
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKeyRecord {
    /// Prekey id, unique per device
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    /// X25519 public key
    #[zeroize(skip)]
    pub public: [u8; 32],
    /// Identity signature over id and public key
    #[zeroize(skip)]
    pub signature: Signature,
    /// Unix millis at generation
    #[zeroize(skip)]
    pub created_at: i64,
    /// Set once superseded: when the key may be deleted
    #[zeroize(skip)]
    pub retire_at: Option<i64>,
}

impl SignedPreKeyRecord {
    /// Generate and sign a new signed prekey
    pub fn generate(id: u32, identity: &SigningKeyPair, now: i64) -> Self {
        let pair = EncryptionKeyPair::generate();
        let public = pair.public_bytes();
        Self {
            id,
            secret: *pair.secret_bytes(),
            public,
            signature: sign_prekey(identity, id, &public),
            created_at: now,
            retire_at: None,
        }
    }

    /// The key pair for agreement
    pub fn key_pair(&self) -> EncryptionKeyPair {
        EncryptionKeyPair::from_bytes(&self.secret)
    }

    /// Public half for a bundle
    pub fn public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            public: self.public,
            signature: self.signature,
            created_at: self.created_at,
        }
    }
}

/// Public half of a signed prekey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    /// Prekey id
    pub id: u32,
    /// X25519 public key
    pub public: [u8; 32],
    /// Identity signature over id and public key
    pub signature: Signature,
    /// Unix millis at generation
    pub created_at: i64,
}

impl SignedPreKeyPublic {
    /// Check the signature against the claimed identity
    pub fn verify(&self, identity: &IdentityKey) -> Result<()> {
        verify_prekey(&identity.signing, self.id, &self.public, &self.signature)
    }
}

/// Single-use prekey
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePreKeyRecord {
    /// Prekey id, unique per device
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    /// X25519 public key
    #[zeroize(skip)]
    pub public: [u8; 32],
}

impl OneTimePreKeyRecord {
    /// Assign an id to a freshly generated key pair
    pub fn from_key_pair(id: u32, pair: &EncryptionKeyPair) -> Self {
        Self {
            id,
            secret: *pair.secret_bytes(),
            public: pair.public_bytes(),
        }
    }

    /// The key pair for agreement
    pub fn key_pair(&self) -> EncryptionKeyPair {
        EncryptionKeyPair::from_bytes(&self.secret)
    }

    /// Public half for a bundle
    pub fn public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id,
            public: self.public,
        }
    }
}

/// Public half of a one-time prekey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    /// Prekey id
    pub id: u32,
    /// X25519 public key
    pub public: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    #[test]
    fn test_signed_prekey_verifies() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(1, &identity.signing, 1_000);

        assert!(spk.public().verify(&identity.public_key()).is_ok());
        assert_eq!(spk.key_pair().public_bytes(), spk.public);

        let other = IdentityKeyPair::generate();
        assert!(spk.public().verify(&other.public_key()).is_err());
    }

    #[test]
    fn test_record_serialization_keeps_secret() {
        let pair = EncryptionKeyPair::generate();
        let otpk = OneTimePreKeyRecord::from_key_pair(9, &pair);
        let bytes = bincode::serialize(&otpk).unwrap();
        let back: OneTimePreKeyRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.key_pair().public_bytes(), pair.public_bytes());
        assert_eq!(back.public().id, 9);
    }
}
