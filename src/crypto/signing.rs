//! # Digital Signatures
//!
//! Ed25519 signatures. The identity key signs every signed prekey so a
//! peer can reject a substituted prekey before using it in key agreement.
//!
//! ```text
//! signature = Ed25519_sign(IK_signing, "umbra-e2ee-spk-v1" ‖ spk_id (u32 BE) ‖ spk_public)
//! ```
//!
//! The domain prefix keeps prekey signatures from ever being valid for any
//! other message signed with the same identity.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::kdf::domain;
use crate::crypto::SigningKeyPair;
use crate::error::{Error, Result};

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_bytes")] pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Parse a signature received from a peer
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(Error::InvalidKey(format!(
                "Signature must be {} bytes, got {}",
                SIGNATURE_SIZE,
                slice.len()
            )));
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

/// Sign a message
pub fn sign(keypair: &SigningKeyPair, message: &[u8]) -> Signature {
    let sig = keypair.signing_key().sign(message);
    Signature(sig.to_bytes())
}

/// Verify a signature against an Ed25519 public key
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &Signature) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidKey(format!("Invalid public key: {}", e)))?;

    let sig = Ed25519Signature::from_bytes(&signature.0);

    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| Error::VerificationFailed)
}

/// Bytes covered by a signed-prekey signature
pub fn signed_prekey_message(id: u32, public: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(domain::SIGNED_PREKEY.len() + 4 + 32);
    msg.extend_from_slice(domain::SIGNED_PREKEY);
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(public);
    msg
}

/// Sign a signed prekey with the identity signing key
pub fn sign_prekey(identity: &SigningKeyPair, id: u32, public: &[u8; 32]) -> Signature {
    sign(identity, &signed_prekey_message(id, public))
}

/// Verify a signed prekey against the publishing identity
pub fn verify_prekey(
    identity_signing: &[u8; 32],
    id: u32,
    public: &[u8; 32],
    signature: &Signature,
) -> Result<()> {
    verify(identity_signing, &signed_prekey_message(id, public), signature)
}

/// Serde helper for signature bytes
mod signature_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = SigningKeyPair::generate();
        let message = b"Hello, World!";

        let signature = sign(&keypair, message);
        assert!(verify(&keypair.public_bytes(), message, &signature).is_ok());
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let keypair1 = SigningKeyPair::generate();
        let keypair2 = SigningKeyPair::generate();

        let signature = sign(&keypair1, b"Hello");
        assert!(matches!(
            verify(&keypair2.public_bytes(), b"Hello", &signature),
            Err(Error::VerificationFailed)
        ));
    }

    #[test]
    fn test_prekey_signature_binds_id_and_key() {
        let identity = SigningKeyPair::generate();
        let spk = [7u8; 32];
        let sig = sign_prekey(&identity, 3, &spk);

        assert!(verify_prekey(&identity.public_bytes(), 3, &spk, &sig).is_ok());
        assert!(verify_prekey(&identity.public_bytes(), 4, &spk, &sig).is_err());
        assert!(verify_prekey(&identity.public_bytes(), 3, &[8u8; 32], &sig).is_err());
    }

    #[test]
    fn test_signature_serialization() {
        let keypair = SigningKeyPair::generate();
        let signature = sign(&keypair, b"test");

        let json = serde_json::to_string(&signature).unwrap();
        let restored: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(signature, restored);

        assert!(Signature::from_slice(&[0u8; 10]).is_err());
    }
}
