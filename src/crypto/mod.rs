//! # Cryptography Module
//!
//! Stateless primitives used by every other component. Nothing here keeps
//! state between calls; everything operates on byte buffers and key types
//! that zeroize themselves on drop.
//!
//! ## Security Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    AT REST                                      │   │
//! │  │                                                                 │   │
//! │  │  Password ──► Argon2id ──► MasterKey ──► sealed key records    │   │
//! │  │  Recovery code ──► BIP39 seed ──► wraps MasterKey              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    IN FLIGHT                                    │   │
//! │  │                                                                 │   │
//! │  │  X3DH (X25519 ×4 or ×5) ──► HKDF ──► root key, chain key       │   │
//! │  │  Double Ratchet: HKDF chain steps + X25519 ratchet steps       │   │
//! │  │  Message body: AES-256-GCM under a single-use message key      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    AUTHENTICITY                                 │   │
//! │  │                                                                 │   │
//! │  │  Ed25519 identity key signs each signed prekey                 │   │
//! │  │  Safety numbers let humans compare identity keys               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | Ed25519 | Signed prekeys |
//! | X25519 | Key agreement, ratchet steps |
//! | AES-256-GCM | Messages, sealed records |
//! | HKDF-SHA256 | All derivation from high-entropy secrets |
//! | Argon2id | Password stretching |
//! | SHA-512 | Safety number fingerprints |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: All secret keys are zeroized when dropped
//! 2. **Constant-Time Operations**: dalek for ECDH, `aes-gcm` for tag checks
//! 3. **Secure Random**: `rand::rngs::OsRng` for all key material

mod encryption;
mod kdf;
mod keys;
mod signing;

pub use encryption::{
    aead_decrypt, aead_encrypt, decrypt, encrypt, EncryptionKey, Nonce, KEY_SIZE, NONCE_SIZE,
    TAG_SIZE,
};
pub use kdf::{
    derive_master_key, domain, generate_salt, hkdf, hkdf_into, stretch_password, MasterKey,
    SALT_SIZE,
};
pub(crate) use kdf::{master_key_from_stretched, password_wrap_key, recovery_wrap_key};
pub use keys::{
    dh, generate_key_pair, EncryptionKeyPair, IdentityKey, IdentityKeyPair, SharedSecret,
    SigningKeyPair, IDENTITY_KEY_SIZE, PUBLIC_KEY_SIZE,
};
pub use signing::{sign, sign_prekey, verify, verify_prekey, Signature, SIGNATURE_SIZE};
