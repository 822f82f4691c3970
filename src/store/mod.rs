//! # Key Storage
//!
//! Persistence contract for device key material.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     PERSISTED STATE (per device)                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  identity                    IdentityKeyPair              sealed        │
//! │  signed_prekey/current       SignedPreKey                 sealed        │
//! │  signed_prekey/prior         SignedPreKey + retire time   sealed        │
//! │  one_time_prekey/<id>        OneTimePreKey (N records)    sealed        │
//! │  counters                    next prekey ids, reg. id     sealed        │
//! │  session/<peer device>       SessionRecord                sealed        │
//! │  trust/<peer device>         TrustRecord                  sealed        │
//! │  recovery/password           MasterKey wrapped by password              │
//! │  recovery/code               MasterKey wrapped by recovery code         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store itself is not trusted with plaintext: every value handed to
//! [`KeyStore::put`] is already a sealed record (see [`sealed`]).

pub mod memory;
pub mod sealed;

pub use memory::MemoryKeyStore;
pub use sealed::{RecordKind, SealedStore, RECORD_MAGIC, RECORD_VERSION};

use crate::device::DeviceId;
use crate::error::Result;

/// Key names for the key store
pub mod keys {
    /// The sealed identity keypair
    pub const IDENTITY: &str = "identity";

    /// The signed prekey currently published
    pub const SIGNED_PREKEY_CURRENT: &str = "signed_prekey/current";

    /// The previous signed prekey, kept for the grace window
    pub const SIGNED_PREKEY_PRIOR: &str = "signed_prekey/prior";

    /// Prefix of one-time prekey records
    pub const ONE_TIME_PREKEY_PREFIX: &str = "one_time_prekey/";

    /// Id counters and registration id
    pub const COUNTERS: &str = "counters";

    /// Prefix of session records
    pub const SESSION_PREFIX: &str = "session/";

    /// Prefix of identity trust records
    pub const TRUST_PREFIX: &str = "trust/";

    /// MasterKey wrapped under the password key
    pub const RECOVERY_PASSWORD: &str = "recovery/password";

    /// MasterKey wrapped under the recovery code key
    pub const RECOVERY_CODE: &str = "recovery/code";

    /// Record key of one one-time prekey
    pub fn one_time_prekey(id: u32) -> String {
        format!("{}{}", ONE_TIME_PREKEY_PREFIX, id)
    }

    /// Parse a one-time prekey id back out of its record key
    pub fn parse_one_time_prekey_id(key: &str) -> Option<u32> {
        key.strip_prefix(ONE_TIME_PREKEY_PREFIX)?.parse().ok()
    }

    /// Record key of the session with a peer device
    pub fn session(peer: &crate::device::DeviceId) -> String {
        format!("{}{}", SESSION_PREFIX, peer)
    }

    /// Record key of the trust decision about a peer device
    pub fn trust(peer: &crate::device::DeviceId) -> String {
        format!("{}{}", TRUST_PREFIX, peer)
    }
}

/// Durable key-value store for sealed key records
///
/// Implementations must be at-least-once durable. They are not expected to
/// encrypt: callers only ever store sealed ciphertext.
pub trait KeyStore: Send + Sync {
    /// Read one record
    fn get(&self, device: &DeviceId, key_id: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace one record
    fn put(&self, device: &DeviceId, key_id: &str, value: &[u8]) -> Result<()>;

    /// Remove one record, reporting whether it existed
    fn delete(&self, device: &DeviceId, key_id: &str) -> Result<bool>;

    /// Ids of all one-time prekey records held for the device
    fn list_one_time_prekey_ids(&self, device: &DeviceId) -> Result<Vec<u32>>;
}
