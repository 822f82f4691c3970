//! # Safety Numbers and Identity Trust
//!
//! A safety number lets two users confirm out of band that nobody has
//! substituted an identity key between them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SAFETY NUMBER                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Per party:                                                            │
//! │    h = SHA-512(version ‖ identity key ‖ device id)                     │
//! │    repeat 5200×: h = SHA-512(h ‖ identity key)                         │
//! │    30 digits = six 5-byte chunks of h, each mod 100000                 │
//! │                                                                         │
//! │  Combined: the two 30-digit halves, smaller first                      │
//! │    → 60 digits shown as 12 groups of 5                                 │
//! │                                                                         │
//! │  Both sides compute the same string; any identity key change alters it │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`TrustStore`] remembers the identity key last seen for each peer and
//! whether the user confirmed it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::audit::{AuditEventType, AuditLog};
use crate::crypto::IdentityKey;
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::keys::KeyManager;
use crate::store::{keys, RecordKind};
use crate::time::Clock;

/// Fingerprint format version
pub const FINGERPRINT_VERSION: u16 = 0;

/// Hash iterations per fingerprint half
pub const FINGERPRINT_ITERATIONS: usize = 5200;

const DIGITS_PER_HALF: usize = 30;

/// Rendered safety number for one pair of devices
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafetyNumber {
    digits: String,
}

impl SafetyNumber {
    /// Compute the safety number between two devices
    ///
    /// Symmetric: swapping local and remote gives the same result.
    pub fn compute(
        local_device: &DeviceId,
        local_identity: &IdentityKey,
        remote_device: &DeviceId,
        remote_identity: &IdentityKey,
    ) -> Self {
        let local = fingerprint_digits(local_device, local_identity);
        let remote = fingerprint_digits(remote_device, remote_identity);

        let digits = if local <= remote {
            local + &remote
        } else {
            remote + &local
        };
        Self { digits }
    }

    /// The 60 digits without separators
    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Twelve groups of five digits
    pub fn groups(&self) -> Vec<&str> {
        (0..self.digits.len())
            .step_by(5)
            .map(|i| &self.digits[i..i + 5])
            .collect()
    }

    /// Compare against a number typed or scanned by the user
    pub fn matches(&self, other: &str) -> bool {
        let cleaned: String = other.chars().filter(|c| c.is_ascii_digit()).collect();
        cleaned == self.digits
    }
}

impl fmt::Display for SafetyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.groups().join(" "))
    }
}

fn fingerprint_digits(device: &DeviceId, identity: &IdentityKey) -> String {
    let key = identity.to_bytes();

    let mut hasher = Sha512::new();
    hasher.update(FINGERPRINT_VERSION.to_be_bytes());
    hasher.update(key);
    hasher.update(device.as_bytes());
    let mut hash = hasher.finalize();

    for _ in 0..FINGERPRINT_ITERATIONS {
        let mut hasher = Sha512::new();
        hasher.update(hash);
        hasher.update(key);
        hash = hasher.finalize();
    }

    let mut digits = String::with_capacity(DIGITS_PER_HALF);
    for chunk in hash[..DIGITS_PER_HALF].chunks(5) {
        let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        digits.push_str(&format!("{:05}", value % 100_000));
    }
    digits
}

// ============================================================================
// TRUST RECORDS
// ============================================================================

/// What we know about a peer's identity key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    /// Identity key last seen
    pub identity_key: IdentityKey,
    /// User confirmed the safety number for this key
    pub verified: bool,
    /// Unix millis when this key was first seen
    pub first_seen: i64,
    /// Unix millis of the confirmation
    pub verified_at: Option<i64>,
}

/// Outcome of observing a peer identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityObservation {
    /// First key seen for this peer
    New,
    /// Same key as on record
    Unchanged,
    /// Key differs from the one on record; verification was reset
    Changed {
        /// The key on record before
        previous: IdentityKey,
    },
}

/// Per-peer identity trust, sealed under `trust/<peer>`
pub struct TrustStore {
    keys: Arc<KeyManager>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    // Serializes read-modify-write of trust records
    write_lock: Mutex<()>,
}

impl TrustStore {
    /// Create a trust store writing through the key manager's sealed store
    pub fn new(keys: Arc<KeyManager>, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys,
            audit,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Trust record for a peer
    pub fn get(&self, peer: &DeviceId) -> Result<Option<TrustRecord>> {
        self.keys
            .sealed_store()?
            .get(RecordKind::Trust, &keys::trust(peer))
    }

    /// Record the identity key a peer presented
    pub fn observe(&self, peer: &DeviceId, identity: &IdentityKey) -> Result<IdentityObservation> {
        let sealed = self.keys.sealed_store()?;
        let key_id = keys::trust(peer);
        let _guard = self.write_lock.lock();

        let existing: Option<TrustRecord> = sealed.get(RecordKind::Trust, &key_id)?;
        let now = self.clock.now_millis();
        let fresh = TrustRecord {
            identity_key: *identity,
            verified: false,
            first_seen: now,
            verified_at: None,
        };

        match existing {
            Some(record) if record.identity_key == *identity => Ok(IdentityObservation::Unchanged),
            Some(record) => {
                sealed.put(RecordKind::Trust, &key_id, &fresh)?;
                tracing::warn!("Identity key for {} changed", peer);
                self.audit.record(
                    AuditEventType::IdentityKeyChanged,
                    self.keys.device_id(),
                    [
                        ("peer", peer.to_string()),
                        ("previous", short_hex(&record.identity_key)),
                        ("current", short_hex(identity)),
                        ("was_verified", record.verified.to_string()),
                    ],
                );
                Ok(IdentityObservation::Changed {
                    previous: record.identity_key,
                })
            }
            None => {
                sealed.put(RecordKind::Trust, &key_id, &fresh)?;
                tracing::debug!("First identity key seen for {}", peer);
                Ok(IdentityObservation::New)
            }
        }
    }

    /// Record the user's safety-number decision for the current key
    ///
    /// Fails with `NoSession` when no identity key has been seen for `peer`.
    pub fn set_verified(&self, peer: &DeviceId, confirmed: bool) -> Result<()> {
        let sealed = self.keys.sealed_store()?;
        let key_id = keys::trust(peer);
        let _guard = self.write_lock.lock();

        let mut record: TrustRecord = sealed
            .get(RecordKind::Trust, &key_id)?
            .ok_or_else(|| Error::NoSession {
                device: peer.clone(),
                epoch: None,
            })?;
        record.verified = confirmed;
        record.verified_at = confirmed.then(|| self.clock.now_millis());
        sealed.put(RecordKind::Trust, &key_id, &record)?;

        let event = if confirmed {
            AuditEventType::SafetyNumberVerified
        } else {
            AuditEventType::SafetyNumberUnverified
        };
        self.audit.record(event, self.keys.device_id(), [("peer", peer.to_string())]);
        Ok(())
    }

    /// Whether the user confirmed the peer's current identity key
    pub fn is_verified(&self, peer: &DeviceId) -> Result<bool> {
        Ok(self.get(peer)?.map_or(false, |r| r.verified))
    }
}

fn short_hex(identity: &IdentityKey) -> String {
    identity.to_hex()[..16].to_string()
}

// ============================================================================
// TESTS
// ============================================================================
