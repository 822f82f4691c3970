//! # Audit Log
//!
//! Append-only record of key-lifecycle events for diagnostics and intrusion
//! detection.
//!
//! ```text
//! KeyManager ─┐
//! Sessions ───┼──► AuditLog::record ──► in-memory log (append only)
//! Recovery ───┘                     ├──► AuditSink trait objects
//!                                   ├──► broadcast stream (subscribe)
//!                                   └──► tracing, target "umbra_e2ee::audit"
//! ```
//!
//! Events carry device identifiers and non-secret metadata (key ids, counts,
//! epochs). Key material and plaintext never enter an event.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::device::DeviceId;
use crate::error::Result;
use crate::time::{Clock, SystemClock};

const STREAM_CAPACITY: usize = 256;

/// Kind of key-lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Identity key and initial prekeys created
    DeviceInitialized,
    /// Existing device keys unlocked
    DeviceUnlocked,
    /// New signed prekey published
    SignedPreKeyRotated,
    /// Prior signed prekey deleted after its grace window
    SignedPreKeyPurged,
    /// One-time prekey pool topped up
    OneTimePreKeysReplenished,
    /// One-time prekey used by an incoming agreement
    OneTimePreKeyConsumed,
    /// Oldest reserved one-time prekeys dropped to bound the pool
    OneTimePreKeysEvicted,
    /// Bundle handed out for publication
    BundlePublished,
    /// Session established (either role)
    SessionEstablished,
    /// Session replaced by a newer one
    SessionSuperseded,
    /// Peer identity key differs from the one on record
    IdentityKeyChanged,
    /// User confirmed a safety number
    SafetyNumberVerified,
    /// User withdrew a safety number confirmation
    SafetyNumberUnverified,
    /// MasterKey and recovery code created
    RecoverySetup,
    /// MasterKey recovered from the recovery code
    RecoveryUsed,
    /// MasterKey rewrapped under a new password
    PasswordChanged,
    /// An incoming message could not be decrypted
    DecryptionFailed,
}

impl AuditEventType {
    /// Stable snake_case name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceInitialized => "device_initialized",
            Self::DeviceUnlocked => "device_unlocked",
            Self::SignedPreKeyRotated => "signed_pre_key_rotated",
            Self::SignedPreKeyPurged => "signed_pre_key_purged",
            Self::OneTimePreKeysReplenished => "one_time_pre_keys_replenished",
            Self::OneTimePreKeyConsumed => "one_time_pre_key_consumed",
            Self::OneTimePreKeysEvicted => "one_time_pre_keys_evicted",
            Self::BundlePublished => "bundle_published",
            Self::SessionEstablished => "session_established",
            Self::SessionSuperseded => "session_superseded",
            Self::IdentityKeyChanged => "identity_key_changed",
            Self::SafetyNumberVerified => "safety_number_verified",
            Self::SafetyNumberUnverified => "safety_number_unverified",
            Self::RecoverySetup => "recovery_setup",
            Self::RecoveryUsed => "recovery_used",
            Self::PasswordChanged => "password_changed",
            Self::DecryptionFailed => "decryption_failed",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event id
    pub id: Uuid,
    /// Unix milliseconds
    pub timestamp: i64,
    /// What happened
    pub event_type: AuditEventType,
    /// Local device the event concerns
    pub device_id: DeviceId,
    /// Non-secret details
    pub metadata: BTreeMap<String, String>,
}

/// External consumer of audit events (log shipping, SIEM forwarders)
pub trait AuditSink: Send + Sync {
    /// Called once per event, in append order
    fn record(&self, event: &AuditEvent);
}

/// Append-only audit log
pub struct AuditLog {
    events: RwLock<Vec<AuditEvent>>,
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
    stream: broadcast::Sender<AuditEvent>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    /// Create an empty log stamped by the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty log stamped by `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            events: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            stream,
            clock,
        }
    }

    /// Attach an external sink
    pub fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks.write().push(sink);
    }

    /// Live stream of events appended after this call
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.stream.subscribe()
    }

    /// Append an event
    pub fn record<I, K, V>(&self, event_type: AuditEventType, device_id: &DeviceId, metadata: I) -> AuditEvent
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: self.clock.now_millis(),
            event_type,
            device_id: device_id.clone(),
            metadata: metadata
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        };

        tracing::info!(
            target: "umbra_e2ee::audit",
            event = %event.event_type,
            device = %event.device_id,
            metadata = ?event.metadata,
            "audit event"
        );

        // Hold the write lock across fan-out so sinks see append order
        let mut events = self.events.write();
        events.push(event.clone());
        for sink in self.sinks.read().iter() {
            sink.record(&event);
        }
        // No receivers is fine
        let _ = self.stream.send(event.clone());
        drop(events);

        event
    }

    /// Snapshot of all events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }

    /// Events of one type
    pub fn events_of(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Count of events of one type
    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Export as a JSON array
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&*self.events.read())?)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
