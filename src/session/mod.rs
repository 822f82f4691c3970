//! # Session Manager
//!
//! Establishes, persists and advances pairwise sessions.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SESSION LIFECYCLE (per peer)                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   NoSession ──initiate_session──► Pending ──first reply──► Established  │
//! │       │                                                       ▲        │
//! │       └────────────incoming prekey message────────────────────┘        │
//! │                                                                         │
//! │   Any newer session installed for the same peer moves the old one to   │
//! │   Superseded and bumps the epoch. Messages addressed to a superseded   │
//! │   session id fail with SessionSuperseded.                              │
//! │                                                                         │
//! │   Simultaneous initiation: when our Pending session meets an incoming  │
//! │   prekey message, both sides keep the session with the smaller id.     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Each peer has its own lock. Encrypt and decrypt on the same peer are
//! serialized; different peers proceed in parallel. Every operation works on
//! a copy of the record, persists it, and only then replaces the cached
//! copy, so a failure anywhere leaves both the store and memory untouched.

pub mod ratchet;
pub mod record;
pub mod x3dh;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub use ratchet::{MessageHeader, RatchetState, HEADER_SIZE};
pub use record::{PendingPreKey, Role, Session, SessionId, SessionRecord, SessionState, SupersededSession};

use crate::audit::{AuditEventType, AuditLog};
use crate::bundle::{PreKeyBundle, PreKeyBundleService};
use crate::config::RatchetConfig;
use crate::crypto::IdentityKey;
use crate::device::DeviceId;
use crate::envelope::{Envelope, PreKeyMessage, RatchetMessage};
use crate::error::{Error, Result};
use crate::keys::KeyManager;
use crate::safety::TrustStore;
use crate::store::{keys, RecordKind, SealedStore};
use crate::time::Clock;

type Slot = Arc<Mutex<Option<SessionRecord>>>;

/// Whether a record update needs to be written back
enum Outcome<R> {
    Changed(R),
    Unchanged(R),
}

/// A session installed by an operation, for auditing after the lock drops
struct Installed {
    id: SessionId,
    role: Role,
    epoch: u32,
    replaced: Option<SupersededSession>,
}

/// Side effects of accepting a prekey message, applied only once the
/// session record is committed
struct Accepted {
    installed: Option<Installed>,
    one_time_prekey_id: Option<u32>,
    identity: IdentityKey,
}

/// Manages sessions with every peer device
pub struct SessionManager {
    keys: Arc<KeyManager>,
    bundles: Arc<PreKeyBundleService>,
    trust: Arc<TrustStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    config: RatchetConfig,
    slots: Mutex<HashMap<DeviceId, Slot>>,
}

impl SessionManager {
    /// Create a session manager
    pub fn new(
        keys: Arc<KeyManager>,
        bundles: Arc<PreKeyBundleService>,
        trust: Arc<TrustStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        config: RatchetConfig,
    ) -> Self {
        Self {
            keys,
            bundles,
            trust,
            audit,
            clock,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// State of the session with `peer`
    pub fn session_state(&self, peer: &DeviceId) -> Result<SessionState> {
        self.read_record(peer, |record| record.state())
    }

    /// Whether an active session exists with `peer`
    pub fn has_session(&self, peer: &DeviceId) -> Result<bool> {
        self.read_record(peer, |record| record.current.is_some())
    }

    /// Epoch of the active session with `peer`
    pub fn session_epoch(&self, peer: &DeviceId) -> Result<Option<u32>> {
        self.read_record(peer, |record| record.current.as_ref().map(|s| s.epoch))
    }

    /// Id of the active session with `peer`
    pub fn current_session_id(&self, peer: &DeviceId) -> Result<Option<SessionId>> {
        self.read_record(peer, |record| record.current.as_ref().map(|s| s.id))
    }

    /// Drop cached records; the next access reloads from the store
    pub fn clear_cache(&self) {
        self.slots.lock().clear();
    }

    // ========================================================================
    // ESTABLISHMENT
    // ========================================================================

    /// Run X3DH against a peer bundle and install the result as the active
    /// session
    ///
    /// The bundle is vetted first: a bad signature, a stale signed prekey, or
    /// a bundle published by another device is rejected with
    /// `StaleBundleSignature`. An existing session with the peer is
    /// superseded.
    pub fn initiate_session(&self, peer: &DeviceId, bundle: &PreKeyBundle) -> Result<SessionId> {
        if bundle.device_id != *peer {
            return Err(Error::StaleBundleSignature { device: peer.clone() });
        }
        self.bundles.check_peer_bundle(bundle)?;

        let initiation = self.keys.with_identity(|ours| x3dh::initiate(ours, bundle))??;
        let id = SessionId(initiation.base_key.public_bytes());
        let session = Session {
            id,
            role: Role::Initiator,
            state: SessionState::Pending,
            epoch: 0,
            our_identity: self.keys.identity_key()?,
            their_identity: bundle.identity_key,
            pending_prekey: Some(PendingPreKey {
                registration_id: self.keys.registration_id()?,
                signed_prekey_id: initiation.signed_prekey_id,
                one_time_prekey_id: initiation.one_time_prekey_id,
            }),
            created_at: self.clock.now_millis(),
            ratchet: RatchetState::initiator(
                initiation.secrets.root_key,
                initiation.secrets.chain_key,
                &initiation.base_key,
                bundle.signed_prekey.public,
            ),
        };

        let installed = self.update_record(peer, |record| {
            let replaced = record.install(session);
            Ok(Outcome::Changed(Installed {
                id,
                role: Role::Initiator,
                epoch: record.epoch,
                replaced,
            }))
        })?;
        self.observe_identity(peer, &bundle.identity_key);
        self.report_installed(peer, &installed);
        Ok(id)
    }

    /// Explicitly retire the active session with `peer`
    ///
    /// The next encrypt fails with `NoSession`, prompting a fresh bundle
    /// fetch. Returns whether a session was retired.
    pub fn supersede_session(&self, peer: &DeviceId) -> Result<bool> {
        let retired = self.update_record(peer, |record| match record.supersede_current() {
            Some(old) => Ok(Outcome::Changed(Some(old))),
            None => Ok(Outcome::Unchanged(None)),
        })?;

        if let Some(old) = retired {
            tracing::info!("Retired session {} with {} (epoch {})", old.id, peer, old.epoch);
            self.audit_superseded(peer, &old);
        }
        Ok(retired.is_some())
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    /// Encrypt for the active session with `peer`
    ///
    /// Until the peer has replied, envelopes are prekey messages so the peer
    /// can establish the session from any of them.
    pub fn encrypt(&self, peer: &DeviceId, plaintext: &[u8]) -> Result<Envelope> {
        self.update_record(peer, |record| {
            let last_epoch = record.superseded.last().map(|s| s.epoch);
            let session = record.current.as_mut().ok_or_else(|| Error::NoSession {
                device: peer.clone(),
                epoch: last_epoch,
            })?;

            let ad = session.associated_data();
            let (header, ciphertext) = session.ratchet.encrypt(plaintext, &ad)?;
            let message = RatchetMessage {
                session_id: session.id,
                header,
                ciphertext,
            };

            let envelope = match session.pending_prekey {
                Some(pending) => Envelope::PreKey(PreKeyMessage {
                    registration_id: pending.registration_id,
                    identity_key: session.our_identity,
                    base_key: session.id.0,
                    signed_prekey_id: pending.signed_prekey_id,
                    one_time_prekey_id: pending.one_time_prekey_id,
                    message,
                }),
                None => Envelope::Message(message),
            };
            Ok(Outcome::Changed(envelope))
        })
    }

    /// Decrypt an envelope from `peer`
    ///
    /// Prekey envelopes for an unknown session run the responder side of
    /// X3DH. The one-time prekey is consumed and the peer identity recorded
    /// only after the new session record is written, so any failure leaves
    /// sessions, prekeys and trust untouched and the envelope can be retried.
    pub fn decrypt(&self, peer: &DeviceId, envelope: &Envelope) -> Result<Vec<u8>> {
        let message = envelope.message();
        let (plaintext, accepted) = self.update_record(peer, |record| {
            if let Some(session) = record.current.as_mut().filter(|s| s.id == message.session_id) {
                let ad = session.associated_data();
                let plaintext =
                    session
                        .ratchet
                        .decrypt(&message.header, &message.ciphertext, &ad, self.config.max_skip)?;
                if session.state == SessionState::Pending {
                    tracing::debug!("Session {} with {} answered", session.id, peer);
                    session.state = SessionState::Established;
                    session.pending_prekey = None;
                }
                return Ok(Outcome::Changed((plaintext, None)));
            }

            if let Some(epoch) = record.superseded_epoch(&message.session_id) {
                return Err(Error::SessionSuperseded {
                    device: peer.clone(),
                    epoch,
                });
            }

            match envelope {
                Envelope::PreKey(prekey) => self.accept_prekey_message(peer, record, prekey),
                Envelope::Message(_) => Err(Error::NoSession {
                    device: peer.clone(),
                    epoch: record.current.as_ref().map(|s| s.epoch),
                }),
            }
        })?;

        if let Some(accepted) = accepted {
            self.finish_acceptance(peer, accepted);
        }
        Ok(plaintext)
    }

    /// Responder side of X3DH for a prekey message with a new session id
    fn accept_prekey_message(
        &self,
        peer: &DeviceId,
        record: &mut SessionRecord,
        prekey: &PreKeyMessage,
    ) -> Result<Outcome<(Vec<u8>, Option<Accepted>)>> {
        if prekey.message.session_id.0 != prekey.base_key {
            return Err(Error::InvalidEnvelope("session id does not match base key".into()));
        }

        let signed_prekey = self.keys.signed_prekey_secret(prekey.signed_prekey_id)?;
        let one_time_prekey = prekey
            .one_time_prekey_id
            .map(|id| self.keys.one_time_prekey_secret(id))
            .transpose()?;
        let secrets = self.keys.with_identity(|ours| {
            x3dh::respond(
                ours,
                &signed_prekey,
                one_time_prekey.as_ref(),
                &prekey.identity_key,
                &prekey.base_key,
            )
        })??;

        let mut session = Session {
            id: prekey.message.session_id,
            role: Role::Responder,
            state: SessionState::Established,
            epoch: 0,
            our_identity: self.keys.identity_key()?,
            their_identity: prekey.identity_key,
            pending_prekey: None,
            created_at: self.clock.now_millis(),
            ratchet: RatchetState::responder(secrets.root_key, secrets.chain_key, &signed_prekey, prekey.base_key),
        };

        let ad = session.associated_data();
        let plaintext = session.ratchet.decrypt(
            &prekey.message.header,
            &prekey.message.ciphertext,
            &ad,
            self.config.max_skip,
        )?;

        let mut accepted = Accepted {
            installed: None,
            one_time_prekey_id: prekey.one_time_prekey_id,
            identity: prekey.identity_key,
        };

        // Simultaneous initiation by the same peer identity: lower id wins.
        // A new identity always replaces what we had.
        let keep_ours = record.current.as_ref().map_or(false, |ours| {
            ours.state == SessionState::Pending
                && ours.their_identity == prekey.identity_key
                && ours.id < session.id
        });
        if keep_ours {
            tracing::info!(
                "Simultaneous initiation with {}: keeping our session, dropping {}",
                peer,
                session.id
            );
            record.remember_superseded(session.id, record.epoch);
            return Ok(Outcome::Changed((plaintext, Some(accepted))));
        }

        let id = session.id;
        let replaced = record.install(session);
        accepted.installed = Some(Installed {
            id,
            role: Role::Responder,
            epoch: record.epoch,
            replaced,
        });
        Ok(Outcome::Changed((plaintext, Some(accepted))))
    }

    /// Spend the one-time prekey and record the peer identity for a
    /// committed prekey message
    ///
    /// The plaintext has already been authenticated and the session stored,
    /// so failures here are logged rather than returned.
    fn finish_acceptance(&self, peer: &DeviceId, accepted: Accepted) {
        if let Some(id) = accepted.one_time_prekey_id {
            if let Err(e) = self.keys.consume_one_time_prekey(id) {
                tracing::warn!("Failed to retire one-time prekey {} used by {}: {}", id, peer, e);
            }
        }
        self.observe_identity(peer, &accepted.identity);
        if let Some(installed) = &accepted.installed {
            self.report_installed(peer, installed);
        }
    }

    fn observe_identity(&self, peer: &DeviceId, identity: &IdentityKey) {
        if let Err(e) = self.trust.observe(peer, identity) {
            tracing::warn!("Failed to record identity key of {}: {}", peer, e);
        }
    }

    // ========================================================================
    // RECORD ACCESS
    // ========================================================================

    fn slot(&self, peer: &DeviceId) -> Slot {
        self.slots.lock().entry(peer.clone()).or_default().clone()
    }

    fn load(sealed: &SealedStore, peer: &DeviceId) -> Result<SessionRecord> {
        Ok(sealed
            .get(RecordKind::Session, &keys::session(peer))?
            .unwrap_or_else(|| SessionRecord::new(peer.clone())))
    }

    fn read_record<R>(&self, peer: &DeviceId, f: impl FnOnce(&SessionRecord) -> R) -> Result<R> {
        let sealed = self.keys.sealed_store()?;
        let slot = self.slot(peer);
        let mut cached = slot.lock();
        if cached.is_none() {
            *cached = Some(Self::load(&sealed, peer)?);
        }
        let record = cached
            .as_ref()
            .ok_or_else(|| Error::Internal("session record not loaded".into()))?;
        Ok(f(record))
    }

    /// Run `f` on a copy of the peer's record under the peer lock; write the
    /// copy back only when `f` succeeds and reports a change
    fn update_record<R>(
        &self,
        peer: &DeviceId,
        f: impl FnOnce(&mut SessionRecord) -> Result<Outcome<R>>,
    ) -> Result<R> {
        let sealed = self.keys.sealed_store()?;
        let slot = self.slot(peer);
        let mut cached = slot.lock();
        if cached.is_none() {
            *cached = Some(Self::load(&sealed, peer)?);
        }
        let mut working = cached
            .as_ref()
            .ok_or_else(|| Error::Internal("session record not loaded".into()))?
            .clone();

        match f(&mut working)? {
            Outcome::Unchanged(out) => Ok(out),
            Outcome::Changed(out) => {
                sealed.put(RecordKind::Session, &keys::session(peer), &working)?;
                *cached = Some(working);
                Ok(out)
            }
        }
    }

    // ========================================================================
    // REPORTING
    // ========================================================================

    fn report_installed(&self, peer: &DeviceId, installed: &Installed) {
        tracing::info!(
            "Session {} with {} established as {:?} (epoch {})",
            installed.id,
            peer,
            installed.role,
            installed.epoch
        );
        self.audit.record(
            AuditEventType::SessionEstablished,
            self.keys.device_id(),
            [
                ("peer", peer.to_string()),
                ("session", installed.id.to_string()),
                ("role", format!("{:?}", installed.role).to_lowercase()),
                ("epoch", installed.epoch.to_string()),
            ],
        );
        if let Some(old) = &installed.replaced {
            self.audit_superseded(peer, old);
        }
    }

    fn audit_superseded(&self, peer: &DeviceId, old: &SupersededSession) {
        self.audit.record(
            AuditEventType::SessionSuperseded,
            self.keys.device_id(),
            [
                ("peer", peer.to_string()),
                ("session", old.id.to_string()),
                ("epoch", old.epoch.to_string()),
            ],
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
