//! Persisted per-peer session records.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ratchet::RatchetState;
use crate::crypto::IdentityKey;
use crate::device::{DeviceId, RegistrationId};

/// Superseded session ids remembered per peer
pub const SUPERSEDED_HISTORY: usize = 16;

/// Session identifier: the initiator's X3DH base key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 32]);

impl SessionId {
    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

/// Lifecycle state of the session with one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing negotiated
    NoSession,
    /// We initiated and have not heard back yet
    Pending,
    /// Both sides hold matching ratchet state
    Established,
    /// Replaced by a newer session
    Superseded,
}

/// Which side of X3DH this device played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Fetched a bundle and sent the first message
    Initiator,
    /// Answered a prekey message
    Responder,
}

/// What an initiator repeats in every message until the peer replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    /// Our registration id
    pub registration_id: RegistrationId,
    /// Peer signed prekey used
    pub signed_prekey_id: u32,
    /// Peer one-time prekey used, if any
    pub one_time_prekey_id: Option<u32>,
}

/// One negotiated session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Initiator's base key
    pub id: SessionId,
    /// Our role in the agreement
    pub role: Role,
    /// Pending or Established
    pub state: SessionState,
    /// Per-peer sequence number, bumped each time a session is replaced
    pub epoch: u32,
    /// Our identity key at agreement time
    pub our_identity: IdentityKey,
    /// Peer identity key at agreement time
    pub their_identity: IdentityKey,
    /// Present while an initiated session is unanswered
    pub pending_prekey: Option<PendingPreKey>,
    /// Unix millis at agreement
    pub created_at: i64,
    /// Double Ratchet state
    pub ratchet: RatchetState,
}

impl Session {
    /// Associated data bound into every message of this session:
    /// initiator identity ‖ responder identity ‖ session id
    pub fn associated_data(&self) -> Vec<u8> {
        let (initiator, responder) = match self.role {
            Role::Initiator => (&self.our_identity, &self.their_identity),
            Role::Responder => (&self.their_identity, &self.our_identity),
        };
        let mut ad = Vec::with_capacity(64 + 64 + 32);
        ad.extend_from_slice(&initiator.to_bytes());
        ad.extend_from_slice(&responder.to_bytes());
        ad.extend_from_slice(self.id.as_bytes());
        ad
    }
}

/// A session that was replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupersededSession {
    /// Its id
    pub id: SessionId,
    /// Its epoch
    pub epoch: u32,
}

/// Everything stored about one peer device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Peer device
    pub peer: DeviceId,
    /// Epoch of the most recently installed session
    pub epoch: u32,
    /// Active session
    pub current: Option<Session>,
    /// Recently replaced sessions, oldest first
    pub superseded: Vec<SupersededSession>,
}

impl SessionRecord {
    /// Empty record for a peer
    pub fn new(peer: DeviceId) -> Self {
        Self {
            peer,
            epoch: 0,
            current: None,
            superseded: Vec::new(),
        }
    }

    /// State of the active session, or of the peer as a whole
    pub fn state(&self) -> SessionState {
        match &self.current {
            Some(session) => session.state,
            None if !self.superseded.is_empty() => SessionState::Superseded,
            None => SessionState::NoSession,
        }
    }

    /// Epoch of a superseded session, if `id` was one
    pub fn superseded_epoch(&self, id: &SessionId) -> Option<u32> {
        self.superseded.iter().find(|s| s.id == *id).map(|s| s.epoch)
    }

    /// Retire the active session, if any
    pub fn supersede_current(&mut self) -> Option<SupersededSession> {
        let old = self.current.take()?;
        Some(self.remember_superseded(old.id, old.epoch))
    }

    /// Remember a session id as superseded without it ever being active
    pub fn remember_superseded(&mut self, id: SessionId, epoch: u32) -> SupersededSession {
        let entry = SupersededSession { id, epoch };
        self.superseded.push(entry);
        if self.superseded.len() > SUPERSEDED_HISTORY {
            self.superseded.remove(0);
        }
        entry
    }

    /// Install a new session, superseding the active one
    ///
    /// The new session gets the next epoch. Returns what was superseded.
    pub fn install(&mut self, mut session: Session) -> Option<SupersededSession> {
        let old = self.supersede_current();
        self.epoch += 1;
        session.epoch = self.epoch;
        self.current = Some(session);
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionKeyPair, IdentityKeyPair};

    fn session(id: u8) -> Session {
        let base = EncryptionKeyPair::generate();
        Session {
            id: SessionId([id; 32]),
            role: Role::Initiator,
            state: SessionState::Pending,
            epoch: 0,
            our_identity: IdentityKeyPair::generate().public_key(),
            their_identity: IdentityKeyPair::generate().public_key(),
            pending_prekey: None,
            created_at: 0,
            ratchet: RatchetState::initiator([0u8; 32], [1u8; 32], &base, [2u8; 32]),
        }
    }

    #[test]
    fn test_install_bumps_epoch_and_supersedes() {
        let mut record = SessionRecord::new(DeviceId::new("bob"));
        assert_eq!(record.state(), SessionState::NoSession);

        assert!(record.install(session(1)).is_none());
        assert_eq!(record.epoch, 1);
        assert_eq!(record.state(), SessionState::Pending);

        let old = record.install(session(2)).unwrap();
        assert_eq!(old.id, SessionId([1; 32]));
        assert_eq!(old.epoch, 1);
        assert_eq!(record.current.as_ref().unwrap().epoch, 2);
        assert_eq!(record.superseded_epoch(&SessionId([1; 32])), Some(1));
        assert_eq!(record.superseded_epoch(&SessionId([2; 32])), None);

        record.supersede_current();
        assert_eq!(record.state(), SessionState::Superseded);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut record = SessionRecord::new(DeviceId::new("bob"));
        for i in 0..(SUPERSEDED_HISTORY as u8 + 5) {
            record.install(session(i));
        }
        assert_eq!(record.superseded.len(), SUPERSEDED_HISTORY);
        assert_eq!(record.superseded_epoch(&SessionId([0; 32])), None);
    }

    #[test]
    fn test_associated_data_matches_across_roles() {
        let alice = session(9);
        let mut bob = alice.clone();
        bob.role = Role::Responder;
        bob.our_identity = alice.their_identity;
        bob.their_identity = alice.our_identity;
        assert_eq!(alice.associated_data(), bob.associated_data());
        assert_eq!(alice.associated_data().len(), 160);
    }
}
