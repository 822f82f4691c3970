//! # Message Envelopes
//!
//! Wire format for ratchet messages.
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────────────────────────┐
//! │ version  │ bincode(Envelope)                                            │
//! │ (1 byte) │                                                              │
//! └──────────┴──────────────────────────────────────────────────────────────┘
//!
//! Envelope::PreKey    first messages of an unanswered session; carries what
//!                     the responder needs to run X3DH
//! Envelope::Message   everything after the peer has replied
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto::IdentityKey;
use crate::device::RegistrationId;
use crate::error::{Error, Result};
use crate::session::{MessageHeader, SessionId};

/// Current envelope encoding version
pub const ENVELOPE_VERSION: u8 = 1;

/// One ratchet-encrypted payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Session the message belongs to
    pub session_id: SessionId,
    /// Cleartext ratchet header
    pub header: MessageHeader,
    /// AEAD ciphertext and tag
    pub ciphertext: Vec<u8>,
}

/// A ratchet message plus the initiator's X3DH parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    /// Initiator's registration id
    pub registration_id: RegistrationId,
    /// Initiator's identity key
    pub identity_key: IdentityKey,
    /// Initiator's base key (also the session id)
    pub base_key: [u8; 32],
    /// Responder signed prekey used
    pub signed_prekey_id: u32,
    /// Responder one-time prekey used, if any
    pub one_time_prekey_id: Option<u32>,
    /// The encrypted message
    pub message: RatchetMessage,
}

/// Serialized unit handed to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Session-establishing message
    PreKey(PreKeyMessage),
    /// Ordinary message
    Message(RatchetMessage),
}

impl Envelope {
    /// The ratchet message inside
    pub fn message(&self) -> &RatchetMessage {
        match self {
            Envelope::PreKey(p) => &p.message,
            Envelope::Message(m) => m,
        }
    }

    /// Session the envelope belongs to
    pub fn session_id(&self) -> SessionId {
        self.message().session_id
    }

    /// Whether this envelope can establish a session
    pub fn is_prekey(&self) -> bool {
        matches!(self, Envelope::PreKey(_))
    }

    /// Encode with a leading version byte
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![ENVELOPE_VERSION];
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    /// Decode, rejecting unknown versions
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| Error::InvalidEnvelope("empty envelope".into()))?;
        if version != ENVELOPE_VERSION {
            return Err(Error::InvalidEnvelope(format!("unsupported version {}", version)));
        }
        bincode::deserialize(body).map_err(|e| Error::InvalidEnvelope(e.to_string()))
    }

    /// Base64 text form for JSON transports
    pub fn to_base64(&self) -> Result<String> {
        Ok(STANDARD.encode(self.to_bytes()?))
    }

    /// Parse the base64 text form
    pub fn from_base64(text: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(text)
            .map_err(|e| Error::InvalidEnvelope(format!("bad base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}
