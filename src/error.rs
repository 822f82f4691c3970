//! # Error Handling
//!
//! Error types for the Umbra end-to-end encryption subsystem.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Lifecycle (100-199)                                               │
//! │  │   ├── NotInitialized        - No device keys for this device        │
//! │  │   ├── AlreadyInitialized    - Device keys already exist             │
//! │  │   ├── Locked                - Master key not unlocked               │
//! │  │   └── Cancelled             - Background task abandoned             │
//! │  │                                                                      │
//! │  ├── Cryptographic (300-399)        never retried, never logged        │
//! │  │   ├── AuthenticationFailure - AEAD tag mismatch                     │
//! │  │   ├── InvalidRecoveryCode   - Wrong / malformed recovery code       │
//! │  │   ├── InvalidPassword       - Wrong password                        │
//! │  │   └── InvalidKey ...        - Malformed key material                │
//! │  │                                                                      │
//! │  ├── Infrastructure (400-599)       propagated unchanged               │
//! │  │   ├── Storage*              - Key store failures                    │
//! │  │   └── Transport             - Directory / delivery failures         │
//! │  │                                                                      │
//! │  ├── Resource exhaustion (600-699)  caller remediates                  │
//! │  │   ├── PreKeyExhausted       - One-time prekey pool empty            │
//! │  │   └── TooManySkippedMessages - Skipped-key bound exceeded           │
//! │  │                                                                      │
//! │  └── Protocol state (700-799)       re-establish, never blind retry    │
//! │      ├── NoSession             - No session with that device           │
//! │      ├── SessionSuperseded     - Message for a replaced session        │
//! │      ├── StaleBundleSignature  - Rejected peer prekey bundle           │
//! │      └── UnknownSignedPreKey / UnknownOneTimePreKey                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cryptographic failures are local dead ends: the operation that produced
//! them leaves every piece of state exactly as it was.

use thiserror::Error;

use crate::device::DeviceId;

/// Result type alias for E2EE operations
pub type Result<T> = std::result::Result<T, Error>;

/// Generic text shown to users for any message that cannot be read.
pub const UNDECRYPTABLE_MESSAGE: &str = "This message could not be decrypted.";

/// Main error type for the E2EE subsystem
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle Errors (100-199)
    // ========================================================================

    /// The device has no key material yet
    #[error("E2EE has not been set up on this device.")]
    NotInitialized,

    /// The device already has an identity key
    #[error("E2EE is already set up on this device.")]
    AlreadyInitialized,

    /// The master key has not been unlocked
    #[error("E2EE keys are locked. Unlock with the account password first.")]
    Locked,

    /// A background operation was cancelled before it committed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The recovery code was already shown once
    #[error("The recovery code can only be displayed once.")]
    RecoveryCodeUnavailable,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Cryptographic Errors (300-399)
    // ========================================================================

    /// AEAD authentication tag mismatch (tampered data or wrong key)
    #[error("Authentication failure")]
    AuthenticationFailure,

    /// The recovery code did not unwrap the master key
    #[error("Invalid recovery code")]
    InvalidRecoveryCode,

    /// The password did not unwrap the master key
    #[error("Invalid password")]
    InvalidPassword,

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    /// Signature verification failed
    #[error("Signature verification failed")]
    VerificationFailed,

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Failed to read from the key store
    #[error("Failed to read from key store: {0}")]
    StorageReadError(String),

    /// Failed to write to the key store
    #[error("Failed to write to key store: {0}")]
    StorageWriteError(String),

    /// A stored record failed structural checks
    #[error("Stored record is corrupted: {0}")]
    StorageCorrupted(String),

    /// A stored record uses a format this build does not understand
    #[error("Unsupported record format version {0}")]
    UnsupportedRecordVersion(u8),

    // ========================================================================
    // Transport Errors (500-599)
    // ========================================================================

    /// Directory or delivery failure reported by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// No prekey bundle is published for the device
    #[error("No prekey bundle published for device {0}")]
    BundleNotFound(DeviceId),

    /// Malformed envelope bytes
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    // ========================================================================
    // Key Inventory Errors (600-699)
    // ========================================================================

    /// No one-time prekeys are left in the pool
    #[error("One-time prekey pool is exhausted")]
    PreKeyExhausted,

    /// A message skipped further ahead than the skipped-key bound allows
    #[error("Too many skipped messages ({skipped}, limit {limit})")]
    TooManySkippedMessages {
        /// How many keys would have had to be cached
        skipped: u32,
        /// Configured bound
        limit: u32,
    },

    // ========================================================================
    // Session / Protocol Errors (700-799)
    // ========================================================================

    /// No session exists with the device
    #[error("No session with device {device} (epoch {epoch:?})")]
    NoSession {
        /// Remote device
        device: DeviceId,
        /// Epoch of the last known session, if any
        epoch: Option<u32>,
    },

    /// The message belongs to a session that has been replaced
    #[error("Session with device {device} was superseded (epoch {epoch})")]
    SessionSuperseded {
        /// Remote device
        device: DeviceId,
        /// Current epoch
        epoch: u32,
    },

    /// A peer bundle failed signature or freshness checks
    #[error("Rejected prekey bundle from device {device}: signed prekey is unsigned, invalid or stale")]
    StaleBundleSignature {
        /// Device that published the bundle
        device: DeviceId,
    },

    /// A prekey message referenced a signed prekey we no longer hold
    #[error("Unknown signed prekey {0}")]
    UnknownSignedPreKey(u32),

    /// A prekey message referenced a one-time prekey we no longer hold
    #[error("Unknown one-time prekey {0}")]
    UnknownOneTimePreKey(u32),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Error categories used for handling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Tampering or wrong key; never retried
    Cryptographic,
    /// Caller can remediate (replenish keys, request re-sync)
    ResourceExhaustion,
    /// Session must be re-established or the bundle re-fetched
    ProtocolState,
    /// Store or network failure from a collaborator
    Infrastructure,
    /// Bug or misuse
    Internal,
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Lifecycle
    /// - 300-399: Cryptographic
    /// - 400-499: Storage
    /// - 500-599: Transport
    /// - 600-699: Key inventory
    /// - 700-799: Session / protocol
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            Error::NotInitialized => 100,
            Error::AlreadyInitialized => 101,
            Error::Locked => 102,
            Error::Cancelled(_) => 103,
            Error::RecoveryCodeUnavailable => 104,
            Error::InvalidConfig(_) => 105,

            Error::AuthenticationFailure => 300,
            Error::InvalidRecoveryCode => 301,
            Error::InvalidPassword => 302,
            Error::EncryptionFailed(_) => 303,
            Error::InvalidKey(_) => 304,
            Error::KeyDerivationFailed(_) => 305,
            Error::VerificationFailed => 306,

            Error::StorageReadError(_) => 400,
            Error::StorageWriteError(_) => 401,
            Error::StorageCorrupted(_) => 402,
            Error::UnsupportedRecordVersion(_) => 403,

            Error::Transport(_) => 500,
            Error::BundleNotFound(_) => 501,
            Error::InvalidEnvelope(_) => 502,

            Error::PreKeyExhausted => 600,
            Error::TooManySkippedMessages { .. } => 601,

            Error::NoSession { .. } => 700,
            Error::SessionSuperseded { .. } => 701,
            Error::StaleBundleSignature { .. } => 702,
            Error::UnknownSignedPreKey(_) => 703,
            Error::UnknownOneTimePreKey(_) => 704,

            Error::Internal(_) => 900,
            Error::SerializationError(_) => 902,
            Error::DeserializationError(_) => 903,
        }
    }

    /// Map the error onto the handling taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AuthenticationFailure
            | Error::InvalidRecoveryCode
            | Error::InvalidPassword
            | Error::EncryptionFailed(_)
            | Error::InvalidKey(_)
            | Error::KeyDerivationFailed(_)
            | Error::VerificationFailed
            | Error::InvalidEnvelope(_) => ErrorKind::Cryptographic,

            Error::PreKeyExhausted | Error::TooManySkippedMessages { .. } => {
                ErrorKind::ResourceExhaustion
            }

            Error::NotInitialized
            | Error::AlreadyInitialized
            | Error::Locked
            | Error::RecoveryCodeUnavailable
            | Error::NoSession { .. }
            | Error::SessionSuperseded { .. }
            | Error::StaleBundleSignature { .. }
            | Error::UnknownSignedPreKey(_)
            | Error::UnknownOneTimePreKey(_) => ErrorKind::ProtocolState,

            Error::StorageReadError(_)
            | Error::StorageWriteError(_)
            | Error::StorageCorrupted(_)
            | Error::UnsupportedRecordVersion(_)
            | Error::Transport(_)
            | Error::BundleNotFound(_) => ErrorKind::Infrastructure,

            Error::Cancelled(_)
            | Error::InvalidConfig(_)
            | Error::Internal(_)
            | Error::SerializationError(_)
            | Error::DeserializationError(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by caller-driven remediation
    /// (replenishing keys, requesting a resync) or by retrying the
    /// infrastructure call that failed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceExhaustion | ErrorKind::Infrastructure
        )
    }

    /// Check if the caller should fetch a fresh bundle and re-establish
    pub fn requires_reestablishment(&self) -> bool {
        matches!(
            self,
            Error::NoSession { .. }
                | Error::SessionSuperseded { .. }
                | Error::UnknownSignedPreKey(_)
                | Error::UnknownOneTimePreKey(_)
        )
    }

    /// Text safe to show in the UI
    ///
    /// Anything that stopped a message from being read collapses into one
    /// generic sentence.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Cryptographic | ErrorKind::ProtocolState | ErrorKind::ResourceExhaustion => {
                UNDECRYPTABLE_MESSAGE.to_string()
            }
            ErrorKind::Infrastructure | ErrorKind::Internal => self.to_string(),
        }
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", err))
    }
}

// ============================================================================
// TESTS
// ============================================================================
