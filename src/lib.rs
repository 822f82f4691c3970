//! # Umbra E2EE
//!
//! End-to-end encryption for Umbra direct messages: device keys, prekey
//! bundles, X3DH session establishment, the Double Ratchet, password and
//! recovery-code protection, and a security audit trail.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          UMBRA E2EE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │                        ┌──────────────────┐                             │
//! │                        │    E2eeClient    │                             │
//! │                        └────────┬─────────┘                             │
//! │          ┌──────────────────────┼──────────────────────┐                │
//! │          ▼                      ▼                      ▼                │
//! │  ┌──────────────┐      ┌─────────────────┐     ┌──────────────┐        │
//! │  │   Recovery   │      │    Pipeline     │────►│  Directory   │        │
//! │  │              │      │                 │     │  (trait)     │        │
//! │  │ - Argon2id   │      │ - Fetch bundle  │     └──────────────┘        │
//! │  │ - BIP39 code │      │ - Fan-out       │                             │
//! │  └──────┬───────┘      └────────┬────────┘                             │
//! │         │ MasterKey             ▼                                      │
//! │         │              ┌─────────────────┐     ┌──────────────┐        │
//! │         │              │    Sessions     │────►│ Safety/Trust │        │
//! │         │              │                 │     └──────────────┘        │
//! │         │              │ - X3DH          │                             │
//! │         │              │ - Double Ratchet│                             │
//! │         │              └────────┬────────┘                             │
//! │         ▼                       ▼                                      │
//! │  ┌──────────────┐      ┌─────────────────┐     ┌──────────────┐        │
//! │  │  KeyManager  │◄─────│  Bundle Service │     │   AuditLog   │        │
//! │  └──────┬───────┘      └─────────────────┘     └──────────────┘        │
//! │         ▼                                                              │
//! │  ┌──────────────────────────────────────┐  ┌──────────────────────┐    │
//! │  │  Sealed KeyStore (AES-256-GCM)       │  │  Crypto primitives   │    │
//! │  └──────────────────────────────────────┘  └──────────────────────┘    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error type, codes and kinds for the entire library
//! - [`crypto`] - Primitives (X25519, Ed25519, AES-GCM, HKDF, Argon2)
//! - [`store`] - Key-value store contract and sealed records
//! - [`keys`] - Identity, signed and one-time prekey inventory
//! - [`bundle`] - Prekey bundle publication and verification
//! - [`session`] - X3DH, Double Ratchet and per-peer session records
//! - [`envelope`] - Wire format for encrypted messages
//! - [`safety`] - Safety numbers and identity trust
//! - [`recovery`] - Password and recovery-code protection of the MasterKey
//! - [`pipeline`] - Message encryption for one or many devices
//! - [`audit`] - Security event log
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use umbra_e2ee::{DeviceId, E2eeClient, E2eeConfig, MemoryDirectory, MemoryKeyStore};
//!
//! let directory = Arc::new(MemoryDirectory::new());
//! let alice = E2eeClient::new(
//!     DeviceId::new("alice-phone"),
//!     Arc::new(MemoryKeyStore::new()),
//!     directory.clone(),
//!     E2eeConfig::default(),
//! )?;
//! alice.setup("correct horse battery staple").await?;
//! let code = alice.export_recovery_code()?;
//! alice.publish_bundles().await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod audit;
pub mod bundle;
pub mod client;
pub mod config;
pub mod crypto;
pub mod device;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod pipeline;
pub mod recovery;
pub mod safety;
pub mod session;
pub mod store;
/// Clock abstraction and timestamp helpers.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditSink};
pub use bundle::{PreKeyBundle, PreKeyBundleService};
pub use client::E2eeClient;
pub use config::{E2eeConfig, KdfParams, PreKeyConfig, RatchetConfig};
pub use crypto::{IdentityKey, IdentityKeyPair, MasterKey};
pub use device::{DeviceId, RegistrationId};
pub use directory::{Delivery, Directory, MemoryDirectory};
pub use envelope::Envelope;
pub use error::{Error, ErrorKind, Result};
pub use keys::KeyManager;
pub use pipeline::MessageEncryptionPipeline;
pub use recovery::{RecoveryCode, RecoveryManager};
pub use safety::{SafetyNumber, TrustStore};
pub use session::{SessionId, SessionManager, SessionState};
pub use store::{KeyStore, MemoryKeyStore};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Umbra E2EE
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================
