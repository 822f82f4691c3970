//! # Message Encryption Pipeline
//!
//! Bridges application messages and the session layer.
//!
//! ```text
//! encrypt_for_device(plaintext, recipient)
//!   │
//!   ├─ session with recipient? ──no──► fetch bundle ──► initiate_session
//!   │                                  (one fetch per recipient at a time)
//!   └─ SessionManager::encrypt ──► Envelope
//!
//! decrypt_from_device(envelope, sender)
//!   │
//!   └─ SessionManager::decrypt ──► plaintext
//!        on failure: warn (no payload), audit DecryptionFailed, return error
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;

use crate::audit::{AuditEventType, AuditLog};
use crate::device::DeviceId;
use crate::directory::Directory;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::session::SessionManager;

/// Encrypts outgoing and decrypts incoming messages
pub struct MessageEncryptionPipeline {
    device: DeviceId,
    sessions: Arc<SessionManager>,
    directory: Arc<dyn Directory>,
    audit: Arc<AuditLog>,
    establishing: EstablishingLocks,
}

impl MessageEncryptionPipeline {
    /// Create a pipeline for the local device
    pub fn new(
        device: DeviceId,
        sessions: Arc<SessionManager>,
        directory: Arc<dyn Directory>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            device,
            sessions,
            directory,
            audit,
            establishing: Mutex::new(HashMap::new()),
        }
    }

    /// Encrypt for one device, establishing a session first if needed
    pub async fn encrypt_for_device(&self, plaintext: &[u8], recipient: &DeviceId) -> Result<Envelope> {
        self.ensure_session(recipient).await?;
        self.sessions.encrypt(recipient, plaintext)
    }

    /// Encrypt one plaintext for many devices concurrently
    ///
    /// Each recipient gets its own session and its own result; one failing
    /// recipient does not affect the others.
    pub async fn encrypt_for_devices(
        &self,
        plaintext: &[u8],
        recipients: &[DeviceId],
    ) -> Vec<(DeviceId, Result<Envelope>)> {
        let results = join_all(
            recipients
                .iter()
                .map(|recipient| self.encrypt_for_device(plaintext, recipient)),
        )
        .await;
        recipients.iter().cloned().zip(results).collect()
    }

    /// Encrypt and hand the envelope to the directory
    pub async fn send_to_device(&self, plaintext: &[u8], recipient: &DeviceId) -> Result<()> {
        let envelope = self.encrypt_for_device(plaintext, recipient).await?;
        self.directory
            .send_envelope(&self.device, recipient, envelope)
            .await
    }

    /// Decrypt an envelope from `sender`
    ///
    /// Failures are logged without payload and audited, then returned to
    /// the caller. Nothing is retried.
    pub async fn decrypt_from_device(&self, envelope: &Envelope, sender: &DeviceId) -> Result<Vec<u8>> {
        match self.sessions.decrypt(sender, envelope) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                tracing::warn!(
                    "Failed to decrypt message from {} (code {}, {:?})",
                    sender,
                    e.code(),
                    e.kind()
                );
                self.audit.record(
                    AuditEventType::DecryptionFailed,
                    &self.device,
                    [
                        ("peer", sender.to_string()),
                        ("session", envelope.session_id().to_string()),
                        ("code", e.code().to_string()),
                    ],
                );
                Err(e)
            }
        }
    }

    /// Fetch a bundle and initiate a session unless one exists
    async fn ensure_session(&self, recipient: &DeviceId) -> Result<()> {
        if self.sessions.has_session(recipient)? {
            return Ok(());
        }

        let slot = EstablishingSlot::acquire(&self.establishing, recipient);
        let _guard = slot.lock.lock().await;

        // Another task may have finished establishing while we waited
        if self.sessions.has_session(recipient)? {
            return Ok(());
        }

        tracing::debug!("No session with {}; fetching bundle", recipient);
        let bundle = self.directory.fetch_pre_key_bundle(recipient).await?;
        self.sessions.initiate_session(recipient, &bundle)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn establishing_count(&self) -> usize {
        self.establishing.lock().len()
    }
}

type EstablishingLocks = Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>;

/// One task's claim on a recipient's establishment lock
///
/// Dropping the last claim removes the map entry, also when the task is
/// cancelled mid-fetch.
struct EstablishingSlot<'a> {
    locks: &'a EstablishingLocks,
    recipient: &'a DeviceId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> EstablishingSlot<'a> {
    fn acquire(locks: &'a EstablishingLocks, recipient: &'a DeviceId) -> Self {
        let lock = locks.lock().entry(recipient.clone()).or_default().clone();
        Self {
            locks,
            recipient,
            lock,
        }
    }
}

impl Drop for EstablishingSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The map's handle plus ours; clones only happen under this mutex
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(self.recipient);
        }
    }
}
