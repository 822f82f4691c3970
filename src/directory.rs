//! # Directory
//!
//! Contract for the server-side directory that stores published bundles and
//! relays envelopes, plus an in-memory implementation.
//!
//! ```text
//! publish_pre_key_bundle ──► per-device queue of bundles
//!                               │ each handed out once
//! fetch_pre_key_bundle   ◄──────┤
//!                               └ queue empty: last bundle without its
//!                                 one-time prekey
//! send_envelope          ──► per-device inbox
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bundle::PreKeyBundle;
use crate::device::DeviceId;
use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// Directory and transport used by the pipeline
#[async_trait]
pub trait Directory: Send + Sync {
    /// Store a bundle for other devices to fetch
    async fn publish_pre_key_bundle(&self, bundle: PreKeyBundle) -> Result<()>;

    /// Fetch one bundle for `device`
    async fn fetch_pre_key_bundle(&self, device: &DeviceId) -> Result<PreKeyBundle>;

    /// Deliver an envelope to `recipient`
    async fn send_envelope(&self, sender: &DeviceId, recipient: &DeviceId, envelope: Envelope) -> Result<()>;
}

/// A delivered envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sending device
    pub sender: DeviceId,
    /// The envelope
    pub envelope: Envelope,
}

#[derive(Default)]
struct Bundles {
    queue: VecDeque<PreKeyBundle>,
    fallback: Option<PreKeyBundle>,
}

/// In-memory directory for tests and local demos
#[derive(Default)]
pub struct MemoryDirectory {
    bundles: Mutex<HashMap<DeviceId, Bundles>>,
    inboxes: Mutex<HashMap<DeviceId, Vec<Delivery>>>,
    offline: AtomicBool,
}

impl MemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Bundles still queued for `device`
    pub fn queued_bundles(&self, device: &DeviceId) -> usize {
        self.bundles.lock().get(device).map_or(0, |b| b.queue.len())
    }

    /// Drain the inbox of `device`
    pub fn take_inbox(&self, device: &DeviceId) -> Vec<Delivery> {
        self.inboxes.lock().remove(device).unwrap_or_default()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport("directory unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn publish_pre_key_bundle(&self, bundle: PreKeyBundle) -> Result<()> {
        self.check_online()?;
        let mut bundles = self.bundles.lock();
        let entry = bundles.entry(bundle.device_id.clone()).or_default();
        entry.fallback = Some(PreKeyBundle {
            one_time_prekey: None,
            ..bundle.clone()
        });
        entry.queue.push_back(bundle);
        Ok(())
    }

    async fn fetch_pre_key_bundle(&self, device: &DeviceId) -> Result<PreKeyBundle> {
        self.check_online()?;
        let mut bundles = self.bundles.lock();
        let entry = bundles
            .get_mut(device)
            .ok_or_else(|| Error::BundleNotFound(device.clone()))?;
        if let Some(bundle) = entry.queue.pop_front() {
            return Ok(bundle);
        }
        entry
            .fallback
            .clone()
            .ok_or_else(|| Error::BundleNotFound(device.clone()))
    }

    async fn send_envelope(&self, sender: &DeviceId, recipient: &DeviceId, envelope: Envelope) -> Result<()> {
        self.check_online()?;
        self.inboxes
            .lock()
            .entry(recipient.clone())
            .or_default()
            .push(Delivery {
                sender: sender.clone(),
                envelope,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionKeyPair, IdentityKeyPair};
    use crate::device::RegistrationId;
    use crate::keys::{OneTimePreKeyPublic, SignedPreKeyRecord};

    fn bundle(otpk: u32) -> PreKeyBundle {
        let identity = IdentityKeyPair::generate();
        PreKeyBundle {
            device_id: DeviceId::new("bob"),
            registration_id: RegistrationId(3),
            identity_key: identity.public_key(),
            signed_prekey: SignedPreKeyRecord::generate(1, &identity.signing, 0).public(),
            one_time_prekey: Some(OneTimePreKeyPublic {
                id: otpk,
                public: EncryptionKeyPair::generate().public_bytes(),
            }),
        }
    }

    #[tokio::test]
    async fn test_bundles_handed_out_once() {
        let dir = MemoryDirectory::new();
        let bob = DeviceId::new("bob");
        assert!(matches!(dir.fetch_pre_key_bundle(&bob).await, Err(Error::BundleNotFound(_))));

        dir.publish_pre_key_bundle(bundle(1)).await.unwrap();
        dir.publish_pre_key_bundle(bundle(2)).await.unwrap();
        assert_eq!(dir.queued_bundles(&bob), 2);

        let first = dir.fetch_pre_key_bundle(&bob).await.unwrap();
        let second = dir.fetch_pre_key_bundle(&bob).await.unwrap();
        assert_eq!(first.one_time_prekey.unwrap().id, 1);
        assert_eq!(second.one_time_prekey.unwrap().id, 2);

        let fallback = dir.fetch_pre_key_bundle(&bob).await.unwrap();
        assert!(fallback.one_time_prekey.is_none());
        assert_eq!(fallback.identity_key, second.identity_key);
    }

    #[tokio::test]
    async fn test_offline_is_transport_error() {
        let dir = MemoryDirectory::new();
        dir.set_offline(true);
        let err = dir.publish_pre_key_bundle(bundle(1)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_recoverable());
    }
}
