//! # Prekey Bundles
//!
//! The public material a remote peer needs to start a session with this
//! device without it being online.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ PreKeyBundle                                  │
//! ├───────────────────────────────────────────────┤
//! │ device_id, registration_id                    │
//! │ identity_key        Ed25519 ‖ X25519 (public) │
//! │ signed_prekey       id, X25519, signature     │
//! │ one_time_prekey?    id, X25519                │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! A bundle is a read-only snapshot. Publishing one moves its one-time
//! prekey out of the published pool so no two bundles carry the same key.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEventType, AuditLog};
use crate::crypto::IdentityKey;
use crate::device::{DeviceId, RegistrationId};
use crate::error::{Error, Result};
use crate::keys::{KeyManager, OneTimePreKeyPublic, SignedPreKeyPublic};
use crate::time::Clock;

/// Public key material for initiating a session with one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Publishing device
    pub device_id: DeviceId,
    /// Registration id of the publishing install
    pub registration_id: RegistrationId,
    /// Long-term identity key
    pub identity_key: IdentityKey,
    /// Current signed prekey
    pub signed_prekey: SignedPreKeyPublic,
    /// One reserved one-time prekey, if the pool had any
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Whether the signed prekey signature matches the bundle's identity key
    pub fn verify_signature(&self) -> bool {
        self.signed_prekey.verify(&self.identity_key).is_ok()
    }

    /// Encode for the directory
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the directory
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::DeserializationError(e.to_string()))
    }
}

/// Check the signed-prekey signature against the bundle's identity key
///
/// Callers must reject a bundle that fails this before using it for key
/// agreement.
pub fn verify_bundle(bundle: &PreKeyBundle) -> bool {
    bundle.verify_signature()
}

/// Assembles this device's bundles and vets peer bundles
pub struct PreKeyBundleService {
    keys: Arc<KeyManager>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl PreKeyBundleService {
    /// Create a bundle service over a key manager
    pub fn new(keys: Arc<KeyManager>, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self { keys, audit, clock }
    }

    /// Snapshot the current keys and reserve one one-time prekey
    pub fn publish_bundle(&self) -> Result<PreKeyBundle> {
        let bundle = PreKeyBundle {
            device_id: self.keys.device_id().clone(),
            registration_id: self.keys.registration_id()?,
            identity_key: self.keys.identity_key()?,
            signed_prekey: self.keys.current_signed_prekey()?,
            one_time_prekey: self.keys.reserve_one_time_prekey()?,
        };

        match &bundle.one_time_prekey {
            Some(otpk) => tracing::debug!(
                "Publishing bundle for {} with one-time prekey {}",
                bundle.device_id,
                otpk.id
            ),
            None => tracing::warn!(
                "One-time prekey pool empty; publishing bundle for {} without one",
                bundle.device_id
            ),
        }
        self.audit.record(
            AuditEventType::BundlePublished,
            &bundle.device_id,
            [
                ("signed_prekey_id", bundle.signed_prekey.id.to_string()),
                (
                    "one_time_prekey_id",
                    bundle
                        .one_time_prekey
                        .map_or_else(|| "none".to_string(), |k| k.id.to_string()),
                ),
            ],
        );
        Ok(bundle)
    }

    /// Check the signed-prekey signature against the bundle's identity key
    pub fn verify_bundle(&self, bundle: &PreKeyBundle) -> bool {
        verify_bundle(bundle)
    }

    /// Full acceptance check for a peer bundle
    ///
    /// Rejects bad signatures and signed prekeys older than the configured
    /// maximum age with `StaleBundleSignature`.
    pub fn check_peer_bundle(&self, bundle: &PreKeyBundle) -> Result<()> {
        let max_age_ms = (self.keys.config().max_bundle_age_secs as i64) * 1000;
        let age = self.clock.now_millis() - bundle.signed_prekey.created_at;

        if !bundle.verify_signature() || age > max_age_ms {
            tracing::warn!(
                "Rejected prekey bundle from {} (signature or age check failed)",
                bundle.device_id
            );
            return Err(Error::StaleBundleSignature {
                device: bundle.device_id.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreKeyConfig;
    use crate::crypto::{sign_prekey, IdentityKeyPair, MasterKey};
    use crate::store::MemoryKeyStore;
    use crate::time::ManualClock;

    fn service(clock: Arc<ManualClock>) -> (Arc<KeyManager>, PreKeyBundleService) {
        let audit = Arc::new(AuditLog::with_clock(clock.clone()));
        let keys = Arc::new(KeyManager::new(
            DeviceId::new("bob-phone"),
            Arc::new(MemoryKeyStore::new()),
            PreKeyConfig {
                one_time_low_water: 1,
                one_time_batch_size: 2,
                ..PreKeyConfig::default()
            },
            audit.clone(),
            clock.clone(),
        ));
        keys.initialize_device(&MasterKey::from_bytes([3u8; 32])).unwrap();
        let service = PreKeyBundleService::new(keys.clone(), audit, clock);
        (keys, service)
    }

    #[test]
    fn test_publish_reserves_one_time_prekey() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (keys, service) = service(clock);

        let b1 = service.publish_bundle().unwrap();
        let b2 = service.publish_bundle().unwrap();
        let b3 = service.publish_bundle().unwrap();

        let id1 = b1.one_time_prekey.unwrap().id;
        let id2 = b2.one_time_prekey.unwrap().id;
        assert_ne!(id1, id2);
        assert!(b3.one_time_prekey.is_none());
        assert!(keys.published_one_time_prekey_ids().unwrap().is_empty());
        assert!(service.verify_bundle(&b1));
    }

    #[test]
    fn test_substituted_signed_prekey_rejected() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (_, service) = service(clock);
        let mut bundle = service.publish_bundle().unwrap();

        // Attacker swaps in their own prekey, signed by their own identity
        let attacker = IdentityKeyPair::generate();
        bundle.signed_prekey.public = [9u8; 32];
        bundle.signed_prekey.signature = sign_prekey(&attacker.signing, bundle.signed_prekey.id, &[9u8; 32]);

        assert!(!verify_bundle(&bundle));
        assert!(matches!(
            service.check_peer_bundle(&bundle),
            Err(Error::StaleBundleSignature { .. })
        ));
    }

    #[test]
    fn test_stale_bundle_rejected() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (_, service) = service(clock.clone());
        let bundle = service.publish_bundle().unwrap();
        assert!(service.check_peer_bundle(&bundle).is_ok());

        clock.advance_secs(31 * 24 * 60 * 60);
        assert!(matches!(
            service.check_peer_bundle(&bundle),
            Err(Error::StaleBundleSignature { .. })
        ));
    }

    #[test]
    fn test_bundle_wire_roundtrip() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (_, service) = service(clock);
        let bundle = service.publish_bundle().unwrap();
        let back = PreKeyBundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
        assert_eq!(back, bundle);
        assert!(PreKeyBundle::from_bytes(&[1, 2, 3]).is_err());
    }
}
