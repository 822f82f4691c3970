//! # E2EE Client
//!
//! Application-facing entry point. One `E2eeClient` per local device; it
//! owns every component and wires them together.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           E2eeClient                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   RecoveryManager ──MasterKey──► KeyManager ◄── PreKeyBundleService     │
//! │                                      ▲                ▲                │
//! │                                      │                │                │
//! │                TrustStore ◄──── SessionManager ───────┘                │
//! │                                      ▲                                 │
//! │                                      │                                 │
//! │                         MessageEncryptionPipeline ──► Directory        │
//! │                                                                         │
//! │   Every component records to the shared AuditLog.                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::bundle::PreKeyBundleService;
use crate::config::E2eeConfig;
use crate::crypto::IdentityKey;
use crate::device::DeviceId;
use crate::directory::Directory;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::keys::{KeyManager, MaintenanceReport};
use crate::pipeline::MessageEncryptionPipeline;
use crate::recovery::{RecoveryCode, RecoveryManager};
use crate::safety::{SafetyNumber, TrustStore};
use crate::session::{SessionManager, SessionState};
use crate::store::KeyStore;
use crate::time::{Clock, SystemClock};

/// End-to-end encryption for one local device
pub struct E2eeClient {
    device: DeviceId,
    audit: Arc<AuditLog>,
    directory: Arc<dyn Directory>,
    recovery: RecoveryManager,
    keys: Arc<KeyManager>,
    bundles: Arc<PreKeyBundleService>,
    trust: Arc<TrustStore>,
    sessions: Arc<SessionManager>,
    pipeline: MessageEncryptionPipeline,
    // Set by setup, taken by the first export
    unexported_code: Mutex<Option<RecoveryCode>>,
}

impl E2eeClient {
    /// Create a client on the wall clock
    pub fn new(
        device: DeviceId,
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn Directory>,
        config: E2eeConfig,
    ) -> Result<Self> {
        Self::with_clock(device, store, directory, config, Arc::new(SystemClock))
    }

    /// Create a client with an injected clock
    pub fn with_clock(
        device: DeviceId,
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn Directory>,
        config: E2eeConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let audit = Arc::new(AuditLog::with_clock(clock.clone()));
        let recovery = RecoveryManager::new(store.clone(), device.clone(), config.kdf.clone(), audit.clone());
        let keys = Arc::new(KeyManager::new(
            device.clone(),
            store,
            config.prekeys.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let bundles = Arc::new(PreKeyBundleService::new(keys.clone(), audit.clone(), clock.clone()));
        let trust = Arc::new(TrustStore::new(keys.clone(), audit.clone(), clock.clone()));
        let sessions = Arc::new(SessionManager::new(
            keys.clone(),
            bundles.clone(),
            trust.clone(),
            audit.clone(),
            clock,
            config.ratchet.clone(),
        ));
        let pipeline = MessageEncryptionPipeline::new(device.clone(), sessions.clone(), directory.clone(), audit.clone());

        Ok(Self {
            device,
            audit,
            directory,
            recovery,
            keys,
            bundles,
            trust,
            sessions,
            pipeline,
            unexported_code: Mutex::new(None),
        })
    }

    /// The local device
    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    /// Shared audit log
    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Key manager, for inventory inspection
    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Session manager, for state inspection
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// First-run setup: create the MasterKey, the recovery code and all
    /// device keys
    pub async fn setup(&self, password: &str) -> Result<IdentityKey> {
        self.setup_cancellable(password, CancellationToken::new()).await
    }

    /// [`Self::setup`] that can be abandoned while Argon2 runs
    pub async fn setup_cancellable(&self, password: &str, cancel: CancellationToken) -> Result<IdentityKey> {
        if self.keys.is_initialized()? {
            return Err(Error::AlreadyInitialized);
        }
        if self.recovery.is_set_up()? {
            return self.resume_setup(password, cancel).await;
        }
        let (master, code) = self.recovery.setup(password, cancel).await?;
        // Stashed before key generation so a resumed setup still hands it out
        *self.unexported_code.lock() = Some(code);
        self.keys.initialize_device(&master)
    }

    /// Finish a setup whose MasterKey wraps were stored but whose device
    /// keys were not
    async fn resume_setup(&self, password: &str, cancel: CancellationToken) -> Result<IdentityKey> {
        tracing::warn!("Resuming interrupted setup on device {}", self.device);
        let master = self.recovery.unlock(password, cancel).await?;
        {
            let mut pending = self.unexported_code.lock();
            if pending.is_none() {
                // The first code was lost or already shown before keys existed
                *pending = Some(self.recovery.reissue_recovery_code(&master)?);
            }
        }
        self.keys.initialize_device(&master)
    }

    /// Unlock device keys with the password
    pub async fn unlock(&self, password: &str) -> Result<IdentityKey> {
        let master = self.recovery.unlock(password, CancellationToken::new()).await?;
        self.keys.open(&master)
    }

    /// Drop keys and cached sessions from memory
    pub fn lock(&self) {
        self.sessions.clear_cache();
        self.keys.lock();
    }

    /// Whether device keys are in memory
    pub fn is_unlocked(&self) -> bool {
        self.keys.is_unlocked()
    }

    /// The public identity key
    pub fn identity_key(&self) -> Result<IdentityKey> {
        self.keys.identity_key()
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    /// The recovery code created by setup
    ///
    /// Available exactly once; later calls fail with
    /// `RecoveryCodeUnavailable`.
    pub fn export_recovery_code(&self) -> Result<RecoveryCode> {
        self.unexported_code
            .lock()
            .take()
            .ok_or(Error::RecoveryCodeUnavailable)
    }

    /// Unlock device keys with the recovery code
    pub fn recover_from_code(&self, phrase: &str) -> Result<IdentityKey> {
        let code = RecoveryCode::from_phrase(phrase)?;
        let master = self.recovery.recover(&code)?;
        self.keys.open(&master)
    }

    /// Unlock with the recovery code and set a new password
    pub async fn recover_and_reset_password(&self, phrase: &str, new_password: &str) -> Result<IdentityKey> {
        let code = RecoveryCode::from_phrase(phrase)?;
        let master = self
            .recovery
            .recover_and_reset_password(&code, new_password, CancellationToken::new())
            .await?;
        self.keys.open(&master)
    }

    /// Rewrap the MasterKey under a new password
    pub async fn change_password(&self, old: &str, new: &str) -> Result<()> {
        self.recovery.change_password(old, new, CancellationToken::new()).await
    }

    // ========================================================================
    // PREKEYS
    // ========================================================================

    /// Top up one-time prekeys if needed and publish bundles
    ///
    /// Returns the number of bundles published.
    pub async fn publish_bundles(&self) -> Result<usize> {
        self.keys.replenish_if_below_low_water()?;
        let count = self.keys.config().bundles_per_publish;
        for _ in 0..count {
            let bundle = self.bundles.publish_bundle()?;
            self.directory.publish_pre_key_bundle(bundle).await?;
        }
        Ok(count)
    }

    /// Rotate, purge and replenish as the policy requires
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.keys.run_maintenance()
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    /// Encrypt for one device, establishing a session if needed
    pub async fn encrypt_for_device(&self, plaintext: &[u8], recipient: &DeviceId) -> Result<Envelope> {
        self.pipeline.encrypt_for_device(plaintext, recipient).await
    }

    /// Encrypt one plaintext for many devices
    pub async fn encrypt_for_devices(
        &self,
        plaintext: &[u8],
        recipients: &[DeviceId],
    ) -> Vec<(DeviceId, Result<Envelope>)> {
        self.pipeline.encrypt_for_devices(plaintext, recipients).await
    }

    /// Encrypt and deliver through the directory
    pub async fn send_to_device(&self, plaintext: &[u8], recipient: &DeviceId) -> Result<()> {
        self.pipeline.send_to_device(plaintext, recipient).await
    }

    /// Decrypt an envelope from `sender`
    ///
    /// A prekey envelope spends a one-time prekey; the pool is topped up
    /// afterwards when it falls below the low-water mark.
    pub async fn decrypt_from_device(&self, envelope: &Envelope, sender: &DeviceId) -> Result<Vec<u8>> {
        let plaintext = self.pipeline.decrypt_from_device(envelope, sender).await?;
        if envelope.is_prekey() {
            if let Err(e) = self.keys.replenish_if_below_low_water() {
                tracing::warn!("One-time prekey replenishment failed: {}", e);
            }
        }
        Ok(plaintext)
    }

    /// State of the session with `peer`
    pub fn session_state(&self, peer: &DeviceId) -> Result<SessionState> {
        self.sessions.session_state(peer)
    }

    /// Retire the session with `peer`; the next message re-establishes
    pub fn supersede_session(&self, peer: &DeviceId) -> Result<bool> {
        self.sessions.supersede_session(peer)
    }

    // ========================================================================
    // VERIFICATION
    // ========================================================================

    /// Safety number between this device and `peer`
    ///
    /// Uses the identity key last seen from `peer`; fails with `NoSession`
    /// if none has been seen yet.
    pub fn get_safety_number(&self, peer: &DeviceId) -> Result<SafetyNumber> {
        let remote = self.trust.get(peer)?.ok_or_else(|| Error::NoSession {
            device: peer.clone(),
            epoch: None,
        })?;
        Ok(SafetyNumber::compute(
            &self.device,
            &self.keys.identity_key()?,
            peer,
            &remote.identity_key,
        ))
    }

    /// Record whether the user confirmed the safety number with `peer`
    pub fn verify_safety_number(&self, peer: &DeviceId, confirmed: bool) -> Result<()> {
        self.trust.set_verified(peer, confirmed)
    }

    /// Whether the user confirmed `peer`'s current identity key
    pub fn is_verified(&self, peer: &DeviceId) -> Result<bool> {
        self.trust.is_verified(peer)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventType;
    use crate::config::PreKeyConfig;
    use crate::directory::MemoryDirectory;
    use crate::store::MemoryKeyStore;
    use crate::time::ManualClock;

    fn config() -> E2eeConfig {
        E2eeConfig {
            prekeys: PreKeyConfig {
                one_time_batch_size: 4,
                one_time_low_water: 2,
                ..PreKeyConfig::default()
            },
            ..E2eeConfig::for_tests()
        }
    }

    fn client(name: &str, directory: &Arc<MemoryDirectory>, clock: &Arc<ManualClock>) -> E2eeClient {
        E2eeClient::with_clock(
            DeviceId::new(name),
            Arc::new(MemoryKeyStore::new()),
            directory.clone(),
            config(),
            clock.clone(),
        )
        .unwrap()
    }

    async fn ready(name: &str, directory: &Arc<MemoryDirectory>, clock: &Arc<ManualClock>) -> E2eeClient {
        let c = client(name, directory, clock);
        c.setup("password").await.unwrap();
        c.publish_bundles().await.unwrap();
        c
    }

    fn env() -> (Arc<MemoryDirectory>, Arc<ManualClock>) {
        (
            Arc::new(MemoryDirectory::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    #[tokio::test]
    async fn test_hello_between_two_devices() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let b = ready("device-b", &dir, &clock).await;

        let envelope = a.encrypt_for_device(b"hello", b.device_id()).await.unwrap();
        let otpk = match &envelope {
            Envelope::PreKey(p) => p.one_time_prekey_id.unwrap(),
            Envelope::Message(_) => panic!("first message must be a prekey message"),
        };

        let plaintext = b.decrypt_from_device(&envelope, a.device_id()).await.unwrap();
        assert_eq!(plaintext, b"hello");
        assert!(!b
            .key_manager()
            .published_one_time_prekey_ids()
            .unwrap()
            .contains(&otpk));
        assert!(b.key_manager().one_time_prekey_secret(otpk).is_err());

        let reply = b.encrypt_for_device(b"hi", a.device_id()).await.unwrap();
        assert_eq!(a.decrypt_from_device(&reply, b.device_id()).await.unwrap(), b"hi");
        assert_eq!(a.session_state(b.device_id()).unwrap(), SessionState::Established);
        assert_eq!(b.session_state(a.device_id()).unwrap(), SessionState::Established);
    }

    #[tokio::test]
    async fn test_send_through_directory() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let b = ready("device-b", &dir, &clock).await;

        a.send_to_device(b"one", b.device_id()).await.unwrap();
        a.send_to_device(b"two", b.device_id()).await.unwrap();

        let inbox = dir.take_inbox(b.device_id());
        assert_eq!(inbox.len(), 2);
        for (delivery, expected) in inbox.iter().zip([&b"one"[..], &b"two"[..]]) {
            assert_eq!(&delivery.sender, a.device_id());
            let text = b.decrypt_from_device(&delivery.envelope, &delivery.sender).await.unwrap();
            assert_eq!(text, expected);
        }
    }

    #[tokio::test]
    async fn test_fan_out() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let b = ready("device-b", &dir, &clock).await;
        let c = ready("device-c", &dir, &clock).await;
        let unknown = DeviceId::new("device-x");

        let targets = vec![b.device_id().clone(), c.device_id().clone(), unknown.clone()];
        let results = a.encrypt_for_devices(b"to all", &targets).await;
        assert_eq!(results.len(), 3);

        for (device, result) in results {
            if device == unknown {
                assert!(matches!(result, Err(Error::BundleNotFound(_))));
                continue;
            }
            let envelope = result.unwrap();
            let receiver = if device == *b.device_id() { &b } else { &c };
            assert_eq!(receiver.decrypt_from_device(&envelope, a.device_id()).await.unwrap(), b"to all");
        }
        // Independent sessions per recipient
        let sb = a.session_manager().current_session_id(b.device_id()).unwrap();
        let sc = a.session_manager().current_session_id(c.device_id()).unwrap();
        assert_ne!(sb, sc);
        // Establishment locks are released on success and on failure
        assert_eq!(a.pipeline.establishing_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_messages_share_one_session() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let b = ready("device-b", &dir, &clock).await;

        let (m1, m2) = tokio::join!(
            a.encrypt_for_device(b"x", b.device_id()),
            a.encrypt_for_device(b"y", b.device_id())
        );
        let (m1, m2) = (m1.unwrap(), m2.unwrap());
        assert_eq!(m1.session_id(), m2.session_id());
        assert_eq!(b.decrypt_from_device(&m1, a.device_id()).await.unwrap(), b"x");
        assert_eq!(b.decrypt_from_device(&m2, a.device_id()).await.unwrap(), b"y");
        assert_eq!(a.pipeline.establishing_count(), 0);
    }

    #[tokio::test]
    async fn test_safety_numbers_and_reinstall() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let b = ready("device-b", &dir, &clock).await;

        assert!(matches!(a.get_safety_number(b.device_id()), Err(Error::NoSession { .. })));

        let m = a.encrypt_for_device(b"hi", b.device_id()).await.unwrap();
        b.decrypt_from_device(&m, a.device_id()).await.unwrap();

        let from_a = a.get_safety_number(b.device_id()).unwrap();
        let from_b = b.get_safety_number(a.device_id()).unwrap();
        assert_eq!(from_a, from_b);
        a.verify_safety_number(b.device_id(), true).unwrap();
        assert!(a.is_verified(b.device_id()).unwrap());

        // B reinstalls: same device id, new keys
        let b2 = ready("device-b", &dir, &clock).await;
        dir.take_inbox(a.device_id());
        let m = b2.encrypt_for_device(b"back again", a.device_id()).await.unwrap();
        assert_eq!(a.decrypt_from_device(&m, b2.device_id()).await.unwrap(), b"back again");

        assert!(!a.is_verified(b2.device_id()).unwrap());
        assert_ne!(a.get_safety_number(b2.device_id()).unwrap(), from_a);
        assert_eq!(a.audit_log().count(AuditEventType::IdentityKeyChanged), 1);
        assert_eq!(a.audit_log().count(AuditEventType::SessionSuperseded), 1);
    }

    #[tokio::test]
    async fn test_recovery_code_exported_once_and_recovers() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let identity = a.identity_key().unwrap();

        let code = a.export_recovery_code().unwrap();
        assert!(matches!(a.export_recovery_code(), Err(Error::RecoveryCodeUnavailable)));

        a.lock();
        assert!(!a.is_unlocked());
        assert!(matches!(a.identity_key(), Err(Error::Locked)));

        assert_eq!(a.recover_from_code(&code.phrase()).unwrap(), identity);
        a.lock();
        assert!(matches!(
            a.recover_from_code("abandon abandon abandon"),
            Err(Error::InvalidRecoveryCode)
        ));
        assert_eq!(a.unlock("password").await.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_password_change_and_reset() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let identity = a.identity_key().unwrap();
        let code = a.export_recovery_code().unwrap();

        a.change_password("password", "better").await.unwrap();
        a.lock();
        assert!(matches!(a.unlock("password").await, Err(Error::InvalidPassword)));
        assert_eq!(a.unlock("better").await.unwrap(), identity);

        a.lock();
        assert_eq!(a.recover_and_reset_password(&code.phrase(), "reset").await.unwrap(), identity);
        a.lock();
        assert_eq!(a.unlock("reset").await.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_sessions_survive_lock_and_unlock() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let b = ready("device-b", &dir, &clock).await;

        let m = a.encrypt_for_device(b"before", b.device_id()).await.unwrap();
        b.decrypt_from_device(&m, a.device_id()).await.unwrap();

        b.lock();
        assert!(matches!(b.decrypt_from_device(&m, a.device_id()).await, Err(Error::Locked)));
        b.unlock("password").await.unwrap();

        let m = a.encrypt_for_device(b"after", b.device_id()).await.unwrap();
        assert_eq!(b.decrypt_from_device(&m, a.device_id()).await.unwrap(), b"after");
    }

    #[tokio::test]
    async fn test_failed_decrypt_is_audited_with_generic_message() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        let b = ready("device-b", &dir, &clock).await;

        let mut m = a.encrypt_for_device(b"secret", b.device_id()).await.unwrap();
        if let Envelope::PreKey(p) = &mut m {
            p.message.ciphertext[0] ^= 1;
        }
        let err = b.decrypt_from_device(&m, a.device_id()).await.unwrap_err();
        assert_eq!(err.user_message(), crate::error::UNDECRYPTABLE_MESSAGE);
        assert_eq!(b.audit_log().count(AuditEventType::DecryptionFailed), 1);
        assert!(!b.audit_log().export_json().unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn test_exhausted_pool_falls_back_to_signed_prekey() {
        let (dir, clock) = env();
        let b = ready("device-b", &dir, &clock).await;
        let a = ready("device-a", &dir, &clock).await;
        let c = ready("device-c", &dir, &clock).await;

        // A takes the only queued bundle; C gets the copy without a one-time key
        let m = a.encrypt_for_device(b"first", b.device_id()).await.unwrap();
        let m2 = c.encrypt_for_device(b"second", b.device_id()).await.unwrap();
        match &m2 {
            Envelope::PreKey(p) => assert!(p.one_time_prekey_id.is_none()),
            Envelope::Message(_) => panic!("expected prekey message"),
        }
        assert_eq!(b.decrypt_from_device(&m, a.device_id()).await.unwrap(), b"first");
        assert_eq!(b.decrypt_from_device(&m2, c.device_id()).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_setup_twice_and_maintenance() {
        let (dir, clock) = env();
        let a = ready("device-a", &dir, &clock).await;
        assert!(matches!(a.setup("password").await, Err(Error::AlreadyInitialized)));

        clock.advance_secs(8 * 24 * 60 * 60);
        let report = a.run_maintenance().unwrap();
        assert!(report.rotated_signed_prekey.is_some());
    }

    #[tokio::test]
    async fn test_interrupted_setup_resumes() {
        let (dir, clock) = env();
        let store = Arc::new(MemoryKeyStore::new());
        let a = E2eeClient::with_clock(
            DeviceId::new("device-a"),
            store.clone(),
            dir.clone(),
            config(),
            clock.clone(),
        )
        .unwrap();

        store.fail_writes_under(Some(crate::store::keys::ONE_TIME_PREKEY_PREFIX));
        assert!(matches!(a.setup("password").await, Err(Error::StorageWriteError(_))));
        assert!(!a.is_unlocked());
        store.fail_writes_under(None);

        assert!(matches!(a.setup("wrong").await, Err(Error::InvalidPassword)));
        let identity = a.setup("password").await.unwrap();
        assert!(matches!(a.setup("password").await, Err(Error::AlreadyInitialized)));
        assert_eq!(
            a.key_manager().one_time_prekey_count().unwrap(),
            config().prekeys.one_time_batch_size
        );

        let code = a.export_recovery_code().unwrap();
        a.lock();
        assert_eq!(a.recover_from_code(&code.phrase()).unwrap(), identity);
        a.lock();
        assert_eq!(a.unlock("password").await.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_resumed_setup_reissues_shown_code() {
        let (dir, clock) = env();
        let store = Arc::new(MemoryKeyStore::new());
        let a = E2eeClient::with_clock(
            DeviceId::new("device-a"),
            store.clone(),
            dir.clone(),
            config(),
            clock.clone(),
        )
        .unwrap();

        store.fail_writes_under(Some(crate::store::keys::IDENTITY));
        assert!(a.setup("password").await.is_err());
        let stale = a.export_recovery_code().unwrap();
        store.fail_writes_under(None);

        let identity = a.setup("password").await.unwrap();
        let fresh = a.export_recovery_code().unwrap();
        assert_ne!(fresh.words(), stale.words());

        a.lock();
        assert!(matches!(a.recover_from_code(&stale.phrase()), Err(Error::InvalidRecoveryCode)));
        assert_eq!(a.recover_from_code(&fresh.phrase()).unwrap(), identity);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.ratchet.max_skip = 0;
        let result = E2eeClient::new(
            DeviceId::new("a"),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(MemoryDirectory::new()),
            bad,
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
