//! # Key Manager
//!
//! Owns a device's key hierarchy: the long-term identity key, the signed
//! prekey (current plus at most one prior), and the one-time prekey pool.
//!
//! ## Inventory
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PREKEY INVENTORY                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Signed prekeys                                                        │
//! │    current ──rotate──► prior (retire_at = now + grace) ──purge──► gone │
//! │                                                                         │
//! │  One-time prekeys                                                      │
//! │                                                                         │
//! │    replenish ──► published ──reserve──► reserved ──consume──► gone     │
//! │                      │                                    ▲            │
//! │                      └────────────consume─────────────────┘            │
//! │                                                                         │
//! │    published: may go into the next bundle                              │
//! │    reserved:  already handed out in a bundle, awaiting an initiator    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All inventory mutation happens under one mutex, and each mutation writes
//! through to the store before the in-memory view changes. A consumed
//! one-time prekey therefore can never be handed out or consumed again,
//! no matter how many agreements race for it.

pub mod prekey;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

pub use prekey::{OneTimePreKeyPublic, OneTimePreKeyRecord, SignedPreKeyPublic, SignedPreKeyRecord};

use crate::audit::{AuditEventType, AuditLog};
use crate::config::PreKeyConfig;
use crate::crypto::{EncryptionKeyPair, IdentityKey, IdentityKeyPair, MasterKey};
use crate::device::{DeviceId, RegistrationId};
use crate::error::{Error, Result};
use crate::store::{keys, KeyStore, RecordKind, SealedStore};
use crate::time::Clock;

/// Id counters and reservation state, sealed under [`keys::COUNTERS`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryMeta {
    registration_id: u32,
    next_signed_prekey_id: u32,
    next_one_time_prekey_id: u32,
    reserved: BTreeSet<u32>,
}

struct Inventory {
    current: SignedPreKeyRecord,
    prior: Option<SignedPreKeyRecord>,
    one_time: BTreeMap<u32, OneTimePreKeyRecord>,
    meta: InventoryMeta,
}

impl Inventory {
    fn published_count(&self) -> usize {
        self.one_time.len() - self.meta.reserved.len()
    }
}

struct Unlocked {
    sealed: SealedStore,
    identity: IdentityKeyPair,
    inventory: Mutex<Inventory>,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Id of a newly rotated signed prekey
    pub rotated_signed_prekey: Option<u32>,
    /// Id of a purged prior signed prekey
    pub purged_signed_prekey: Option<u32>,
    /// One-time prekeys generated
    pub replenished: usize,
    /// Reserved one-time prekeys dropped over `max_reserved`
    pub evicted_reservations: usize,
}

/// Owner of a device's key hierarchy
pub struct KeyManager {
    device: DeviceId,
    store: Arc<dyn KeyStore>,
    config: PreKeyConfig,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    state: RwLock<Option<Arc<Unlocked>>>,
}

impl KeyManager {
    /// Create a locked key manager for `device`
    pub fn new(
        device: DeviceId,
        store: Arc<dyn KeyStore>,
        config: PreKeyConfig,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            device,
            store,
            config,
            audit,
            clock,
            state: RwLock::new(None),
        }
    }

    /// The local device
    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    /// Prekey policy in force
    pub fn config(&self) -> &PreKeyConfig {
        &self.config
    }

    /// Whether device keys exist in the store
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.store.get(&self.device, keys::IDENTITY)?.is_some())
    }

    /// Whether the keys are unlocked in memory
    pub fn is_unlocked(&self) -> bool {
        self.state.read().is_some()
    }

    fn unlocked(&self) -> Result<Arc<Unlocked>> {
        self.state.read().clone().ok_or(Error::Locked)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Create the identity key, first signed prekey and a full one-time pool
    ///
    /// Fails with `AlreadyInitialized` if the device already has an identity.
    pub fn initialize_device(&self, master: &MasterKey) -> Result<IdentityKey> {
        // Held across the check and the commit
        let mut state = self.state.write();
        if state.is_some() || self.is_initialized()? {
            return Err(Error::AlreadyInitialized);
        }

        let sealed = SealedStore::new(self.store.clone(), self.device.clone(), master)?;
        // Leftovers from an attempt that failed before the identity was written
        for id in sealed.list_one_time_prekey_ids()? {
            sealed.delete(&keys::one_time_prekey(id))?;
        }
        let now = self.clock.now_millis();
        let identity = IdentityKeyPair::generate();
        let registration_id = RegistrationId::generate();
        let current = SignedPreKeyRecord::generate(1, &identity.signing, now);

        let mut one_time = BTreeMap::new();
        for id in 1..=self.config.one_time_batch_size as u32 {
            let record = OneTimePreKeyRecord::from_key_pair(id, &EncryptionKeyPair::generate());
            sealed.put(RecordKind::OneTimePreKey, &keys::one_time_prekey(id), &record)?;
            one_time.insert(id, record);
        }

        let meta = InventoryMeta {
            registration_id: registration_id.0,
            next_signed_prekey_id: 2,
            next_one_time_prekey_id: self.config.one_time_batch_size as u32 + 1,
            reserved: BTreeSet::new(),
        };
        sealed.put(RecordKind::SignedPreKey, keys::SIGNED_PREKEY_CURRENT, &current)?;
        sealed.put(RecordKind::Counters, keys::COUNTERS, &meta)?;
        // The identity record marks the device as initialized, so it goes last
        sealed.put(RecordKind::Identity, keys::IDENTITY, &*identity.secret_bytes())?;

        let public = identity.public_key();
        tracing::info!(
            "Initialized E2EE device {} (registration {}, {} one-time prekeys)",
            self.device,
            registration_id.0,
            one_time.len()
        );
        self.audit.record(
            AuditEventType::DeviceInitialized,
            &self.device,
            [
                ("registration_id", registration_id.0.to_string()),
                ("signed_prekey_id", current.id.to_string()),
                ("one_time_prekeys", one_time.len().to_string()),
            ],
        );

        *state = Some(Arc::new(Unlocked {
            sealed,
            identity,
            inventory: Mutex::new(Inventory {
                current,
                prior: None,
                one_time,
                meta,
            }),
        }));
        Ok(public)
    }

    /// Unlock existing device keys with the MasterKey
    pub fn open(&self, master: &MasterKey) -> Result<IdentityKey> {
        let sealed = SealedStore::new(self.store.clone(), self.device.clone(), master)?;

        let identity_bytes: Zeroizing<Vec<u8>> = sealed
            .get(RecordKind::Identity, keys::IDENTITY)?
            .map(Zeroizing::new)
            .ok_or(Error::NotInitialized)?;
        let identity = IdentityKeyPair::from_secret_bytes(&identity_bytes)?;
        let current: SignedPreKeyRecord = sealed
            .get(RecordKind::SignedPreKey, keys::SIGNED_PREKEY_CURRENT)?
            .ok_or_else(|| Error::StorageCorrupted("current signed prekey missing".into()))?;
        let prior: Option<SignedPreKeyRecord> =
            sealed.get(RecordKind::SignedPreKey, keys::SIGNED_PREKEY_PRIOR)?;
        let mut meta: InventoryMeta = sealed
            .get(RecordKind::Counters, keys::COUNTERS)?
            .ok_or_else(|| Error::StorageCorrupted("prekey counters missing".into()))?;

        let mut one_time = BTreeMap::new();
        for id in sealed.list_one_time_prekey_ids()? {
            if let Some(record) = sealed
                .get::<OneTimePreKeyRecord>(RecordKind::OneTimePreKey, &keys::one_time_prekey(id))?
            {
                one_time.insert(id, record);
            }
        }
        // Reservations for keys that were consumed before a crash
        meta.reserved.retain(|id| one_time.contains_key(id));

        let public = identity.public_key();
        tracing::info!("Unlocked E2EE keys for device {}", self.device);
        self.audit.record(
            AuditEventType::DeviceUnlocked,
            &self.device,
            [("one_time_prekeys", one_time.len().to_string())],
        );

        *self.state.write() = Some(Arc::new(Unlocked {
            sealed,
            identity,
            inventory: Mutex::new(Inventory {
                current,
                prior,
                one_time,
                meta,
            }),
        }));
        Ok(public)
    }

    /// Drop all private key material from memory
    pub fn lock(&self) {
        if self.state.write().take().is_some() {
            tracing::info!("Locked E2EE keys for device {}", self.device);
        }
    }

    // ========================================================================
    // IDENTITY
    // ========================================================================

    /// The public identity key
    pub fn identity_key(&self) -> Result<IdentityKey> {
        Ok(self.unlocked()?.identity.public_key())
    }

    /// Registration id published in bundles
    pub fn registration_id(&self) -> Result<RegistrationId> {
        Ok(RegistrationId(
            self.unlocked()?.inventory.lock().meta.registration_id,
        ))
    }

    /// Run `f` with the private identity key
    pub(crate) fn with_identity<R>(&self, f: impl FnOnce(&IdentityKeyPair) -> R) -> Result<R> {
        let unlocked = self.unlocked()?;
        Ok(f(&unlocked.identity))
    }

    /// Sealed store handle for other components writing under this device
    pub(crate) fn sealed_store(&self) -> Result<SealedStore> {
        Ok(self.unlocked()?.sealed.clone())
    }

    // ========================================================================
    // SIGNED PREKEYS
    // ========================================================================

    /// Public half of the current signed prekey
    pub fn current_signed_prekey(&self) -> Result<SignedPreKeyPublic> {
        Ok(self.unlocked()?.inventory.lock().current.public())
    }

    /// Ids of signed prekeys still held (current first)
    pub fn signed_prekey_ids(&self) -> Result<Vec<u32>> {
        let unlocked = self.unlocked()?;
        let inv = unlocked.inventory.lock();
        let mut ids = vec![inv.current.id];
        ids.extend(inv.prior.as_ref().map(|p| p.id));
        Ok(ids)
    }

    /// Private signed prekey by id (current or prior)
    pub fn signed_prekey_secret(&self, id: u32) -> Result<EncryptionKeyPair> {
        let unlocked = self.unlocked()?;
        let inv = unlocked.inventory.lock();
        if inv.current.id == id {
            return Ok(inv.current.key_pair());
        }
        match &inv.prior {
            Some(prior) if prior.id == id => Ok(prior.key_pair()),
            _ => Err(Error::UnknownSignedPreKey(id)),
        }
    }

    /// Generate and sign a new signed prekey
    ///
    /// The previous key becomes the prior key and is kept for the grace
    /// window; an older prior key is deleted immediately.
    pub fn rotate_signed_prekey(&self) -> Result<u32> {
        let unlocked = self.unlocked()?;
        let mut inv = unlocked.inventory.lock();
        let now = self.clock.now_millis();

        let id = inv.meta.next_signed_prekey_id;
        let next = SignedPreKeyRecord::generate(id, &unlocked.identity.signing, now);
        let mut prior = inv.current.clone();
        let retire_at = now + (self.config.signed_prekey_grace_secs as i64) * 1000;
        prior.retire_at = Some(retire_at);
        let mut meta = inv.meta.clone();
        meta.next_signed_prekey_id = id.wrapping_add(1).max(1);

        let sealed = &unlocked.sealed;
        sealed.put(RecordKind::SignedPreKey, keys::SIGNED_PREKEY_PRIOR, &prior)?;
        sealed.put(RecordKind::SignedPreKey, keys::SIGNED_PREKEY_CURRENT, &next)?;
        sealed.put(RecordKind::Counters, keys::COUNTERS, &meta)?;

        let previous_id = prior.id;
        let dropped = inv.prior.replace(prior).map(|p| p.id);
        inv.current = next;
        inv.meta = meta;
        drop(inv);

        tracing::info!(
            "Rotated signed prekey {} -> {} on device {}",
            previous_id,
            id,
            self.device
        );
        if let Some(dropped) = dropped {
            tracing::debug!("Dropped signed prekey {} before its grace window ended", dropped);
        }
        self.audit.record(
            AuditEventType::SignedPreKeyRotated,
            &self.device,
            [
                ("signed_prekey_id", id.to_string()),
                ("previous_id", previous_id.to_string()),
                ("retire_at", retire_at.to_string()),
            ],
        );
        Ok(id)
    }

    /// Rotate if the current signed prekey is older than the rotation interval
    pub fn rotate_signed_prekey_if_due(&self) -> Result<Option<u32>> {
        let created_at = self.unlocked()?.inventory.lock().current.created_at;
        let age = self.clock.now_millis() - created_at;
        if age >= (self.config.signed_prekey_rotation_secs as i64) * 1000 {
            self.rotate_signed_prekey().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Delete the prior signed prekey once its grace window has passed
    pub fn purge_expired_signed_prekeys(&self) -> Result<Option<u32>> {
        let unlocked = self.unlocked()?;
        let mut inv = unlocked.inventory.lock();
        let now = self.clock.now_millis();

        let expired = matches!(&inv.prior, Some(p) if p.retire_at.map_or(true, |t| t <= now));
        if !expired {
            return Ok(None);
        }

        unlocked.sealed.delete(keys::SIGNED_PREKEY_PRIOR)?;
        let id = inv.prior.take().map(|p| p.id);
        drop(inv);

        if let Some(id) = id {
            tracing::info!("Purged signed prekey {} on device {}", id, self.device);
            self.audit.record(
                AuditEventType::SignedPreKeyPurged,
                &self.device,
                [("signed_prekey_id", id.to_string())],
            );
        }
        Ok(id)
    }

    // ========================================================================
    // ONE-TIME PREKEYS
    // ========================================================================

    /// Ids in the published pool (not yet handed out)
    pub fn published_one_time_prekey_ids(&self) -> Result<Vec<u32>> {
        let unlocked = self.unlocked()?;
        let inv = unlocked.inventory.lock();
        Ok(inv
            .one_time
            .keys()
            .filter(|id| !inv.meta.reserved.contains(id))
            .copied()
            .collect())
    }

    /// Size of the published pool
    pub fn published_one_time_prekey_count(&self) -> Result<usize> {
        Ok(self.unlocked()?.inventory.lock().published_count())
    }

    /// Total one-time prekeys held, published or reserved
    pub fn one_time_prekey_count(&self) -> Result<usize> {
        Ok(self.unlocked()?.inventory.lock().one_time.len())
    }

    /// Move the oldest published one-time prekey into the reserved set
    ///
    /// Returns `None` when the published pool is empty; the bundle then
    /// carries no one-time prekey.
    pub fn reserve_one_time_prekey(&self) -> Result<Option<OneTimePreKeyPublic>> {
        let unlocked = self.unlocked()?;
        let mut inv = unlocked.inventory.lock();

        let Some(record) = inv
            .one_time
            .values()
            .find(|r| !inv.meta.reserved.contains(&r.id))
            .map(|r| r.public())
        else {
            return Ok(None);
        };

        let mut meta = inv.meta.clone();
        meta.reserved.insert(record.id);
        self.commit_reservations(&unlocked, &mut inv, meta)?;
        Ok(Some(record))
    }

    /// Drop the oldest reservations beyond `max_reserved`
    ///
    /// Only needed after `max_reserved` was lowered; reserving already
    /// keeps the set within bounds.
    pub fn evict_excess_reservations(&self) -> Result<usize> {
        let unlocked = self.unlocked()?;
        let mut inv = unlocked.inventory.lock();
        if inv.meta.reserved.len() <= self.config.max_reserved {
            return Ok(0);
        }
        let meta = inv.meta.clone();
        Ok(self.commit_reservations(&unlocked, &mut inv, meta)?.len())
    }

    /// Store `meta` after trimming its reserved set to `max_reserved`
    ///
    /// Reservations are taken lowest id first, so the lowest reserved ids
    /// are the oldest. Their records are deleted before the counters are
    /// written; `open` drops reservations whose record is gone.
    fn commit_reservations(
        &self,
        unlocked: &Unlocked,
        inv: &mut Inventory,
        mut meta: InventoryMeta,
    ) -> Result<Vec<u32>> {
        let excess = meta.reserved.len().saturating_sub(self.config.max_reserved);
        let evicted: Vec<u32> = meta.reserved.iter().take(excess).copied().collect();
        for id in &evicted {
            unlocked.sealed.delete(&keys::one_time_prekey(*id))?;
            meta.reserved.remove(id);
        }
        unlocked.sealed.put(RecordKind::Counters, keys::COUNTERS, &meta)?;
        for id in &evicted {
            inv.one_time.remove(id);
        }
        inv.meta = meta;

        if !evicted.is_empty() {
            tracing::warn!(
                "Evicted {} reserved one-time prekeys on device {} (limit {})",
                evicted.len(),
                self.device,
                self.config.max_reserved
            );
            self.audit.record(
                AuditEventType::OneTimePreKeysEvicted,
                &self.device,
                [
                    ("evicted", evicted.len().to_string()),
                    ("reserved", inv.meta.reserved.len().to_string()),
                ],
            );
        }
        Ok(evicted)
    }

    /// Private one-time prekey by id, without consuming it
    pub fn one_time_prekey_secret(&self, id: u32) -> Result<EncryptionKeyPair> {
        let unlocked = self.unlocked()?;
        let inv = unlocked.inventory.lock();
        inv.one_time
            .get(&id)
            .map(|r| r.key_pair())
            .ok_or(Error::UnknownOneTimePreKey(id))
    }

    /// Atomically remove a one-time prekey and return its private key
    ///
    /// Fails with `PreKeyExhausted` if no one-time prekeys are held at all,
    /// and with `UnknownOneTimePreKey` if this id was already consumed.
    pub fn consume_one_time_prekey(&self, id: u32) -> Result<EncryptionKeyPair> {
        let unlocked = self.unlocked()?;
        let mut inv = unlocked.inventory.lock();

        if inv.one_time.is_empty() {
            return Err(Error::PreKeyExhausted);
        }
        if !inv.one_time.contains_key(&id) {
            return Err(Error::UnknownOneTimePreKey(id));
        }

        unlocked.sealed.delete(&keys::one_time_prekey(id))?;
        let record = inv
            .one_time
            .remove(&id)
            .ok_or(Error::UnknownOneTimePreKey(id))?;
        if inv.meta.reserved.remove(&id) {
            let meta = inv.meta.clone();
            // The key itself is already gone; a stale reservation is dropped on next open
            if let Err(e) = unlocked.sealed.put(RecordKind::Counters, keys::COUNTERS, &meta) {
                tracing::warn!("Failed to persist reservation release for prekey {}: {}", id, e);
            }
        }
        let remaining = inv.one_time.len();
        drop(inv);

        tracing::debug!("Consumed one-time prekey {} ({} left)", id, remaining);
        self.audit.record(
            AuditEventType::OneTimePreKeyConsumed,
            &self.device,
            [("one_time_prekey_id", id.to_string()), ("remaining", remaining.to_string())],
        );
        Ok(record.key_pair())
    }

    /// Generate enough one-time prekeys to bring the published pool to `target`
    ///
    /// Idempotent: a pool already at or above `target` is left unchanged.
    pub fn replenish_one_time_prekeys(&self, target: usize) -> Result<usize> {
        let need = target.saturating_sub(self.published_one_time_prekey_count()?);
        let generated: Vec<EncryptionKeyPair> = (0..need).map(|_| EncryptionKeyPair::generate()).collect();
        self.commit_one_time_prekeys(generated, target)
    }

    /// Replenish if the published pool is below the low-water mark
    pub fn replenish_if_below_low_water(&self) -> Result<usize> {
        if self.published_one_time_prekey_count()? < self.config.one_time_low_water {
            self.replenish_one_time_prekeys(self.config.one_time_batch_size)
        } else {
            Ok(0)
        }
    }

    /// Like [`Self::replenish_one_time_prekeys`], but generates off-thread
    ///
    /// Nothing is written until generation finishes; cancelling through
    /// `cancel` before then leaves the pool untouched.
    pub async fn replenish_one_time_prekeys_cancellable(
        &self,
        target: usize,
        cancel: CancellationToken,
    ) -> Result<usize> {
        let need = target.saturating_sub(self.published_one_time_prekey_count()?);
        if need == 0 {
            return Ok(0);
        }

        let task = tokio::task::spawn_blocking(move || {
            (0..need).map(|_| EncryptionKeyPair::generate()).collect::<Vec<_>>()
        });
        let generated = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("one-time prekey replenishment".into()));
            }
            generated = task => generated?,
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("one-time prekey replenishment".into()));
        }
        self.commit_one_time_prekeys(generated, target)
    }

    fn commit_one_time_prekeys(&self, generated: Vec<EncryptionKeyPair>, target: usize) -> Result<usize> {
        let unlocked = self.unlocked()?;
        let mut inv = unlocked.inventory.lock();

        // Another caller may have replenished while keys were generated
        let need = target.saturating_sub(inv.published_count()).min(generated.len());
        if need == 0 {
            return Ok(0);
        }

        let mut meta = inv.meta.clone();
        let mut records = Vec::with_capacity(need);
        for pair in generated.iter().take(need) {
            let id = meta.next_one_time_prekey_id;
            meta.next_one_time_prekey_id = id.wrapping_add(1).max(1);
            let record = OneTimePreKeyRecord::from_key_pair(id, pair);
            unlocked
                .sealed
                .put(RecordKind::OneTimePreKey, &keys::one_time_prekey(id), &record)?;
            records.push(record);
        }
        unlocked.sealed.put(RecordKind::Counters, keys::COUNTERS, &meta)?;

        for record in records {
            inv.one_time.insert(record.id, record);
        }
        inv.meta = meta;
        let pool = inv.published_count();
        drop(inv);

        tracing::info!(
            "Replenished {} one-time prekeys on device {} (published pool {})",
            need,
            self.device,
            pool
        );
        self.audit.record(
            AuditEventType::OneTimePreKeysReplenished,
            &self.device,
            [("generated", need.to_string()), ("published", pool.to_string())],
        );
        Ok(need)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Rotate, purge, replenish and trim reservations as the policy requires
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        Ok(MaintenanceReport {
            rotated_signed_prekey: self.rotate_signed_prekey_if_due()?,
            purged_signed_prekey: self.purge_expired_signed_prekeys()?,
            replenished: self.replenish_if_below_low_water()?,
            evicted_reservations: self.evict_excess_reservations()?,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyStore;
    use crate::time::ManualClock;

    const DAY: u64 = 24 * 60 * 60;

    struct Fixture {
        store: Arc<MemoryKeyStore>,
        audit: Arc<AuditLog>,
        clock: Arc<ManualClock>,
        manager: KeyManager,
    }

    fn fixture_with(config: PreKeyConfig) -> Fixture {
        let store = Arc::new(MemoryKeyStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let audit = Arc::new(AuditLog::with_clock(clock.clone()));
        let manager = KeyManager::new(
            DeviceId::new("alice-phone"),
            store.clone(),
            config,
            audit.clone(),
            clock.clone(),
        );
        Fixture {
            store,
            audit,
            clock,
            manager,
        }
    }

    fn small_config() -> PreKeyConfig {
        PreKeyConfig {
            one_time_low_water: 2,
            one_time_batch_size: 5,
            ..PreKeyConfig::default()
        }
    }

    fn master() -> MasterKey {
        MasterKey::from_bytes([7u8; 32])
    }

    #[test]
    fn test_initialize_device() {
        let f = fixture_with(small_config());
        assert!(matches!(f.manager.identity_key(), Err(Error::Locked)));

        let identity = f.manager.initialize_device(&master()).unwrap();
        assert_eq!(f.manager.identity_key().unwrap(), identity);
        assert_eq!(f.manager.published_one_time_prekey_count().unwrap(), 5);
        assert_eq!(f.store.list_one_time_prekey_ids(&DeviceId::new("alice-phone")).unwrap().len(), 5);
        assert!(f.manager.current_signed_prekey().unwrap().verify(&identity).is_ok());
        assert_eq!(f.audit.count(AuditEventType::DeviceInitialized), 1);

        assert!(matches!(
            f.manager.initialize_device(&master()),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_already_initialized_after_restart() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();
        f.manager.lock();

        let fresh = KeyManager::new(
            DeviceId::new("alice-phone"),
            f.store.clone(),
            small_config(),
            f.audit.clone(),
            f.clock.clone(),
        );
        assert!(matches!(
            fresh.initialize_device(&master()),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_open_restores_inventory() {
        let f = fixture_with(small_config());
        let identity = f.manager.initialize_device(&master()).unwrap();
        let reserved = f.manager.reserve_one_time_prekey().unwrap().unwrap();
        f.manager.lock();
        assert!(!f.manager.is_unlocked());

        assert_eq!(f.manager.open(&master()).unwrap(), identity);
        assert_eq!(f.manager.one_time_prekey_count().unwrap(), 5);
        assert!(!f
            .manager
            .published_one_time_prekey_ids()
            .unwrap()
            .contains(&reserved.id));
    }

    #[test]
    fn test_open_wrong_master_key_fails() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();
        f.manager.lock();

        assert!(matches!(
            f.manager.open(&MasterKey::from_bytes([8u8; 32])),
            Err(Error::AuthenticationFailure)
        ));
        assert!(!f.manager.is_unlocked());
    }

    #[test]
    fn test_open_uninitialized() {
        let f = fixture_with(small_config());
        assert!(matches!(f.manager.open(&master()), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_private_keys_never_stored_in_plaintext() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();
        let dev = DeviceId::new("alice-phone");

        let secret = f.manager.signed_prekey_secret(1).unwrap().secret_bytes();
        let raw = f.store.raw(&dev, keys::SIGNED_PREKEY_CURRENT).unwrap();
        assert!(!raw.windows(32).any(|w| w == &secret[..]));

        let identity_secret = f.manager.with_identity(|id| id.secret_bytes()).unwrap();
        let raw = f.store.raw(&dev, keys::IDENTITY).unwrap();
        assert!(!raw.windows(32).any(|w| w == &identity_secret[..32]));
    }

    #[test]
    fn test_signed_prekey_rotation_and_grace() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();

        assert_eq!(f.manager.rotate_signed_prekey_if_due().unwrap(), None);
        f.clock.advance_secs(7 * DAY);
        assert_eq!(f.manager.rotate_signed_prekey_if_due().unwrap(), Some(2));
        assert_eq!(f.manager.current_signed_prekey().unwrap().id, 2);

        // Prior key still usable during the grace window
        assert!(f.manager.signed_prekey_secret(1).is_ok());
        assert_eq!(f.manager.purge_expired_signed_prekeys().unwrap(), None);

        f.clock.advance_secs(2 * DAY);
        assert_eq!(f.manager.purge_expired_signed_prekeys().unwrap(), Some(1));
        assert!(matches!(
            f.manager.signed_prekey_secret(1),
            Err(Error::UnknownSignedPreKey(1))
        ));
        assert_eq!(f.audit.count(AuditEventType::SignedPreKeyRotated), 1);
        assert_eq!(f.audit.count(AuditEventType::SignedPreKeyPurged), 1);
    }

    #[test]
    fn test_at_most_one_prior_signed_prekey() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();

        f.manager.rotate_signed_prekey().unwrap();
        f.manager.rotate_signed_prekey().unwrap();
        assert_eq!(f.manager.signed_prekey_ids().unwrap(), vec![3, 2]);
        assert!(f.manager.signed_prekey_secret(1).is_err());
    }

    #[test]
    fn test_replenish_is_idempotent() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();

        assert_eq!(f.manager.replenish_one_time_prekeys(5).unwrap(), 0);
        assert_eq!(f.manager.replenish_one_time_prekeys(8).unwrap(), 3);
        assert_eq!(f.manager.replenish_one_time_prekeys(8).unwrap(), 0);
        assert_eq!(f.manager.published_one_time_prekey_count().unwrap(), 8);

        let ids = f.manager.published_one_time_prekey_ids().unwrap();
        assert_eq!(ids, (1..=8).collect::<Vec<u32>>());
    }

    #[test]
    fn test_low_water_replenishment() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();

        for _ in 0..3 {
            f.manager.reserve_one_time_prekey().unwrap();
        }
        assert_eq!(f.manager.replenish_if_below_low_water().unwrap(), 0);

        f.manager.reserve_one_time_prekey().unwrap();
        assert_eq!(f.manager.published_one_time_prekey_count().unwrap(), 1);
        assert_eq!(f.manager.replenish_if_below_low_water().unwrap(), 4);
        assert_eq!(f.manager.published_one_time_prekey_count().unwrap(), 5);
    }

    #[test]
    fn test_consume_semantics() {
        let f = fixture_with(PreKeyConfig {
            one_time_low_water: 1,
            one_time_batch_size: 2,
            ..PreKeyConfig::default()
        });
        f.manager.initialize_device(&master()).unwrap();

        let peek = f.manager.one_time_prekey_secret(1).unwrap().public_bytes();
        assert_eq!(f.manager.consume_one_time_prekey(1).unwrap().public_bytes(), peek);
        assert!(matches!(
            f.manager.consume_one_time_prekey(1),
            Err(Error::UnknownOneTimePreKey(1))
        ));
        f.manager.consume_one_time_prekey(2).unwrap();
        assert!(matches!(
            f.manager.consume_one_time_prekey(3),
            Err(Error::PreKeyExhausted)
        ));
        assert!(f.manager.reserve_one_time_prekey().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_consume_never_double_spends() {
        const POOL: usize = 8;
        const CALLERS: usize = 32;

        let f = fixture_with(PreKeyConfig {
            one_time_low_water: 1,
            one_time_batch_size: POOL,
            ..PreKeyConfig::default()
        });
        f.manager.initialize_device(&master()).unwrap();
        let manager = &f.manager;

        let results: Vec<Option<(u32, [u8; 32])>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|i| {
                    s.spawn(move || {
                        let id = (i % POOL) as u32 + 1;
                        manager
                            .consume_one_time_prekey(id)
                            .ok()
                            .map(|pair| (id, pair.public_bytes()))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<_> = results.into_iter().flatten().collect();
        assert_eq!(winners.len(), POOL);
        let unique: BTreeSet<u32> = winners.iter().map(|(id, _)| *id).collect();
        assert_eq!(unique.len(), POOL);
        assert_eq!(f.manager.one_time_prekey_count().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_reserve_hands_out_each_key_once() {
        const POOL: usize = 10;
        let f = fixture_with(PreKeyConfig {
            one_time_low_water: 1,
            one_time_batch_size: POOL,
            ..PreKeyConfig::default()
        });
        f.manager.initialize_device(&master()).unwrap();
        let manager = &f.manager;

        let reserved: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..25)
                .map(|_| s.spawn(move || manager.reserve_one_time_prekey().unwrap().map(|k| k.id)))
                .collect();
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(reserved.len(), POOL);
        assert_eq!(reserved.iter().collect::<BTreeSet<_>>().len(), POOL);
    }

    #[test]
    fn test_failed_write_leaves_pool_intact() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();

        f.store.set_read_only(true);
        assert!(matches!(
            f.manager.consume_one_time_prekey(1),
            Err(Error::StorageWriteError(_))
        ));
        f.store.set_read_only(false);
        assert!(f.manager.consume_one_time_prekey(1).is_ok());
    }

    #[tokio::test]
    async fn test_cancellable_replenish() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            f.manager.replenish_one_time_prekeys_cancellable(20, cancel).await,
            Err(Error::Cancelled(_))
        ));
        assert_eq!(f.manager.published_one_time_prekey_count().unwrap(), 5);

        let generated = f
            .manager
            .replenish_one_time_prekeys_cancellable(20, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(generated, 15);
        assert_eq!(f.manager.published_one_time_prekey_count().unwrap(), 20);
    }

    #[test]
    fn test_concurrent_initialize_creates_one_identity() {
        let f = fixture_with(small_config());
        let manager = &f.manager;

        let results: Vec<Result<IdentityKey>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(move || manager.initialize_device(&master())))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(Error::AlreadyInitialized))));
        assert_eq!(f.audit.count(AuditEventType::DeviceInitialized), 1);

        let winner = winners[0].clone();
        f.manager.lock();
        assert_eq!(f.manager.open(&master()).unwrap(), winner);
        assert_eq!(f.manager.one_time_prekey_count().unwrap(), 5);
    }

    #[test]
    fn test_retry_after_failed_initialize() {
        let f = fixture_with(small_config());
        f.store.fail_writes_under(Some(keys::IDENTITY));
        assert!(matches!(
            f.manager.initialize_device(&master()),
            Err(Error::StorageWriteError(_))
        ));
        assert!(!f.manager.is_unlocked());
        f.store.fail_writes_under(None);

        let identity = f.manager.initialize_device(&master()).unwrap();
        f.manager.lock();
        assert_eq!(f.manager.open(&master()).unwrap(), identity);
        assert_eq!(f.manager.one_time_prekey_count().unwrap(), 5);
    }

    #[test]
    fn test_reservations_stay_bounded() {
        let f = fixture_with(PreKeyConfig {
            max_reserved: 3,
            ..small_config()
        });
        f.manager.initialize_device(&master()).unwrap();

        for _ in 0..50 {
            assert!(f.manager.reserve_one_time_prekey().unwrap().is_some());
            f.manager.replenish_if_below_low_water().unwrap();

            let total = f.manager.one_time_prekey_count().unwrap();
            let published = f.manager.published_one_time_prekey_count().unwrap();
            assert!(total - published <= 3);
            assert!(total <= 5 + 3);
        }
        assert!(f.audit.count(AuditEventType::OneTimePreKeysEvicted) > 0);
        assert!(matches!(
            f.manager.consume_one_time_prekey(1),
            Err(Error::UnknownOneTimePreKey(1))
        ));

        f.manager.lock();
        f.manager.open(&master()).unwrap();
        let total = f.manager.one_time_prekey_count().unwrap();
        assert_eq!(total - f.manager.published_one_time_prekey_count().unwrap(), 3);
        assert_eq!(f.store.list_one_time_prekey_ids(&DeviceId::new("alice-phone")).unwrap().len(), total);
    }

    #[test]
    fn test_maintenance_trims_after_limit_lowered() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();
        for _ in 0..4 {
            f.manager.reserve_one_time_prekey().unwrap();
        }

        let stricter = KeyManager::new(
            DeviceId::new("alice-phone"),
            f.store.clone(),
            PreKeyConfig {
                max_reserved: 1,
                ..small_config()
            },
            f.audit.clone(),
            f.clock.clone(),
        );
        stricter.open(&master()).unwrap();

        let report = stricter.run_maintenance().unwrap();
        assert_eq!(report.evicted_reservations, 3);
        let total = stricter.one_time_prekey_count().unwrap();
        assert_eq!(total - stricter.published_one_time_prekey_count().unwrap(), 1);
        assert_eq!(stricter.run_maintenance().unwrap().evicted_reservations, 0);
    }

    #[test]
    fn test_run_maintenance() {
        let f = fixture_with(small_config());
        f.manager.initialize_device(&master()).unwrap();
        for _ in 0..4 {
            f.manager.reserve_one_time_prekey().unwrap();
        }
        f.clock.advance_secs(8 * DAY);

        let report = f.manager.run_maintenance().unwrap();
        assert_eq!(report.rotated_signed_prekey, Some(2));
        assert_eq!(report.purged_signed_prekey, None);
        assert_eq!(report.replenished, 4);
        assert_eq!(report.evicted_reservations, 0);
    }
}
