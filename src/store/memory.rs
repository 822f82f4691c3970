//! In-memory [`KeyStore`] for tests and embedders without durable storage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{keys, KeyStore};
use crate::device::DeviceId;
use crate::error::{Error, Result};

/// Key store backed by a map
#[derive(Default)]
pub struct MemoryKeyStore {
    records: RwLock<BTreeMap<(DeviceId, String), Vec<u8>>>,
    read_only: AtomicBool,
    failing_prefix: RwLock<Option<String>>,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StorageWriteError`
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Make writes to keys starting with `prefix` fail; `None` heals the store
    pub fn fail_writes_under(&self, prefix: Option<&str>) {
        *self.failing_prefix.write() = prefix.map(str::to_string);
    }

    /// Number of records held for a device
    pub fn record_count(&self, device: &DeviceId) -> usize {
        self.records
            .read()
            .keys()
            .filter(|(d, _)| d == device)
            .count()
    }

    /// Raw record bytes, for inspecting what actually reaches storage
    pub fn raw(&self, device: &DeviceId, key_id: &str) -> Option<Vec<u8>> {
        self.records
            .read()
            .get(&(device.clone(), key_id.to_string()))
            .cloned()
    }

    fn check_writable(&self, key_id: &str) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::StorageWriteError("store is read-only".into()));
        }
        if let Some(prefix) = self.failing_prefix.read().as_deref() {
            if key_id.starts_with(prefix) {
                return Err(Error::StorageWriteError(format!("write to {} failed", key_id)));
            }
        }
        Ok(())
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, device: &DeviceId, key_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.raw(device, key_id))
    }

    fn put(&self, device: &DeviceId, key_id: &str, value: &[u8]) -> Result<()> {
        self.check_writable(key_id)?;
        self.records
            .write()
            .insert((device.clone(), key_id.to_string()), value.to_vec());
        Ok(())
    }

    fn delete(&self, device: &DeviceId, key_id: &str) -> Result<bool> {
        self.check_writable(key_id)?;
        Ok(self
            .records
            .write()
            .remove(&(device.clone(), key_id.to_string()))
            .is_some())
    }

    fn list_one_time_prekey_ids(&self, device: &DeviceId) -> Result<Vec<u32>> {
        let records = self.records.read();
        let mut ids: Vec<u32> = records
            .keys()
            .filter(|(d, _)| d == device)
            .filter_map(|(_, k)| keys::parse_one_time_prekey_id(k))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
