//! # Sealed Records
//!
//! Every value this crate persists is wrapped in an authenticated,
//! versioned envelope before it reaches a [`KeyStore`].
//!
//! ## Record Format
//!
//! ```text
//! ┌──────────┬─────────┬──────┬──────────────┬──────────────────────────────┐
//! │ "UE2E"   │ version │ kind │ nonce        │ AES-256-GCM ciphertext ‖ tag │
//! │ 4 bytes  │ 1 byte  │ 1 B  │ 12 bytes     │ variable                     │
//! └──────────┴─────────┴──────┴──────────────┴──────────────────────────────┘
//!
//! AAD = header (6 bytes) ‖ device id ‖ 0x00 ‖ record key
//! ```
//!
//! Binding the device id and record key into the AAD stops a record from
//! being replayed under another name (for example, copying an old signed
//! prekey over the current one).

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use zeroize::Zeroizing;

use super::KeyStore;
use crate::crypto::{decrypt, encrypt, EncryptionKey, MasterKey, Nonce, NONCE_SIZE, TAG_SIZE};
use crate::device::DeviceId;
use crate::error::{Error, Result};

/// Record magic bytes
pub const RECORD_MAGIC: &[u8; 4] = b"UE2E";

/// Current record format version
pub const RECORD_VERSION: u8 = 1;

const HEADER_LEN: usize = 6;

/// What a sealed record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Identity keypair
    Identity = 1,
    /// Signed prekey (current or prior)
    SignedPreKey = 2,
    /// One-time prekey
    OneTimePreKey = 3,
    /// Id counters
    Counters = 4,
    /// Session state with one peer device
    Session = 5,
    /// Trust decision about one peer device
    Trust = 6,
    /// MasterKey wrapped under a password or recovery code
    WrappedMasterKey = 7,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Identity,
            2 => Self::SignedPreKey,
            3 => Self::OneTimePreKey,
            4 => Self::Counters,
            5 => Self::Session,
            6 => Self::Trust,
            7 => Self::WrappedMasterKey,
            _ => return None,
        })
    }
}

fn header(kind: RecordKind) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(RECORD_MAGIC);
    h[4] = RECORD_VERSION;
    h[5] = kind as u8;
    h
}

fn associated_data(header: &[u8], device: &DeviceId, key_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + device.as_bytes().len() + 1 + key_id.len());
    aad.extend_from_slice(header);
    aad.extend_from_slice(device.as_bytes());
    aad.push(0);
    aad.extend_from_slice(key_id.as_bytes());
    aad
}

/// Seal `plaintext` into a record
pub fn seal(
    key: &EncryptionKey,
    kind: RecordKind,
    device: &DeviceId,
    key_id: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let header = header(kind);
    let (nonce, ciphertext) = encrypt(key, plaintext, &associated_data(&header, device, key_id))?;

    let mut record = Vec::with_capacity(HEADER_LEN + NONCE_SIZE + ciphertext.len());
    record.extend_from_slice(&header);
    record.extend_from_slice(nonce.as_bytes());
    record.extend_from_slice(&ciphertext);
    Ok(record)
}

/// Open a record sealed by [`seal`]
///
/// Structural problems are `StorageCorrupted`, an unknown version is
/// `UnsupportedRecordVersion`, and a wrong key or tampered bytes are
/// `AuthenticationFailure`.
pub fn open(
    key: &EncryptionKey,
    kind: RecordKind,
    device: &DeviceId,
    key_id: &str,
    record: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if record.len() < HEADER_LEN + NONCE_SIZE + TAG_SIZE {
        return Err(Error::StorageCorrupted(format!("record {} is truncated", key_id)));
    }
    if &record[..4] != RECORD_MAGIC {
        return Err(Error::StorageCorrupted(format!("record {} has bad magic", key_id)));
    }
    if record[4] != RECORD_VERSION {
        return Err(Error::UnsupportedRecordVersion(record[4]));
    }
    if RecordKind::from_u8(record[5]) != Some(kind) {
        return Err(Error::StorageCorrupted(format!(
            "record {} holds kind {}, expected {:?}",
            key_id, record[5], kind
        )));
    }

    let nonce = Nonce::from_slice(&record[HEADER_LEN..HEADER_LEN + NONCE_SIZE])?;
    let aad = associated_data(&record[..HEADER_LEN], device, key_id);
    let plaintext = decrypt(key, &nonce, &record[HEADER_LEN + NONCE_SIZE..], &aad)?;
    Ok(Zeroizing::new(plaintext))
}

/// A device's view of a [`KeyStore`] that seals and opens typed records
#[derive(Clone)]
pub struct SealedStore {
    store: Arc<dyn KeyStore>,
    device: DeviceId,
    key: EncryptionKey,
}

impl SealedStore {
    /// Bind a store to a device and an unlocked MasterKey
    pub fn new(store: Arc<dyn KeyStore>, device: DeviceId, master: &MasterKey) -> Result<Self> {
        Ok(Self {
            store,
            device,
            key: master.storage_key()?,
        })
    }

    /// The device whose records this handle reads and writes
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// The underlying raw store
    pub fn raw(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// Serialize, seal and write a record
    pub fn put<T: Serialize>(&self, kind: RecordKind, key_id: &str, value: &T) -> Result<()> {
        let plaintext = Zeroizing::new(bincode::serialize(value)?);
        let record = seal(&self.key, kind, &self.device, key_id, &plaintext)?;
        self.store.put(&self.device, key_id, &record)
    }

    /// Read, open and deserialize a record
    pub fn get<T: DeserializeOwned>(&self, kind: RecordKind, key_id: &str) -> Result<Option<T>> {
        let Some(record) = self.store.get(&self.device, key_id)? else {
            return Ok(None);
        };
        let plaintext = open(&self.key, kind, &self.device, key_id, &record)?;
        let value = bincode::deserialize(&plaintext)
            .map_err(|e| Error::DeserializationError(format!("{}: {}", key_id, e)))?;
        Ok(Some(value))
    }

    /// Remove a record
    pub fn delete(&self, key_id: &str) -> Result<bool> {
        self.store.delete(&self.device, key_id)
    }

    /// Check whether a record exists without opening it
    pub fn exists(&self, key_id: &str) -> Result<bool> {
        Ok(self.store.get(&self.device, key_id)?.is_some())
    }

    /// One-time prekey ids held in the store
    pub fn list_one_time_prekey_ids(&self) -> Result<Vec<u32>> {
        self.store.list_one_time_prekey_ids(&self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyStore;

    fn key() -> EncryptionKey {
        EncryptionKey::from_bytes([5u8; 32])
    }

    #[test]
    fn test_seal_open() {
        let dev = DeviceId::new("phone");
        let record = seal(&key(), RecordKind::Identity, &dev, "identity", b"secret").unwrap();
        assert_eq!(&record[..4], RECORD_MAGIC);
        assert_eq!(record[4], RECORD_VERSION);

        let opened = open(&key(), RecordKind::Identity, &dev, "identity", &record).unwrap();
        assert_eq!(opened.as_slice(), b"secret");
    }

    #[test]
    fn test_record_bound_to_name_and_device() {
        let dev = DeviceId::new("phone");
        let record = seal(&key(), RecordKind::SignedPreKey, &dev, "signed_prekey/prior", b"k").unwrap();

        assert!(matches!(
            open(&key(), RecordKind::SignedPreKey, &dev, "signed_prekey/current", &record),
            Err(Error::AuthenticationFailure)
        ));
        assert!(open(&key(), RecordKind::SignedPreKey, &DeviceId::new("tablet"), "signed_prekey/prior", &record).is_err());
    }

    #[test]
    fn test_header_checks() {
        let dev = DeviceId::new("phone");
        let mut record = seal(&key(), RecordKind::Session, &dev, "s", b"state").unwrap();

        assert!(matches!(
            open(&key(), RecordKind::Trust, &dev, "s", &record),
            Err(Error::StorageCorrupted(_))
        ));

        record[4] = 9;
        assert!(matches!(
            open(&key(), RecordKind::Session, &dev, "s", &record),
            Err(Error::UnsupportedRecordVersion(9))
        ));

        assert!(matches!(
            open(&key(), RecordKind::Session, &dev, "s", &record[..10]),
            Err(Error::StorageCorrupted(_))
        ));
    }

    #[test]
    fn test_sealed_store_never_writes_plaintext() {
        let raw = Arc::new(MemoryKeyStore::new());
        let dev = DeviceId::new("phone");
        let master = MasterKey::from_bytes([1u8; 32]);
        let sealed = SealedStore::new(raw.clone(), dev.clone(), &master).unwrap();

        let value = String::from("very secret value");
        sealed.put(RecordKind::Counters, "counters", &value).unwrap();

        let bytes = raw.raw(&dev, "counters").unwrap();
        assert!(!bytes.windows(value.len()).any(|w| w == value.as_bytes()));

        let back: String = sealed.get(RecordKind::Counters, "counters").unwrap().unwrap();
        assert_eq!(back, value);

        let other = SealedStore::new(raw, dev, &MasterKey::from_bytes([2u8; 32])).unwrap();
        assert!(other.get::<String>(RecordKind::Counters, "counters").is_err());
    }
}
