//! # Recovery Manager
//!
//! Creates the MasterKey and keeps two independent ways of getting it back.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         MASTER KEY WRAPPING                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  setup(password)                                                       │
//! │    stretched = Argon2id(password, salt)           (blocking worker)    │
//! │    MasterKey = HKDF(stretched, "master-key")      (never rotated)      │
//! │                                                                         │
//! │  recovery/password  ◄── seal(HKDF(stretched, "password-wrap"), MK)     │
//! │                         + salt and Argon2 parameters in the clear      │
//! │                                                                         │
//! │  recovery/code      ◄── seal(HKDF(BIP39 seed, "recovery-code"), MK)    │
//! │                         24-word code, shown to the user once           │
//! │                                                                         │
//! │  change_password rewraps under the new password; the MasterKey and     │
//! │  everything sealed under it stay as they are.                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Argon2 runs on `spawn_blocking`. A caller can abandon it through a
//! `CancellationToken`; nothing is written until every derivation finished.

use std::fmt;
use std::sync::Arc;

use bip39::Mnemonic;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::audit::{AuditEventType, AuditLog};
use crate::config::KdfParams;
use crate::crypto::{
    generate_salt, master_key_from_stretched, password_wrap_key, recovery_wrap_key, stretch_password,
    EncryptionKey, MasterKey, SALT_SIZE,
};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::store::sealed::{open, seal};
use crate::store::{keys, KeyStore, RecordKind};

/// Words in a recovery code
pub const WORD_COUNT: usize = 24;

const ENTROPY_BYTES: usize = 32;

/// 24-word BIP39 recovery code
///
/// Anyone holding it can recover the MasterKey. Show it once, never log it.
#[derive(ZeroizeOnDrop)]
pub struct RecoveryCode {
    #[zeroize(skip)]
    mnemonic: Mnemonic,
}

impl RecoveryCode {
    /// Generate a code from 256 bits of OS randomness
    pub fn generate() -> Result<Self> {
        let mut entropy = Zeroizing::new([0u8; ENTROPY_BYTES]);
        rand::rngs::OsRng.fill_bytes(&mut *entropy);
        let mnemonic = Mnemonic::from_entropy(&*entropy)
            .map_err(|e| Error::KeyDerivationFailed(format!("mnemonic: {}", e)))?;
        Ok(Self { mnemonic })
    }

    /// Parse a code typed by the user
    pub fn from_phrase(phrase: &str) -> Result<Self> {
        let mnemonic = Mnemonic::parse_normalized(phrase.trim()).map_err(|_| Error::InvalidRecoveryCode)?;
        if mnemonic.word_count() != WORD_COUNT {
            return Err(Error::InvalidRecoveryCode);
        }
        Ok(Self { mnemonic })
    }

    /// The words, in order
    pub fn words(&self) -> Vec<&'static str> {
        self.mnemonic.words().collect()
    }

    /// Space-separated phrase, for display only
    pub fn phrase(&self) -> Zeroizing<String> {
        Zeroizing::new(self.mnemonic.to_string())
    }

    fn wrap_key(&self) -> Result<EncryptionKey> {
        let seed = Zeroizing::new(self.mnemonic.to_seed(""));
        recovery_wrap_key(&*seed)
    }
}

impl fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryCode(..)")
    }
}

/// Stored form of a wrapped MasterKey
#[derive(Serialize, Deserialize)]
struct WrappedMasterKey {
    salt: Option<[u8; SALT_SIZE]>,
    kdf: Option<KdfParams>,
    sealed: Vec<u8>,
}

/// Password and recovery-code handling for one device
pub struct RecoveryManager {
    store: Arc<dyn KeyStore>,
    device: DeviceId,
    params: KdfParams,
    audit: Arc<AuditLog>,
}

impl RecoveryManager {
    /// Create a recovery manager; `params` applies to new password wraps
    pub fn new(store: Arc<dyn KeyStore>, device: DeviceId, params: KdfParams, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            device,
            params,
            audit,
        }
    }

    /// Whether setup has completed for this device
    pub fn is_set_up(&self) -> Result<bool> {
        Ok(self.store.get(&self.device, keys::RECOVERY_PASSWORD)?.is_some())
    }

    /// Create the MasterKey and its recovery code
    pub async fn setup(&self, password: &str, cancel: CancellationToken) -> Result<(MasterKey, RecoveryCode)> {
        if self.is_set_up()? {
            return Err(Error::AlreadyInitialized);
        }
        check_password(password)?;

        let salt = generate_salt();
        let stretched = self.stretch(password, salt, self.params.clone(), &cancel).await?;
        let master = master_key_from_stretched(&stretched)?;
        let code = RecoveryCode::generate()?;

        // The password record marks setup as complete, so it goes last
        self.write_code_wrap(&master, &code)?;
        self.write_password_wrap(&master, &stretched, salt, self.params.clone())?;

        tracing::info!("Recovery set up for device {}", self.device);
        self.audit.record(
            AuditEventType::RecoverySetup,
            &self.device,
            [("kdf_memory_kib", self.params.memory_kib.to_string())],
        );
        Ok((master, code))
    }

    /// Recover the MasterKey from the password
    ///
    /// Fails with `InvalidPassword` when the password is wrong.
    pub async fn unlock(&self, password: &str, cancel: CancellationToken) -> Result<MasterKey> {
        let wrapped = self.read(keys::RECOVERY_PASSWORD)?;
        let (Some(salt), Some(params)) = (wrapped.salt, wrapped.kdf.clone()) else {
            return Err(Error::StorageCorrupted("password wrap lacks KDF parameters".into()));
        };

        let stretched = self.stretch(password, salt, params, &cancel).await?;
        let key = password_wrap_key(&stretched)?;
        self.unwrap(&key, keys::RECOVERY_PASSWORD, &wrapped)
            .map_err(|e| match e {
                Error::AuthenticationFailure => Error::InvalidPassword,
                other => other,
            })
    }

    /// Recover the MasterKey from the recovery code
    ///
    /// Fails with `InvalidRecoveryCode` when the code does not match.
    pub fn recover(&self, code: &RecoveryCode) -> Result<MasterKey> {
        let wrapped = self.read(keys::RECOVERY_CODE)?;
        let master = self
            .unwrap(&code.wrap_key()?, keys::RECOVERY_CODE, &wrapped)
            .map_err(|e| match e {
                Error::AuthenticationFailure => Error::InvalidRecoveryCode,
                other => other,
            })?;

        tracing::info!("MasterKey recovered from recovery code on device {}", self.device);
        self.audit.record(
            AuditEventType::RecoveryUsed,
            &self.device,
            Vec::<(String, String)>::new(),
        );
        Ok(master)
    }

    /// Rewrap the MasterKey under a new password
    pub async fn change_password(&self, old: &str, new: &str, cancel: CancellationToken) -> Result<()> {
        check_password(new)?;
        let master = self.unlock(old, cancel.clone()).await?;
        self.rewrap(&master, new, &cancel).await?;
        self.audit.record(
            AuditEventType::PasswordChanged,
            &self.device,
            [("via", "password")],
        );
        Ok(())
    }

    /// Recover with the code, then set a new password
    pub async fn recover_and_reset_password(
        &self,
        code: &RecoveryCode,
        new_password: &str,
        cancel: CancellationToken,
    ) -> Result<MasterKey> {
        check_password(new_password)?;
        let master = self.recover(code)?;
        self.rewrap(&master, new_password, &cancel).await?;
        self.audit.record(
            AuditEventType::PasswordChanged,
            &self.device,
            [("via", "recovery_code")],
        );
        Ok(master)
    }

    /// Replace the recovery code with a fresh one
    ///
    /// The previous code stops working once the new wrap is stored.
    pub fn reissue_recovery_code(&self, master: &MasterKey) -> Result<RecoveryCode> {
        let code = RecoveryCode::generate()?;
        self.write_code_wrap(master, &code)?;
        tracing::info!("Recovery code reissued for device {}", self.device);
        self.audit.record(
            AuditEventType::RecoverySetup,
            &self.device,
            [("reissued", "true")],
        );
        Ok(code)
    }

    async fn rewrap(&self, master: &MasterKey, password: &str, cancel: &CancellationToken) -> Result<()> {
        let salt = generate_salt();
        let stretched = self.stretch(password, salt, self.params.clone(), cancel).await?;
        self.write_password_wrap(master, &stretched, salt, self.params.clone())?;
        tracing::info!("Password rewrapped for device {}", self.device);
        Ok(())
    }

    async fn stretch(
        &self,
        password: &str,
        salt: [u8; SALT_SIZE],
        params: KdfParams,
        cancel: &CancellationToken,
    ) -> Result<Zeroizing<[u8; 32]>> {
        let password = Zeroizing::new(password.as_bytes().to_vec());
        let task = tokio::task::spawn_blocking(move || stretch_password(&password, &salt, &params));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled("password stretching".into())),
            joined = task => joined?,
        }
    }

    fn write_password_wrap(
        &self,
        master: &MasterKey,
        stretched: &[u8; 32],
        salt: [u8; SALT_SIZE],
        params: KdfParams,
    ) -> Result<()> {
        let key = password_wrap_key(stretched)?;
        self.write(
            keys::RECOVERY_PASSWORD,
            &WrappedMasterKey {
                salt: Some(salt),
                kdf: Some(params),
                sealed: seal(&key, RecordKind::WrappedMasterKey, &self.device, keys::RECOVERY_PASSWORD, master.as_bytes())?,
            },
        )
    }

    fn write_code_wrap(&self, master: &MasterKey, code: &RecoveryCode) -> Result<()> {
        let key = code.wrap_key()?;
        self.write(
            keys::RECOVERY_CODE,
            &WrappedMasterKey {
                salt: None,
                kdf: None,
                sealed: seal(&key, RecordKind::WrappedMasterKey, &self.device, keys::RECOVERY_CODE, master.as_bytes())?,
            },
        )
    }

    fn write(&self, key_id: &str, wrapped: &WrappedMasterKey) -> Result<()> {
        self.store.put(&self.device, key_id, &bincode::serialize(wrapped)?)
    }

    fn read(&self, key_id: &str) -> Result<WrappedMasterKey> {
        let bytes = self
            .store
            .get(&self.device, key_id)?
            .ok_or(Error::NotInitialized)?;
        bincode::deserialize(&bytes).map_err(|e| Error::StorageCorrupted(format!("{}: {}", key_id, e)))
    }

    fn unwrap(&self, key: &EncryptionKey, key_id: &str, wrapped: &WrappedMasterKey) -> Result<MasterKey> {
        let bytes = open(key, RecordKind::WrappedMasterKey, &self.device, key_id, &wrapped.sealed)?;
        MasterKey::from_slice(&bytes)
    }
}

fn check_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(Error::InvalidPassword);
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
