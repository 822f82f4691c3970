//! E2EE configuration.
//!
//! All tunables live in one serde-friendly struct so the host application can
//! embed it in its own settings file. Every field has a default; a JSON
//! document only needs to name what it overrides.
//!
//! ```json
//! { "prekeys": { "one_time_low_water": 10 }, "ratchet": { "max_skip": 500 } }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration for the E2EE subsystem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eeConfig {
    /// Prekey inventory policy
    pub prekeys: PreKeyConfig,
    /// Double Ratchet limits
    pub ratchet: RatchetConfig,
    /// Password KDF cost
    pub kdf: KdfParams,
}

/// Signed and one-time prekey policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreKeyConfig {
    /// How often the signed prekey is replaced
    pub signed_prekey_rotation_secs: u64,
    /// How long the previous signed prekey is kept after a rotation
    pub signed_prekey_grace_secs: u64,
    /// Peer bundles whose signed prekey is older than this are rejected
    pub max_bundle_age_secs: u64,
    /// Replenish when the published one-time pool drops below this
    pub one_time_low_water: usize,
    /// Pool size to replenish up to
    pub one_time_batch_size: usize,
    /// Bundles handed to the directory per publish
    pub bundles_per_publish: usize,
    /// Most one-time prekeys held in reserve for published bundles; the
    /// oldest reservations are dropped beyond this
    pub max_reserved: usize,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            signed_prekey_rotation_secs: 7 * DAY_SECS,
            signed_prekey_grace_secs: 2 * DAY_SECS,
            max_bundle_age_secs: 30 * DAY_SECS,
            one_time_low_water: 20,
            one_time_batch_size: 100,
            bundles_per_publish: 1,
            max_reserved: 200,
        }
    }
}

/// Double Ratchet limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Most message keys a single gap may skip, and most keys cached per session
    pub max_skip: u32,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self { max_skip: 1000 }
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl KdfParams {
    /// Recommended minimum memory cost (OWASP Argon2id profile)
    pub const RECOMMENDED_MEMORY_KIB: u32 = 19 * 1024;

    /// Cheap parameters for tests. Never use these for real passwords.
    pub fn fast_insecure() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Build the Argon2 parameter block
    pub(crate) fn to_argon2(&self) -> Result<argon2::Params> {
        argon2::Params::new(self.memory_kib, self.iterations, self.parallelism, Some(32))
            .map_err(|e| Error::InvalidConfig(format!("argon2 parameters: {}", e)))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: Self::RECOMMENDED_MEMORY_KIB,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl E2eeConfig {
    /// Parse a JSON document, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration suitable for tests: defaults with cheap Argon2
    pub fn for_tests() -> Self {
        Self {
            kdf: KdfParams::fast_insecure(),
            ..Self::default()
        }
    }

    /// Reject values the subsystem cannot operate with
    pub fn validate(&self) -> Result<()> {
        let p = &self.prekeys;
        if p.one_time_batch_size == 0 {
            return Err(Error::InvalidConfig("one_time_batch_size must be > 0".into()));
        }
        if p.one_time_low_water > p.one_time_batch_size {
            return Err(Error::InvalidConfig(
                "one_time_low_water must not exceed one_time_batch_size".into(),
            ));
        }
        if p.bundles_per_publish == 0 {
            return Err(Error::InvalidConfig("bundles_per_publish must be > 0".into()));
        }
        if p.max_reserved < p.bundles_per_publish {
            return Err(Error::InvalidConfig(
                "max_reserved must be at least bundles_per_publish".into(),
            ));
        }
        if p.signed_prekey_rotation_secs == 0 {
            return Err(Error::InvalidConfig(
                "signed_prekey_rotation_secs must be > 0".into(),
            ));
        }
        if p.max_bundle_age_secs < p.signed_prekey_rotation_secs {
            return Err(Error::InvalidConfig(
                "max_bundle_age_secs must be at least the rotation interval".into(),
            ));
        }
        if self.ratchet.max_skip == 0 {
            return Err(Error::InvalidConfig("max_skip must be > 0".into()));
        }

        self.kdf.to_argon2()?;
        if self.kdf.memory_kib < KdfParams::RECOMMENDED_MEMORY_KIB {
            tracing::warn!(
                "Argon2 memory cost {} KiB is below the recommended {} KiB",
                self.kdf.memory_kib,
                KdfParams::RECOMMENDED_MEMORY_KIB
            );
        }
        Ok(())
    }
}
