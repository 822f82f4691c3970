//! Device identifiers.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque identifier of one device of one user
///
/// Assigned by the account layer; this crate only compares and stores it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes mixed into associated data and fingerprints
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Random per-install number published in bundles
///
/// A new registration id after a reinstall tells peers the device was reset
/// even before they compare identity keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationId(pub u32);

impl RegistrationId {
    /// Generate a fresh 14-bit registration id (never zero)
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen_range(1..=0x3FFF))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new("alice-phone");
        assert_eq!(id.to_string(), "alice-phone");
        assert_eq!(id.as_bytes(), b"alice-phone");
    }

    #[test]
    fn test_registration_id_range() {
        for _ in 0..100 {
            let id = RegistrationId::generate();
            assert!(id.0 >= 1 && id.0 <= 0x3FFF);
        }
    }
}
