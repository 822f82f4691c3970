//! # X3DH Key Agreement
//!
//! Asynchronous key agreement against a published prekey bundle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          X3DH                                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Initiator A: identity IK_A, fresh ephemeral (base) key EK_A           │
//! │  Responder B: identity IK_B, signed prekey SPK_B, one-time OPK_B?      │
//! │                                                                         │
//! │    DH1 = DH(IK_A, SPK_B)                                               │
//! │    DH2 = DH(EK_A, IK_B)                                                │
//! │    DH3 = DH(EK_A, SPK_B)                                               │
//! │    DH4 = DH(IK_A, IK_B)                                                │
//! │    DH5 = DH(EK_A, OPK_B)          only when a one-time prekey is used  │
//! │                                                                         │
//! │    KM  = 0xFF × 32 ‖ DH1 ‖ DH2 ‖ DH3 ‖ DH4 [‖ DH5]                     │
//! │    root key ‖ chain key = HKDF(salt = 0 × 32, KM,                      │
//! │                                info = "umbra-e2ee-x3dh-v1", 64 bytes)  │
//! │                                                                         │
//! │  B recomputes the same values from the base key and prekey ids that    │
//! │  travel with A's first message, so no round trip is needed.           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::bundle::PreKeyBundle;
use crate::crypto::{dh, domain, hkdf_into, EncryptionKeyPair, IdentityKey, IdentityKeyPair, SharedSecret};
use crate::error::Result;

/// Initial shared secrets produced by the agreement
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AgreedSecrets {
    /// Initial root key
    pub root_key: [u8; 32],
    /// Initial chain key (initiator's sending, responder's receiving)
    pub chain_key: [u8; 32],
}

/// Initiator side of the agreement
pub struct Initiation {
    /// Derived secrets
    pub secrets: AgreedSecrets,
    /// The ephemeral key; its public half becomes the session id
    pub base_key: EncryptionKeyPair,
    /// Signed prekey used
    pub signed_prekey_id: u32,
    /// One-time prekey used, if any
    pub one_time_prekey_id: Option<u32>,
}

fn derive(shared: &[SharedSecret]) -> Result<AgreedSecrets> {
    let mut km = Zeroizing::new(Vec::with_capacity(32 * (shared.len() + 1)));
    km.extend_from_slice(&[0xFF; 32]);
    for secret in shared {
        km.extend_from_slice(secret.as_bytes());
    }

    let mut out = Zeroizing::new([0u8; 64]);
    hkdf_into(&km, Some(&[0u8; 32]), domain::X3DH, &mut *out)?;

    let mut secrets = AgreedSecrets {
        root_key: [0u8; 32],
        chain_key: [0u8; 32],
    };
    secrets.root_key.copy_from_slice(&out[..32]);
    secrets.chain_key.copy_from_slice(&out[32..]);
    Ok(secrets)
}

/// Run the initiator side against a verified bundle
///
/// The caller is responsible for rejecting unsigned or invalid bundles
/// before calling this.
pub fn initiate(ours: &IdentityKeyPair, bundle: &PreKeyBundle) -> Result<Initiation> {
    let base_key = EncryptionKeyPair::generate();
    let spk = &bundle.signed_prekey.public;
    let their_identity = &bundle.identity_key.encryption;

    let mut shared = vec![
        dh(&ours.encryption, spk)?,
        dh(&base_key, their_identity)?,
        dh(&base_key, spk)?,
        dh(&ours.encryption, their_identity)?,
    ];
    if let Some(otpk) = &bundle.one_time_prekey {
        shared.push(dh(&base_key, &otpk.public)?);
    }

    Ok(Initiation {
        secrets: derive(&shared)?,
        base_key,
        signed_prekey_id: bundle.signed_prekey.id,
        one_time_prekey_id: bundle.one_time_prekey.map(|k| k.id),
    })
}

/// Run the responder side from the values carried in a prekey message
pub fn respond(
    ours: &IdentityKeyPair,
    signed_prekey: &EncryptionKeyPair,
    one_time_prekey: Option<&EncryptionKeyPair>,
    their_identity: &IdentityKey,
    their_base_key: &[u8; 32],
) -> Result<AgreedSecrets> {
    let mut shared = vec![
        dh(signed_prekey, &their_identity.encryption)?,
        dh(&ours.encryption, their_base_key)?,
        dh(signed_prekey, their_base_key)?,
        dh(&ours.encryption, &their_identity.encryption)?,
    ];
    if let Some(otpk) = one_time_prekey {
        shared.push(dh(otpk, their_base_key)?);
    }
    derive(&shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, RegistrationId};
    use crate::keys::{OneTimePreKeyPublic, SignedPreKeyRecord};

    struct Responder {
        identity: IdentityKeyPair,
        spk: SignedPreKeyRecord,
        otpk: EncryptionKeyPair,
    }

    fn responder() -> (Responder, PreKeyBundle) {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(1, &identity.signing, 0);
        let otpk = EncryptionKeyPair::generate();
        let bundle = PreKeyBundle {
            device_id: DeviceId::new("bob"),
            registration_id: RegistrationId(1),
            identity_key: identity.public_key(),
            signed_prekey: spk.public(),
            one_time_prekey: Some(OneTimePreKeyPublic {
                id: 5,
                public: otpk.public_bytes(),
            }),
        };
        (Responder { identity, spk, otpk }, bundle)
    }

    #[test]
    fn test_both_sides_agree() {
        let alice = IdentityKeyPair::generate();
        let (bob, bundle) = responder();

        let init = initiate(&alice, &bundle).unwrap();
        assert_eq!(init.one_time_prekey_id, Some(5));

        let resp = respond(
            &bob.identity,
            &bob.spk.key_pair(),
            Some(&bob.otpk),
            &alice.public_key(),
            &init.base_key.public_bytes(),
        )
        .unwrap();

        assert_eq!(init.secrets.root_key, resp.root_key);
        assert_eq!(init.secrets.chain_key, resp.chain_key);
        assert_ne!(resp.root_key, resp.chain_key);
    }

    #[test]
    fn test_agreement_without_one_time_prekey() {
        let alice = IdentityKeyPair::generate();
        let (bob, mut bundle) = responder();
        bundle.one_time_prekey = None;

        let init = initiate(&alice, &bundle).unwrap();
        let resp = respond(&bob.identity, &bob.spk.key_pair(), None, &alice.public_key(), &init.base_key.public_bytes()).unwrap();
        assert_eq!(init.secrets.root_key, resp.root_key);

        // Responder wrongly mixing in a one-time key derives something else
        let wrong = respond(
            &bob.identity,
            &bob.spk.key_pair(),
            Some(&bob.otpk),
            &alice.public_key(),
            &init.base_key.public_bytes(),
        )
        .unwrap();
        assert_ne!(init.secrets.root_key, wrong.root_key);
    }

    #[test]
    fn test_wrong_identity_disagrees() {
        let alice = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let (bob, bundle) = responder();

        let init = initiate(&alice, &bundle).unwrap();
        let resp = respond(
            &bob.identity,
            &bob.spk.key_pair(),
            Some(&bob.otpk),
            &mallory.public_key(),
            &init.base_key.public_bytes(),
        )
        .unwrap();
        assert_ne!(init.secrets.root_key, resp.root_key);
    }
}
