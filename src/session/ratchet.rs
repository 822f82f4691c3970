//! # Double Ratchet
//!
//! Per-message keys with forward secrecy and post-compromise healing.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       DOUBLE RATCHET                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Root chain (DH ratchet, once per turn of conversation)                │
//! │                                                                         │
//! │    RK ──┬── HKDF(salt = RK, DH(ours, theirs), "root-ratchet") ──► RK'  │
//! │         └──────────────────────────────────────────────────────► CK    │
//! │                                                                         │
//! │  Symmetric chain (once per message)                                    │
//! │                                                                         │
//! │    CK ── HKDF(CK, "chain-ratchet", 76) ──► CK' ‖ MK (32) ‖ nonce (12)  │
//! │                                                                         │
//! │  Every message header carries the sender's current ratchet public key, │
//! │  the length of its previous sending chain, and the message index.      │
//! │  A new ratchet key in a header triggers a DH ratchet step.             │
//! │                                                                         │
//! │  Keys for messages that arrive out of order are derived ahead of time  │
//! │  and cached, bounded by `max_skip`.                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decryption runs against a copy of the state. Only a message that
//! authenticates is allowed to advance the ratchet, so tampered, replayed
//! or garbage input leaves the session exactly as it was.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{aead_decrypt, aead_encrypt, domain, hkdf_into, EncryptionKey, EncryptionKeyPair, Nonce};
use crate::error::{Error, Result};

/// Encoded header length: ratchet key, previous chain length, index
pub const HEADER_SIZE: usize = 32 + 4 + 4;

const CHAIN_OUTPUT: usize = 32 + 32 + 12;

/// Cleartext header sent alongside every ratchet message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: [u8; 32],
    /// Messages in the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Index within the current sending chain
    pub message_index: u32,
}

impl MessageHeader {
    /// Fixed encoding, authenticated as associated data
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..32].copy_from_slice(&self.ratchet_key);
        out[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[36..].copy_from_slice(&self.message_index.to_be_bytes());
        out
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize)]
struct Chain {
    key: [u8; 32],
    index: u32,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct MessageKeys {
    key: [u8; 32],
    nonce: [u8; 12],
}

impl MessageKeys {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        aead_encrypt(
            &EncryptionKey::from_bytes(self.key),
            &Nonce::from_bytes(self.nonce),
            plaintext,
            aad,
        )
    }

    fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        aead_decrypt(
            &EncryptionKey::from_bytes(self.key),
            &Nonce::from_bytes(self.nonce),
            ciphertext,
            aad,
        )
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    index: u32,
    key: [u8; 32],
    nonce: [u8; 12],
}

impl SkippedKey {
    fn message_keys(&self) -> MessageKeys {
        MessageKeys {
            key: self.key,
            nonce: self.nonce,
        }
    }
}

/// Root chain step: returns (next root key, new chain key)
fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let mut out = Zeroizing::new([0u8; 64]);
    hkdf_into(dh_output, Some(root_key), domain::ROOT_RATCHET, &mut *out)?;

    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&out[..32]);
    chain.copy_from_slice(&out[32..]);
    Ok((root, chain))
}

/// Symmetric chain step: returns (next chain key, message keys)
fn kdf_ck(chain_key: &[u8; 32]) -> Result<([u8; 32], MessageKeys)> {
    let mut out = Zeroizing::new([0u8; CHAIN_OUTPUT]);
    hkdf_into(chain_key, None, domain::CHAIN_RATCHET, &mut *out)?;

    let mut next = [0u8; 32];
    next.copy_from_slice(&out[..32]);
    let mut keys = MessageKeys {
        key: [0u8; 32],
        nonce: [0u8; 12],
    };
    keys.key.copy_from_slice(&out[32..64]);
    keys.nonce.copy_from_slice(&out[64..]);
    Ok((next, keys))
}

fn associated_data(ad: &[u8], header: &MessageHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(ad.len() + HEADER_SIZE);
    aad.extend_from_slice(ad);
    aad.extend_from_slice(&header.to_bytes());
    aad
}

/// Ratchet state of one session
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    root_key: [u8; 32],
    our_ratchet_secret: [u8; 32],
    our_ratchet_public: [u8; 32],
    their_ratchet_key: Option<[u8; 32]>,
    sending: Option<Chain>,
    receiving: Option<Chain>,
    previous_sending_length: u32,
    skipped: Vec<SkippedKey>,
}

impl RatchetState {
    /// State for the side that ran X3DH as initiator
    ///
    /// The X3DH chain key is the first sending chain, keyed to the
    /// responder's signed prekey.
    pub fn initiator(root_key: [u8; 32], chain_key: [u8; 32], base_key: &EncryptionKeyPair, their_signed_prekey: [u8; 32]) -> Self {
        Self {
            root_key,
            our_ratchet_secret: *base_key.secret_bytes(),
            our_ratchet_public: base_key.public_bytes(),
            their_ratchet_key: Some(their_signed_prekey),
            sending: Some(Chain {
                key: chain_key,
                index: 0,
            }),
            receiving: None,
            previous_sending_length: 0,
            skipped: Vec::new(),
        }
    }

    /// State for the side that answered a prekey message
    ///
    /// The X3DH chain key is the first receiving chain. No sending chain
    /// exists until the first reply, which ratchets with a fresh key.
    pub fn responder(root_key: [u8; 32], chain_key: [u8; 32], signed_prekey: &EncryptionKeyPair, their_base_key: [u8; 32]) -> Self {
        Self {
            root_key,
            our_ratchet_secret: *signed_prekey.secret_bytes(),
            our_ratchet_public: signed_prekey.public_bytes(),
            their_ratchet_key: Some(their_base_key),
            sending: None,
            receiving: Some(Chain {
                key: chain_key,
                index: 0,
            }),
            previous_sending_length: 0,
            skipped: Vec::new(),
        }
    }

    /// Our current ratchet public key
    pub fn ratchet_public_key(&self) -> [u8; 32] {
        self.our_ratchet_public
    }

    /// Index of the next message we will send, if a sending chain exists
    pub fn sending_index(&self) -> Option<u32> {
        self.sending.as_ref().map(|c| c.index)
    }

    /// Index of the next message expected on the receiving chain
    pub fn receiving_index(&self) -> Option<u32> {
        self.receiving.as_ref().map(|c| c.index)
    }

    /// Cached keys for out-of-order messages
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt one message, advancing the sending chain
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<(MessageHeader, Vec<u8>)> {
        let mut next = self.clone();
        if next.sending.is_none() {
            next.start_sending_chain()?;
        }

        let Some(chain) = next.sending.as_mut() else {
            return Err(Error::Internal("sending chain missing after ratchet".into()));
        };
        let (next_key, keys) = kdf_ck(&chain.key)?;
        let header = MessageHeader {
            ratchet_key: next.our_ratchet_public,
            previous_chain_length: next.previous_sending_length,
            message_index: chain.index,
        };
        chain.key = next_key;
        chain.index = chain
            .index
            .checked_add(1)
            .ok_or_else(|| Error::Internal("sending chain index overflow".into()))?;

        let ciphertext = keys.seal(plaintext, &associated_data(ad, &header))?;
        *self = next;
        Ok((header, ciphertext))
    }

    /// Decrypt one message
    ///
    /// Fails with `TooManySkippedMessages` when the header would require
    /// skipping more than `max_skip` keys, and with `AuthenticationFailure`
    /// on tampering, replays or a wrong key. On any failure the state is
    /// left unchanged.
    pub fn decrypt(&mut self, header: &MessageHeader, ciphertext: &[u8], ad: &[u8], max_skip: u32) -> Result<Vec<u8>> {
        let aad = associated_data(ad, header);

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|k| k.ratchet_key == header.ratchet_key && k.index == header.message_index)
        {
            let plaintext = self.skipped[pos].message_keys().open(ciphertext, &aad)?;
            let mut used = self.skipped.remove(pos);
            used.zeroize();
            return Ok(plaintext);
        }

        let mut next = self.clone();
        if next.their_ratchet_key != Some(header.ratchet_key) {
            next.skip_message_keys(header.previous_chain_length, max_skip)?;
            next.dh_ratchet(header)?;
        }
        next.skip_message_keys(header.message_index, max_skip)?;

        let Some(chain) = next.receiving.as_mut() else {
            return Err(Error::Internal("receiving chain missing after ratchet".into()));
        };
        if header.message_index < chain.index {
            // Already delivered and its key is gone
            return Err(Error::AuthenticationFailure);
        }
        let (next_key, keys) = kdf_ck(&chain.key)?;
        chain.key = next_key;
        chain.index += 1;

        let plaintext = keys.open(ciphertext, &aad)?;
        *self = next;
        Ok(plaintext)
    }

    /// First send by the responder: ratchet with a fresh key
    fn start_sending_chain(&mut self) -> Result<()> {
        let their = self
            .their_ratchet_key
            .ok_or_else(|| Error::Internal("no remote ratchet key".into()))?;

        let fresh = EncryptionKeyPair::generate();
        let shared = fresh.diffie_hellman(&their)?;
        let (root, chain) = kdf_rk(&self.root_key, shared.as_bytes())?;

        self.root_key = root;
        self.our_ratchet_secret = *fresh.secret_bytes();
        self.our_ratchet_public = fresh.public_bytes();
        self.sending = Some(Chain { key: chain, index: 0 });
        Ok(())
    }

    /// Receive a new remote ratchet key: derive the receiving chain, then a
    /// fresh sending chain
    fn dh_ratchet(&mut self, header: &MessageHeader) -> Result<()> {
        self.previous_sending_length = self.sending.as_ref().map_or(0, |c| c.index);
        self.their_ratchet_key = Some(header.ratchet_key);

        let ours = EncryptionKeyPair::from_bytes(&self.our_ratchet_secret);
        let shared = ours.diffie_hellman(&header.ratchet_key)?;
        let (root, receiving) = kdf_rk(&self.root_key, shared.as_bytes())?;
        self.root_key = root;
        self.receiving = Some(Chain {
            key: receiving,
            index: 0,
        });

        let fresh = EncryptionKeyPair::generate();
        let shared = fresh.diffie_hellman(&header.ratchet_key)?;
        let (root, sending) = kdf_rk(&self.root_key, shared.as_bytes())?;
        self.root_key = root;
        self.our_ratchet_secret = *fresh.secret_bytes();
        self.our_ratchet_public = fresh.public_bytes();
        self.sending = Some(Chain { key: sending, index: 0 });
        Ok(())
    }

    /// Derive and cache keys on the receiving chain up to `until`
    fn skip_message_keys(&mut self, until: u32, max_skip: u32) -> Result<()> {
        let Some(chain) = self.receiving.as_mut() else {
            return Ok(());
        };
        if until <= chain.index {
            return Ok(());
        }

        let gap = until - chain.index;
        if gap > max_skip {
            return Err(Error::TooManySkippedMessages {
                skipped: gap,
                limit: max_skip,
            });
        }

        let ratchet_key = self
            .their_ratchet_key
            .ok_or_else(|| Error::Internal("receiving chain without remote key".into()))?;
        while chain.index < until {
            let (next_key, keys) = kdf_ck(&chain.key)?;
            self.skipped.push(SkippedKey {
                ratchet_key,
                index: chain.index,
                key: keys.key,
                nonce: keys.nonce,
            });
            chain.key = next_key;
            chain.index += 1;
        }

        // Oldest keys go first once the cache is full
        let limit = max_skip as usize;
        if self.skipped.len() > limit {
            let excess = self.skipped.len() - limit;
            for mut evicted in self.skipped.drain(..excess) {
                evicted.zeroize();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("sending_index", &self.sending_index())
            .field("receiving_index", &self.receiving_index())
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
