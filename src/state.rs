//! The Persistent-State Manager (spec.md §3/§4.B) — a leaf module: pure
//! functions over byte slices plus the injected `Platform` for randomness
//! and storage I/O.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Context, Result};
use ciborium::Value;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cbor::IntMap;
use crate::platform::Platform;

const META_VALID: u8 = 0xF1;

/// The on-device record (spec.md §3 "Public Blob"). Never contains key
/// material in the clear — `ciphertext`/`tag` are the only secret-derived
/// bytes, and the AEAD key itself is never stored (re-derived from the PIN
/// on every unlock).
#[derive(Debug, Clone)]
pub struct PublicBlob {
    pub salt: [u8; 16],
    pub nonce_counter: [u8; 12],
    pub pin_retries: u8,
    pub tag: [u8; 16],
    pub ciphertext: Vec<u8>,
    pub force_pin_change: Option<bool>,
}

impl PublicBlob {
    pub fn serialize(&self) -> Vec<u8> {
        let mut entries = vec![
            (Value::Integer(0.into()), Value::Integer((META_VALID as i64).into())),
            (Value::Integer(1.into()), Value::Bytes(self.salt.to_vec())),
            (Value::Integer(2.into()), Value::Bytes(self.nonce_counter.to_vec())),
            (Value::Integer(3.into()), Value::Integer((self.pin_retries as i64).into())),
            (Value::Integer(4.into()), Value::Bytes(self.tag.to_vec())),
            (Value::Integer(5.into()), Value::Bytes(self.ciphertext.clone())),
        ];
        if let Some(force) = self.force_pin_change {
            entries.push((Value::Integer(6.into()), Value::Bool(force)));
        }
        let mut out = Vec::new();
        ciborium::into_writer(&Value::Map(entries), &mut out).expect("CBOR encode is infallible for this shape");
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let value: Value = ciborium::from_reader(bytes).map_err(|e| anyhow!("malformed public blob: {e}"))?;
        let map = IntMap::from_value(&value)?;

        let valid = map.require(0)?.as_integer().and_then(|i| u8::try_from(i).ok());
        if valid != Some(META_VALID) {
            return Err(anyhow!("public blob has the wrong magic byte"));
        }

        let salt: [u8; 16] = map
            .require_bytes(1)?
            .try_into()
            .map_err(|_| anyhow!("salt is not 16 bytes"))?;
        let nonce_counter: [u8; 12] = map
            .require_bytes(2)?
            .try_into()
            .map_err(|_| anyhow!("nonce counter is not 12 bytes"))?;
        let pin_retries = u8::try_from(map.require_u64(3)?).context("pin_retries out of range")?;
        let tag: [u8; 16] = map
            .require_bytes(4)?
            .try_into()
            .map_err(|_| anyhow!("tag is not 16 bytes"))?;
        let ciphertext = map.require_bytes(5)?;
        let force_pin_change = map.get_bool(6)?;

        Ok(PublicBlob {
            salt,
            nonce_counter,
            pin_retries,
            tag,
            ciphertext,
            force_pin_change,
        })
    }
}

/// The plaintext secret blob (spec.md §3 "Secret Blob"), zeroized on drop —
/// the moment a handler's owning scope ends, the master secret and PIN hash
/// are gone from RAM (spec.md §5's resource discipline).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBlob {
    pub master_secret: [u8; 32],
    pub pin_hash: [u8; 16],
    pub pin_length: u8,
    pub sign_counter: u32,
}

impl SecretBlob {
    fn serialize(&self) -> Vec<u8> {
        let entries = vec![
            (Value::Integer(1.into()), Value::Bytes(self.master_secret.to_vec())),
            (Value::Integer(2.into()), Value::Bytes(self.pin_hash.to_vec())),
            (Value::Integer(3.into()), Value::Integer((self.pin_length as i64).into())),
            (Value::Integer(4.into()), Value::Integer((self.sign_counter as i64).into())),
        ];
        let mut out = Vec::new();
        ciborium::into_writer(&Value::Map(entries), &mut out).expect("CBOR encode is infallible for this shape");
        out
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let value: Value = ciborium::from_reader(bytes).map_err(|e| anyhow!("malformed secret blob: {e}"))?;
        let map = IntMap::from_value(&value)?;
        let master_secret: [u8; 32] = map
            .require_bytes(1)?
            .try_into()
            .map_err(|_| anyhow!("master secret is not 32 bytes"))?;
        let pin_hash: [u8; 16] = map
            .require_bytes(2)?
            .try_into()
            .map_err(|_| anyhow!("pin hash is not 16 bytes"))?;
        let pin_length = u8::try_from(map.require_u64(3)?).context("pin_length out of range")?;
        let sign_counter = u32::try_from(map.require_u64(4)?).context("sign_counter out of range")?;
        Ok(SecretBlob {
            master_secret,
            pin_hash,
            pin_length,
            sign_counter,
        })
    }
}

/// `HKDF-extract(salt, pin_hash)` — the AEAD key is never stored, only
/// rederived from whatever PIN the caller is attempting to unlock with
/// (spec.md §3's "Public Blob" invariants).
pub fn derive_blob_key(salt: &[u8; 16], pin_hash: &[u8; 16]) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), pin_hash);
    prk.into()
}

pub fn pin_hash_of(pin: &str) -> [u8; 16] {
    let digest = Sha256::digest(pin.as_bytes());
    digest[..16].try_into().expect("SHA-256 digest is at least 16 bytes")
}

fn encrypt(key: &[u8; 32], nonce_counter: &[u8; 12], plaintext: &[u8]) -> Result<([u8; 16], Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("bad AES-256-GCM key length"))?;
    let nonce = Nonce::from_slice(nonce_counter);
    let mut combined = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| anyhow!("AEAD encryption failed"))?;
    let tag_start = combined.len() - 16;
    let tag: [u8; 16] = combined[tag_start..].try_into().expect("GCM tag is 16 bytes");
    combined.truncate(tag_start);
    Ok((tag, combined))
}

fn decrypt(key: &[u8; 32], nonce_counter: &[u8; 12], ciphertext: &[u8], tag: &[u8; 16]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("bad AES-256-GCM key length"))?;
    let nonce = Nonce::from_slice(nonce_counter);
    let mut combined = Vec::with_capacity(ciphertext.len() + 16);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(nonce, Payload { msg: &combined, aad: &[] })
        .map_err(|_| anyhow!("AEAD decryption failed (wrong key or tampered blob)"))
}

/// Strictly increments a 12-byte little-endian nonce counter in place.
/// Returns an error instead of wrapping (spec.md §8 boundary case: "refuse
/// to write" on exhaustion).
fn increment_nonce(counter: &mut [u8; 12]) -> Result<()> {
    for byte in counter.iter_mut() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            return Ok(());
        }
    }
    Err(anyhow!("nonce counter exhausted; refusing to write"))
}

/// Loads the public blob, performing a first-boot `reset` if storage has
/// never been written to (spec.md §4.B).
pub fn load(platform: &mut dyn Platform, default_pin: &str) -> Result<PublicBlob> {
    match platform.load() {
        Some(bytes) => PublicBlob::deserialize(&bytes),
        None => {
            log::info!("no persisted state found, performing first-boot reset");
            reset(platform, [0u8; 12], default_pin)
        }
    }
}

/// Decrypts the secret blob under `key` (spec.md §4.B).
pub fn decrypt_secret(blob: &PublicBlob, key: &[u8; 32]) -> Result<SecretBlob> {
    let plaintext = decrypt(key, &blob.nonce_counter, &blob.ciphertext, &blob.tag)?;
    SecretBlob::deserialize(&plaintext)
}

/// Persists `blob` as-is, with no nonce bump and no re-encryption — for the
/// cases where only a public field (`pin_retries`, `force_pin_change`)
/// changed and the ciphertext is untouched (spec.md §4.B's commit
/// invariant only requires a fresh nonce when the secret blob itself was
/// rewritten).
pub fn store_public_only(platform: &mut dyn Platform, blob: &PublicBlob) {
    platform.store(&blob.serialize());
}

/// Bumps the nonce by one, re-encrypts `secret` under `key`, and hands the
/// updated blob to storage (spec.md §4.B invariant: "every successful
/// command that touched the secret blob re-encrypts it with a strictly
/// greater nonce").
pub fn commit(platform: &mut dyn Platform, blob: &mut PublicBlob, secret: &SecretBlob, key: &[u8; 32]) -> Result<()> {
    increment_nonce(&mut blob.nonce_counter)?;
    let (tag, ciphertext) = encrypt(key, &blob.nonce_counter, &secret.serialize())?;
    blob.tag = tag;
    blob.ciphertext = ciphertext;
    platform.store(&blob.serialize());
    Ok(())
}

/// Factory reset: fresh master secret and salt, default PIN, full retry
/// budget, zeroed signature counter. `carry_nonce` is the pre-reset nonce
/// counter, preserved so a salt re-roll can never reuse a nonce (spec.md
/// §3 invariant).
pub fn reset(platform: &mut dyn Platform, carry_nonce: [u8; 12], default_pin: &str) -> Result<PublicBlob> {
    let mut master_secret = [0u8; 32];
    platform.rand_bytes(&mut master_secret);
    let mut salt = [0u8; 16];
    platform.rand_bytes(&mut salt);

    let pin_hash = pin_hash_of(default_pin);
    let key = derive_blob_key(&salt, &pin_hash);

    let secret = SecretBlob {
        master_secret,
        pin_hash,
        pin_length: default_pin.len() as u8,
        sign_counter: 0,
    };

    let (tag, ciphertext) = encrypt(&key, &carry_nonce, &secret.serialize())?;

    let blob = PublicBlob {
        salt,
        nonce_counter: carry_nonce,
        pin_retries: 8,
        tag,
        ciphertext,
        force_pin_change: None,
    };
    platform.store(&blob.serialize());
    log::info!("authenticator reset complete");
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct TestPlatform {
        stored: RefCell<Option<Vec<u8>>>,
        counter: RefCell<u8>,
    }

    impl TestPlatform {
        fn new() -> Self {
            TestPlatform {
                stored: RefCell::new(None),
                counter: RefCell::new(0),
            }
        }
    }

    impl Platform for TestPlatform {
        fn rand_bytes(&mut self, out: &mut [u8]) {
            let mut c = self.counter.borrow_mut();
            for b in out.iter_mut() {
                *b = *c;
                *c = c.wrapping_add(1);
            }
        }
        fn millis(&self) -> u64 {
            0
        }
        fn load(&self) -> Option<Vec<u8>> {
            self.stored.borrow().clone()
        }
        fn store(&mut self, blob: &[u8]) {
            *self.stored.borrow_mut() = Some(blob.to_vec());
        }
        fn request_user_presence(
            &mut self,
            _info: crate::platform::PresenceRequest<'_>,
        ) -> crate::platform::PresenceResult {
            crate::platform::PresenceResult::Accepted
        }
    }

    #[test]
    fn first_boot_performs_reset() {
        let mut platform = TestPlatform::new();
        let blob = load(&mut platform, "candystick").unwrap();
        assert_eq!(blob.pin_retries, 8);
        assert_eq!(blob.nonce_counter, [0u8; 12]);
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let mut platform = TestPlatform::new();
        let blob = load(&mut platform, "candystick").unwrap();
        let key = derive_blob_key(&blob.salt, &pin_hash_of("candystick"));
        let secret = decrypt_secret(&blob, &key).unwrap();
        assert_eq!(secret.sign_counter, 0);
        assert_eq!(secret.pin_length, "candystick".len() as u8);
    }

    #[test]
    fn commit_strictly_increments_nonce() {
        let mut platform = TestPlatform::new();
        let mut blob = load(&mut platform, "candystick").unwrap();
        let key = derive_blob_key(&blob.salt, &pin_hash_of("candystick"));
        let secret = decrypt_secret(&blob, &key).unwrap();
        let before = blob.nonce_counter;
        commit(&mut platform, &mut blob, &secret, &key).unwrap();
        assert_ne!(before, blob.nonce_counter);
        assert_eq!(blob.nonce_counter[0], before[0].wrapping_add(1));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let mut platform = TestPlatform::new();
        let blob = load(&mut platform, "candystick").unwrap();
        let wrong_key = derive_blob_key(&blob.salt, &pin_hash_of("wrong-pin"));
        assert!(decrypt_secret(&blob, &wrong_key).is_err());
    }

    #[test]
    fn reset_preserves_carried_nonce() {
        let mut platform = TestPlatform::new();
        let mut blob = load(&mut platform, "candystick").unwrap();
        let key = derive_blob_key(&blob.salt, &pin_hash_of("candystick"));
        let secret = decrypt_secret(&blob, &key).unwrap();
        commit(&mut platform, &mut blob, &secret, &key).unwrap();
        let carried = blob.nonce_counter;

        let new_blob = reset(&mut platform, carried, "candystick").unwrap();
        assert_eq!(new_blob.nonce_counter, carried);
        assert_ne!(new_blob.salt, blob.salt);
    }
}
