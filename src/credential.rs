//! The Credential Engine (spec.md §3/§4.D) — a leaf module with no
//! knowledge of CTAP commands, PIN state, or persistence. Every operation is
//! a pure function over byte slices plus an injected capability for the one
//! thing it can't do itself: generate a random context.

use anyhow::{anyhow, Result};
use ciborium::Value;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdsa::{signature::SignerMut, Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::platform::Platform;

type HmacSha256 = Hmac<Sha256>;

/// ES256, the only `pubKeyCredParams`/COSE algorithm this authenticator
/// supports (spec.md §4.E step 3).
pub const COSE_ALG_ES256: i64 = -7;

pub fn is_valid_algorithm(alg: i64) -> bool {
    alg == COSE_ALG_ES256
}

/// 32 random bytes, the context half of a credential id (spec.md §3).
pub fn new_context(platform: &mut dyn Platform) -> [u8; 32] {
    let mut context = [0u8; 32];
    platform.rand_bytes(&mut context);
    context
}

/// Deterministic per-credential signing key: the private scalar is
/// HKDF-expand(master, "CRED"‖context, 32) reduced into `[1, n-1]`
/// (spec.md §3). `master` is already 32 bytes — exactly a valid PRK length
/// for `Hkdf<Sha256>` — so we treat it as the PRK directly rather than
/// re-extracting it, matching the spec's `HKDF-expand(master_secret, ...)`
/// wording literally.
pub fn derive_keypair(master: &[u8; 32], context: &[u8; 32]) -> Result<SigningKey> {
    let hk = Hkdf::<Sha256>::from_prk(master).map_err(|_| anyhow!("invalid PRK length"))?;
    let mut info = Vec::with_capacity(4 + 32);
    info.extend_from_slice(b"CRED");
    info.extend_from_slice(context);

    // HKDF-expand output is uniform over 32 bytes; reject the
    // astronomically unlikely out-of-range scalar by expanding again under
    // a distinguishing suffix, preserving determinism.
    for attempt in 0u8..=255 {
        let mut okm = [0u8; 32];
        let mut info = info.clone();
        if attempt > 0 {
            info.push(attempt);
        }
        hk.expand(&info, &mut okm)
            .map_err(|_| anyhow!("HKDF expand failed"))?;
        if let Ok(key) = SigningKey::from_slice(&okm) {
            return Ok(key);
        }
    }
    Err(anyhow!("failed to derive a valid P-256 scalar"))
}

/// Self-authenticating credential id: `context ‖ HMAC-SHA256(master,
/// context‖rp_id)[0..32]` (spec.md §3/§4.D).
pub fn make_cred_id(master: &[u8; 32], context: &[u8; 32], rp_id: &str) -> Result<[u8; 64]> {
    let mut mac = HmacSha256::new_from_slice(master).map_err(|_| anyhow!("bad HMAC key length"))?;
    mac.update(context);
    mac.update(rp_id.as_bytes());
    let tag = mac.finalize().into_bytes();

    let mut cred_id = [0u8; 64];
    cred_id[..32].copy_from_slice(context);
    cred_id[32..].copy_from_slice(&tag);
    Ok(cred_id)
}

/// Recomputes the MAC over the claimed context and submitted `rp_id` and
/// compares it constant-time against the trailing 32 bytes of `cred_id`
/// (spec.md §3: "constant-time compare").
pub fn verify_cred_id(master: &[u8; 32], cred_id: &[u8], rp_id: &str) -> bool {
    if cred_id.len() != 64 {
        return false;
    }
    let context: [u8; 32] = cred_id[..32].try_into().expect("slice is exactly 32 bytes");
    let expected = match make_cred_id(master, &context, rp_id) {
        Ok(id) => id,
        Err(_) => return false,
    };
    expected[32..].ct_eq(&cred_id[32..]).into()
}

/// COSE_Key encoding of a P-256 public key, alg ES256 (spec.md §4.D),
/// built as a hand-rolled CBOR map in the same spirit as the teacher's
/// `serialize_nisty_public_key` (which did the equivalent for an EdDSA/NIST
/// key pair it only ever sent to the wire, never received back).
pub fn cose_public_key(verifying_key: &VerifyingKey) -> Value {
    let point = verifying_key.to_encoded_point(false);
    let x = point.x().expect("uncompressed point has an x-coordinate").to_vec();
    let y = point.y().expect("uncompressed point has a y-coordinate").to_vec();

    Value::Map(vec![
        (Value::Integer(1.into()), Value::Integer(2.into())), // kty: EC2
        (Value::Integer(3.into()), Value::Integer(COSE_ALG_ES256.into())), // alg: ES256
        (Value::Integer((-1).into()), Value::Integer(1.into())), // crv: P-256
        (Value::Integer((-2).into()), Value::Bytes(x)),
        (Value::Integer((-3).into()), Value::Bytes(y)),
    ])
}

/// ECDSA-P256-SHA256 over `auth_data ‖ client_data_hash`, DER-encoded
/// (spec.md §4.D).
pub fn sign(signing_key: &SigningKey, auth_data: &[u8], client_data_hash: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(auth_data.len() + client_data_hash.len());
    message.extend_from_slice(auth_data);
    message.extend_from_slice(client_data_hash);

    let mut signing_key = signing_key.clone();
    let signature: Signature = signing_key.sign(&message);
    signature.to_der().to_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRng(u8);
    impl Platform for FixedRng {
        fn rand_bytes(&mut self, out: &mut [u8]) {
            for b in out.iter_mut() {
                *b = self.0;
                self.0 = self.0.wrapping_add(1);
            }
        }
        fn millis(&self) -> u64 {
            0
        }
        fn load(&self) -> Option<Vec<u8>> {
            None
        }
        fn store(&mut self, _blob: &[u8]) {}
        fn request_user_presence(
            &mut self,
            _info: crate::platform::PresenceRequest<'_>,
        ) -> crate::platform::PresenceResult {
            crate::platform::PresenceResult::Accepted
        }
    }

    fn master() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn derive_keypair_is_deterministic() {
        let context = [1u8; 32];
        let k1 = derive_keypair(&master(), &context).unwrap();
        let k2 = derive_keypair(&master(), &context).unwrap();
        assert_eq!(
            k1.verifying_key().to_encoded_point(false),
            k2.verifying_key().to_encoded_point(false)
        );
    }

    #[test]
    fn different_context_different_key() {
        let k1 = derive_keypair(&master(), &[1u8; 32]).unwrap();
        let k2 = derive_keypair(&master(), &[2u8; 32]).unwrap();
        assert_ne!(
            k1.verifying_key().to_encoded_point(false),
            k2.verifying_key().to_encoded_point(false)
        );
    }

    #[test]
    fn cred_id_round_trips_for_matching_rp() {
        let mut rng = FixedRng(0);
        let context = new_context(&mut rng);
        let cred_id = make_cred_id(&master(), &context, "example.com").unwrap();
        assert!(verify_cred_id(&master(), &cred_id, "example.com"));
    }

    #[test]
    fn cred_id_rejected_for_wrong_rp() {
        let mut rng = FixedRng(0);
        let context = new_context(&mut rng);
        let cred_id = make_cred_id(&master(), &context, "example.com").unwrap();
        assert!(!verify_cred_id(&master(), &cred_id, "evil.example"));
    }

    #[test]
    fn fabricated_cred_id_with_zero_mac_is_rejected() {
        let mut cred_id = [0u8; 64];
        cred_id[..32].copy_from_slice(&[9u8; 32]);
        assert!(!verify_cred_id(&master(), &cred_id, "example.com"));
    }

    #[test]
    fn short_cred_id_is_rejected() {
        assert!(!verify_cred_id(&master(), &[0u8; 32], "example.com"));
    }

    #[test]
    fn algorithm_validation() {
        assert!(is_valid_algorithm(-7));
        assert!(!is_valid_algorithm(-8));
        assert!(!is_valid_algorithm(-257));
    }
}
