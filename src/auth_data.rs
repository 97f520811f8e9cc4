//! Bit-exact authenticator-data encoding (spec.md §4.D).
//!
//! `rp_id_hash(32) ‖ flags(1) ‖ sign_counter(4, big-endian) ‖
//! [attested_credential_data]`, where attested credential data is
//! `aaguid(16) ‖ cred_id_len(2, big-endian) ‖ cred_id ‖ cose_public_key`.

use ciborium::Value;
use sha2::{Digest, Sha256};

pub const FLAG_UP: u8 = 1 << 0;
pub const FLAG_UV: u8 = 1 << 2;
pub const FLAG_AT: u8 = 1 << 6;
#[allow(dead_code)] // no extensions implemented (spec.md Non-goals); kept for documentary completeness
pub const FLAG_ED: u8 = 1 << 7;

pub struct AttestedCredentialData<'a> {
    pub credential_id: &'a [u8],
    pub cose_public_key: &'a Value,
}

/// Builds authenticator data. `attested` is `Some` only for `makeCredential`
/// (`at` bit set); `getAssertion` always passes `None`. `aaguid` comes from
/// the caller's `AuthenticatorConfig` rather than a hardcoded constant, so
/// an embedder that configures a different authenticator identity sees it
/// reflected here too.
pub fn encode(
    rp_id: &str,
    flags: u8,
    sign_counter: u32,
    aaguid: &[u8; 16],
    attested: Option<AttestedCredentialData<'_>>,
) -> anyhow::Result<Vec<u8>> {
    let rp_id_hash = Sha256::digest(rp_id.as_bytes());

    let mut out = Vec::with_capacity(37);
    out.extend_from_slice(&rp_id_hash);
    out.push(flags);
    out.extend_from_slice(&sign_counter.to_be_bytes());

    if let Some(attested) = attested {
        out.extend_from_slice(aaguid);
        let len = u16::try_from(attested.credential_id.len())
            .map_err(|_| anyhow::anyhow!("credential id too long"))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(attested.credential_id);

        let mut key_bytes = Vec::new();
        ciborium::into_writer(attested.cose_public_key, &mut key_bytes)
            .map_err(|e| anyhow::anyhow!("failed to encode COSE key: {e}"))?;
        out.extend_from_slice(&key_bytes);
    }

    Ok(out)
}

pub fn rp_id_hash(rp_id: &str) -> [u8; 32] {
    Sha256::digest(rp_id.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_AAGUID: [u8; 16] = [0xAA; 16];

    #[test]
    fn encode_without_attested_data_is_37_bytes() {
        let out = encode("example.com", FLAG_UP | FLAG_UV, 1, &TEST_AAGUID, None).unwrap();
        assert_eq!(out.len(), 37);
        assert_eq!(&out[..32], &rp_id_hash("example.com"));
        assert_eq!(out[32], FLAG_UP | FLAG_UV);
        assert_eq!(&out[33..37], &1u32.to_be_bytes());
    }

    #[test]
    fn encode_with_attested_data_includes_aaguid_and_cred_id() {
        let cred_id = [9u8; 64];
        let cose_key = Value::Map(vec![]);
        let out = encode(
            "example.com",
            FLAG_UP | FLAG_UV | FLAG_AT,
            1,
            &TEST_AAGUID,
            Some(AttestedCredentialData {
                credential_id: &cred_id,
                cose_public_key: &cose_key,
            }),
        )
        .unwrap();
        assert_eq!(&out[37..53], &TEST_AAGUID);
        assert_eq!(&out[53..55], &64u16.to_be_bytes());
        assert_eq!(&out[55..119], &cred_id);
    }
}
