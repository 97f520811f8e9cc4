//! `authenticatorGetAssertion` (0x02) and `authenticatorGetNextAssertion`
//! (0x08) — spec.md §4.E, SPEC_FULL.md §4.F.

use ciborium::Value;

use crate::auth_data::{self, FLAG_UP, FLAG_UV};
use crate::cbor;
use crate::credential;
use crate::dispatcher::HandlerOutcome;
use crate::error::CtapError;
use crate::pin_uv_auth::PERM_GET_ASSERTION;
use crate::platform::{Platform, PresenceRequest, PresenceResult};
use crate::state::{self, PublicBlob, SecretBlob};
use crate::types::GetAssertionRequest;
use crate::{Authenticator, NextAssertionQueue};

const PIN_UV_AUTH_PROTOCOL_TWO: u64 = 2;
/// Sentinel `permissions` value set after a successful assertion signals
/// that the token's grant has been spent (spec.md §4.E `getAssertion`:
/// "set permissions = 0x10 (sentinel: consumed)").
const PERMISSIONS_CONSUMED: u8 = 0x10;
const MIN_CRED_ID_LEN: usize = 64;

pub fn handle(auth: &mut Authenticator, platform: &mut dyn Platform, blob: &PublicBlob, params: &[u8]) -> HandlerOutcome {
    let request = match GetAssertionRequest::parse(params) {
        Ok(request) => request,
        Err(err) => {
            log::warn!("malformed getAssertion request: {err}");
            return (Err(CtapError::from(err)), None);
        }
    };

    let Some(pin_uv_auth_param) = &request.pin_uv_auth_param else {
        let declined = platform.request_user_presence(PresenceRequest { rp_id: Some(&request.rp_id), user_name: None })
            != PresenceResult::Accepted;
        return if declined {
            (Err(CtapError::OperationDenied), None)
        } else {
            (Err(CtapError::PinInvalid), None)
        };
    };

    if request.pin_uv_auth_protocol != Some(PIN_UV_AUTH_PROTOCOL_TWO) {
        return (Err(CtapError::InvalidParameter), None);
    }

    if request.options.uv {
        return (Err(CtapError::UnsupportedOption), None);
    }

    if !auth.token.is_valid() {
        return (Err(CtapError::PinUvAuthTokenExpired), None);
    }

    if !auth.token.verify_pin_uv_auth_param(&request.client_data_hash, pin_uv_auth_param) {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    if !auth.token.has_permission(PERM_GET_ASSERTION) {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    if !auth.token.check_and_bind_rp_id(&request.rp_id) {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    if !auth.token.get_user_verified_flag_value() {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    if !auth.token.is_user_present() {
        let now = platform.millis();
        let accepted =
            platform.request_user_presence(PresenceRequest { rp_id: Some(&request.rp_id), user_name: None }) == PresenceResult::Accepted;
        if !accepted {
            return (Err(CtapError::OperationDenied), None);
        }
        auth.token.confirm_user_presence(now);
    }

    let pin_key = match auth.token.pin_key() {
        Some(key) => *key,
        None => {
            log::error!("token valid but no pin_key cached");
            return (Err(CtapError::PinUvAuthTokenExpired), None);
        }
    };

    let mut secret = match state::decrypt_secret(blob, &pin_key) {
        Ok(secret) => secret,
        Err(err) => {
            log::warn!("getAssertion: failed to unlock secret blob: {err:#}");
            return (Err(CtapError::PinInvalid), None);
        }
    };

    let mut matches: Vec<Vec<u8>> = Vec::new();
    for entry in &request.allow_list {
        if entry.len() < MIN_CRED_ID_LEN {
            continue;
        }
        if credential::verify_cred_id(&secret.master_secret, entry, &request.rp_id) {
            matches.push(entry.clone());
        }
    }

    let Some(current) = matches.first().cloned() else {
        return (Err(CtapError::NoCredentials), None);
    };
    let remaining: Vec<Vec<u8>> = matches.into_iter().skip(1).collect();
    let total = 1 + remaining.len();
    auth.next_assertion = if remaining.is_empty() {
        None
    } else {
        Some(NextAssertionQueue { rp_id: request.rp_id.clone(), client_data_hash: request.client_data_hash.clone(), remaining })
    };

    let body = match sign_one(&mut secret, &request.rp_id, &request.client_data_hash, &current, &auth.config.aaguid, Some(total)) {
        Ok(body) => body,
        Err(err) => {
            log::error!("getAssertion: failed to build response: {err:#}");
            return (Err(CtapError::Other), None);
        }
    };

    auth.token.clear_user_presence_and_verification();
    auth.token.set_permissions(PERMISSIONS_CONSUMED);

    (Ok(body), Some((secret, pin_key)))
}

pub fn handle_next(auth: &mut Authenticator, platform: &mut dyn Platform, blob: &PublicBlob) -> HandlerOutcome {
    let _ = platform;
    let Some(queue) = auth.next_assertion.take() else {
        return (Err(CtapError::NotAllowed), None);
    };
    if queue.remaining.is_empty() {
        return (Err(CtapError::NotAllowed), None);
    }

    let pin_key = match auth.token.pin_key() {
        Some(key) => *key,
        None => {
            log::error!("getNextAssertion: no pin_key cached");
            return (Err(CtapError::PinUvAuthTokenExpired), None);
        }
    };

    let mut secret = match state::decrypt_secret(blob, &pin_key) {
        Ok(secret) => secret,
        Err(err) => {
            log::warn!("getNextAssertion: failed to unlock secret blob: {err:#}");
            return (Err(CtapError::PinUvAuthTokenExpired), None);
        }
    };

    let mut remaining = queue.remaining;
    let current = remaining.remove(0);
    let rp_id = queue.rp_id;
    let client_data_hash = queue.client_data_hash;

    let body = match sign_one(&mut secret, &rp_id, &client_data_hash, &current, &auth.config.aaguid, None) {
        Ok(body) => body,
        Err(err) => {
            log::error!("getNextAssertion: failed to build response: {err:#}");
            return (Err(CtapError::Other), None);
        }
    };

    auth.next_assertion = if remaining.is_empty() { None } else { Some(NextAssertionQueue { rp_id, client_data_hash, remaining }) };
    auth.token.clear_user_presence_and_verification();
    auth.token.set_permissions(PERMISSIONS_CONSUMED);

    (Ok(body), Some((secret, pin_key)))
}

/// Builds one signed assertion response: `at=0` AuthData over the
/// credential whose context is `cred_id[..32]`, ECDSA over
/// `authData‖clientDataHash`. `number_of_credentials`, when `Some`, is only
/// attached to the first assertion in a multi-match batch.
fn sign_one(
    secret: &mut SecretBlob,
    rp_id: &str,
    client_data_hash: &[u8],
    cred_id: &[u8],
    aaguid: &[u8; 16],
    number_of_credentials: Option<usize>,
) -> anyhow::Result<Vec<u8>> {
    let context: [u8; 32] = cred_id[..32].try_into().expect("checked length >= 64 before matching");
    let signing_key = credential::derive_keypair(&secret.master_secret, &context)?;

    secret.sign_counter = secret.sign_counter.wrapping_add(1);
    let auth_data = auth_data::encode(rp_id, FLAG_UP | FLAG_UV, secret.sign_counter, aaguid, None)?;
    let signature = credential::sign(&signing_key, &auth_data, client_data_hash);

    let mut entries = vec![
        (
            cbor::int(1),
            Value::Map(vec![
                (Value::Text("id".to_string()), Value::Bytes(cred_id.to_vec())),
                (Value::Text("type".to_string()), Value::Text("public-key".to_string())),
            ]),
        ),
        (cbor::int(2), Value::Bytes(auth_data)),
        (cbor::int(3), Value::Bytes(signature)),
    ];
    if let Some(total) = number_of_credentials {
        entries.push((cbor::int(5), cbor::int(total as i64)));
    }

    cbor::encode_map(entries)
}
