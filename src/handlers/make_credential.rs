//! `authenticatorMakeCredential` (0x01) — spec.md §4.E.

use ciborium::Value;

use crate::auth_data::{self, AttestedCredentialData, FLAG_AT, FLAG_UP, FLAG_UV};
use crate::cbor;
use crate::credential;
use crate::dispatcher::HandlerOutcome;
use crate::error::CtapError;
use crate::pin_uv_auth::PERM_MAKE_CREDENTIAL;
use crate::platform::{Platform, PresenceRequest, PresenceResult};
use crate::state::{self, PublicBlob};
use crate::types::MakeCredentialRequest;
use crate::Authenticator;

const PIN_UV_AUTH_PROTOCOL_TWO: u64 = 2;

pub fn handle(auth: &mut Authenticator, platform: &mut dyn Platform, blob: &PublicBlob, params: &[u8]) -> HandlerOutcome {
    let request = match MakeCredentialRequest::parse(params) {
        Ok(request) => request,
        Err(err) => {
            log::warn!("malformed makeCredential request: {err}");
            return (Err(CtapError::from(err)), None);
        }
    };

    // Step 1: a command with no pinUvAuthParam still has to consult UP
    // before refusing, to avoid leaking whether a PIN is configured
    // through response timing (spec.md §4.E step 1's "dance").
    let Some(pin_uv_auth_param) = &request.pin_uv_auth_param else {
        let declined = platform.request_user_presence(PresenceRequest {
            rp_id: Some(&request.rp.id),
            user_name: request.user.name.as_deref(),
        }) != PresenceResult::Accepted;
        return if declined {
            (Err(CtapError::OperationDenied), None)
        } else {
            (Err(CtapError::PinInvalid), None)
        };
    };

    if request.pin_uv_auth_protocol != Some(PIN_UV_AUTH_PROTOCOL_TWO) {
        return (Err(CtapError::InvalidParameter), None);
    }

    if !request.pub_key_cred_params.iter().any(|alg| credential::is_valid_algorithm(*alg)) {
        return (Err(CtapError::UnsupportedAlgorithm), None);
    }

    if request.options.rk || request.options.uv {
        return (Err(CtapError::UnsupportedOption), None);
    }

    if !auth.token.is_valid() {
        return (Err(CtapError::PinUvAuthTokenExpired), None);
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
            log::warn!("makeCredential: failed to unlock secret blob: {err:#}");
            return (Err(CtapError::PinInvalid), None);
        }
    };

    if !auth.token.verify_pin_uv_auth_param(&request.client_data_hash, pin_uv_auth_param) {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    if !auth.token.has_permission(PERM_MAKE_CREDENTIAL) {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    if !auth.token.check_and_bind_rp_id(&request.rp.id) {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    if !auth.token.get_user_verified_flag_value() {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    if !auth.token.is_user_present() {
        let now = platform.millis();
        let accepted = platform.request_user_presence(PresenceRequest {
            rp_id: Some(&request.rp.id),
            user_name: request.user.name.as_deref(),
        }) == PresenceResult::Accepted;
        if !accepted {
            return (Err(CtapError::OperationDenied), None);
        }
        auth.token.confirm_user_presence(now);
    }

    for excluded in &request.exclude_list {
        if credential::verify_cred_id(&secret.master_secret, excluded, &request.rp.id) {
            return (Err(CtapError::InvalidOption), None);
        }
    }

    let context = credential::new_context(platform);
    let signing_key = match credential::derive_keypair(&secret.master_secret, &context) {
        Ok(key) => key,
        Err(err) => {
            log::error!("makeCredential: key derivation failed: {err:#}");
            return (Err(CtapError::Other), None);
        }
    };
    let cred_id = match credential::make_cred_id(&secret.master_secret, &context, &request.rp.id) {
        Ok(id) => id,
        Err(err) => {
            log::error!("makeCredential: credential id derivation failed: {err:#}");
            return (Err(CtapError::Other), None);
        }
    };

    secret.sign_counter = secret.sign_counter.wrapping_add(1);
    let cose_key = credential::cose_public_key(signing_key.verifying_key());
    let auth_data = match auth_data::encode(
        &request.rp.id,
        FLAG_UP | FLAG_UV | FLAG_AT,
        secret.sign_counter,
        &auth.config.aaguid,
        Some(AttestedCredentialData { credential_id: &cred_id, cose_public_key: &cose_key }),
    ) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("makeCredential: authData encoding failed: {err:#}");
            return (Err(CtapError::Other), None);
        }
    };

    let signature = credential::sign(&signing_key, &auth_data, &request.client_data_hash);

    let body = cbor::encode_map(vec![
        (cbor::int(1), Value::Text("packed".to_string())),
        (cbor::int(2), Value::Bytes(auth_data)),
        (
            cbor::int(3),
            Value::Map(vec![
                (Value::Text("alg".to_string()), Value::Integer(credential::COSE_ALG_ES256.into())),
                (Value::Text("sig".to_string()), Value::Bytes(signature)),
            ]),
        ),
    ]);

    match body {
        Ok(body) => (Ok(body), Some((secret, pin_key))),
        Err(err) => {
            log::error!("makeCredential: response encoding failed: {err:#}");
            (Err(CtapError::Other), None)
        }
    }
}
