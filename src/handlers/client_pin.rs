//! `authenticatorClientPIN` (0x06) and its sub-commands — spec.md §4.E.

use ciborium::Value;

use crate::cbor;
use crate::dispatcher::HandlerOutcome;
use crate::error::CtapError;
use crate::pin_uv_auth::SUPPORTED_PERMISSIONS;
use crate::platform::Platform;
use crate::state::{self, PublicBlob};
use crate::types::ClientPinRequest;
use crate::Authenticator;

const SUB_GET_RETRIES: u64 = 0x01;
const SUB_GET_KEY_AGREEMENT: u64 = 0x02;
const SUB_SET_PIN: u64 = 0x03;
const SUB_CHANGE_PIN: u64 = 0x04;
const SUB_GET_PIN_UV_AUTH_TOKEN_USING_PIN: u64 = 0x09;

const PIN_UV_AUTH_PROTOCOL_TWO: u64 = 2;
const MIN_PIN_LENGTH: usize = 4;
const MAX_PIN_LENGTH: usize = 63;
const MAX_RP_ID_LENGTH: usize = 64;
/// `newPinEnc`'s plaintext is always a 64-byte zero-padded slot (spec.md §3:
/// "64B padded, zero-terminated ≤63 chars"). Anything shorter is not a
/// well-formed padded PIN, whatever its length-terminator scan would say.
const NEW_PIN_PLAINTEXT_LEN: usize = MAX_PIN_LENGTH + 1;

pub fn handle(auth: &mut Authenticator, platform: &mut dyn Platform, blob: &mut PublicBlob, params: &[u8]) -> HandlerOutcome {
    let request = match ClientPinRequest::parse(params) {
        Ok(request) => request,
        Err(err) => {
            log::warn!("malformed clientPIN request: {err}");
            return (Err(CtapError::from(err)), None);
        }
    };

    match request.sub_command {
        SUB_GET_RETRIES => get_retries(blob),
        SUB_GET_KEY_AGREEMENT => get_key_agreement(auth, &request),
        SUB_SET_PIN => set_pin(auth, platform, blob, &request),
        SUB_CHANGE_PIN => change_pin(auth, platform, blob, &request),
        SUB_GET_PIN_UV_AUTH_TOKEN_USING_PIN => get_pin_uv_auth_token_using_pin(auth, platform, blob, &request),
        other => {
            log::warn!("unrecognized clientPIN sub-command {other}");
            (Err(CtapError::InvalidCommand), None)
        }
    }
}

fn get_retries(blob: &PublicBlob) -> HandlerOutcome {
    let body = cbor::encode_map(vec![
        (cbor::int(3), cbor::int(blob.pin_retries as i64)),
        (cbor::int(4), Value::Bool(false)),
    ]);
    match body {
        Ok(body) => (Ok(body), None),
        Err(err) => {
            log::error!("failed to encode getRetries response: {err:#}");
            (Err(CtapError::Other), None)
        }
    }
}

fn get_key_agreement(auth: &Authenticator, request: &ClientPinRequest) -> HandlerOutcome {
    if request.pin_uv_auth_protocol != Some(PIN_UV_AUTH_PROTOCOL_TWO) {
        return (Err(CtapError::InvalidParameter), None);
    }
    let body = cbor::encode_map(vec![(cbor::int(1), auth.key_agreement.cose_public_key())]);
    match body {
        Ok(body) => (Ok(body), None),
        Err(err) => {
            log::error!("failed to encode getKeyAgreement response: {err:#}");
            (Err(CtapError::Other), None)
        }
    }
}

/// Resolved Open Question (DESIGN.md): implemented rather than stubbed.
/// Refuses to overwrite an already-configured PIN — a PIN is already set
/// from the moment of `reset` (the configured default PIN), so this only
/// succeeds on an authenticator nobody has ever touched since reset... in
/// practice that window doesn't exist on this authenticator (reset always
/// installs `auth.config.default_pin`), so `setPIN` always refuses and
/// directs callers to `changePIN`, matching CTAP 6.5.5.5's "authenticator
/// already has a PIN set" rejection.
fn set_pin(auth: &mut Authenticator, platform: &mut dyn Platform, blob: &mut PublicBlob, request: &ClientPinRequest) -> HandlerOutcome {
    let _ = (auth, platform, blob, request);
    (Err(CtapError::PinAuthInvalid), None)
}

fn change_pin(auth: &mut Authenticator, platform: &mut dyn Platform, blob: &mut PublicBlob, request: &ClientPinRequest) -> HandlerOutcome {
    if request.pin_uv_auth_protocol != Some(PIN_UV_AUTH_PROTOCOL_TWO) {
        return (Err(CtapError::InvalidParameter), None);
    }
    let (peer_x, peer_y) = match &request.key_agreement {
        Some(pair) => pair,
        None => return (Err(CtapError::MissingParameter), None),
    };
    let new_pin_enc = match &request.new_pin_enc {
        Some(v) => v,
        None => return (Err(CtapError::MissingParameter), None),
    };
    let pin_hash_enc = match &request.pin_hash_enc {
        Some(v) => v,
        None => return (Err(CtapError::MissingParameter), None),
    };
    let pin_uv_auth_param = match &request.pin_uv_auth_param {
        Some(v) => v,
        None => return (Err(CtapError::MissingParameter), None),
    };

    if blob.pin_retries == 0 {
        return (Err(CtapError::PinBlocked), None);
    }

    let shared = match auth.key_agreement.shared_secret_with(peer_x, peer_y) {
        Ok(shared) => shared,
        Err(err) => {
            log::warn!("clientPIN changePIN: bad peer key: {err:#}");
            return (Err(CtapError::InvalidParameter), None);
        }
    };

    let mut message = Vec::with_capacity(new_pin_enc.len() + pin_hash_enc.len());
    message.extend_from_slice(new_pin_enc);
    message.extend_from_slice(pin_hash_enc);
    if !shared.verify(&message, pin_uv_auth_param) {
        return (Err(CtapError::PinAuthInvalid), None);
    }

    blob.pin_retries -= 1;

    let pin_hash_1: [u8; 16] = match shared.decrypt(pin_hash_enc) {
        Ok(plain) if plain.len() >= 16 => plain[..16].try_into().expect("checked length"),
        _ => {
            state::store_public_only(platform, blob);
            auth.key_agreement.regenerate(platform);
            return fail_pin_attempt(blob.pin_retries);
        }
    };

    let key = state::derive_blob_key(&blob.salt, &pin_hash_1);
    let mut secret = match state::decrypt_secret(blob, &key) {
        Ok(secret) => secret,
        Err(_) => {
            state::store_public_only(platform, blob);
            auth.key_agreement.regenerate(platform);
            return fail_pin_attempt(blob.pin_retries);
        }
    };

    let new_pin_plain = match shared.decrypt(new_pin_enc) {
        Ok(plain) => plain,
        Err(err) => {
            log::warn!("clientPIN changePIN: failed to decrypt new PIN: {err:#}");
            return (Err(CtapError::InvalidParameter), None);
        }
    };
    // `newPinEnc` only has to satisfy `decrypt`'s own block-alignment
    // requirement (pin_uv_auth.rs), which permits a plaintext far shorter
    // than the 64-byte padded slot the PIN is supposed to occupy — a
    // caller that knows the shared secret (it ran its own half of the
    // ECDH) can otherwise hand us a short buffer and make the unbounded
    // `new_pin_plain[..new_pin_len]` below panic. Reject it before the
    // length-terminator scan.
    if new_pin_plain.len() < NEW_PIN_PLAINTEXT_LEN {
        return (Err(CtapError::PinPolicyViolation), None);
    }
    let new_pin_len = new_pin_plain.iter().take(MAX_PIN_LENGTH).position(|&b| b == 0).unwrap_or(MAX_PIN_LENGTH);
    if new_pin_len < MIN_PIN_LENGTH {
        return (Err(CtapError::PinPolicyViolation), None);
    }

    secret.pin_hash = crate::state::pin_hash_of(std::str::from_utf8(&new_pin_plain[..new_pin_len]).unwrap_or(""));
    secret.pin_length = new_pin_len as u8;
    blob.pin_retries = auth.config.pin_retry_ceiling;

    let new_key = state::derive_blob_key(&blob.salt, &secret.pin_hash);
    if let Err(err) = state::commit(platform, blob, &secret, &new_key) {
        log::error!("clientPIN changePIN: commit failed: {err:#}");
        return (Err(CtapError::Other), None);
    }

    auth.token.invalidate();
    log::info!("PIN changed");
    (Ok(Vec::new()), None)
}

fn get_pin_uv_auth_token_using_pin(
    auth: &mut Authenticator,
    platform: &mut dyn Platform,
    blob: &mut PublicBlob,
    request: &ClientPinRequest,
) -> HandlerOutcome {
    if request.pin_uv_auth_protocol != Some(PIN_UV_AUTH_PROTOCOL_TWO) {
        return (Err(CtapError::InvalidParameter), None);
    }
    let permissions = match request.permissions {
        Some(0) | None => return (Err(CtapError::InvalidParameter), None),
        Some(p) => p,
    };
    if permissions & !SUPPORTED_PERMISSIONS != 0 {
        return (Err(CtapError::UnauthorizedPermission), None);
    }
    if let Some(rp_id) = &request.rp_id {
        if rp_id.len() > MAX_RP_ID_LENGTH {
            return (Err(CtapError::InvalidParameter), None);
        }
    }

    let (peer_x, peer_y) = match &request.key_agreement {
        Some(pair) => pair,
        None => return (Err(CtapError::MissingParameter), None),
    };
    let pin_hash_enc = match &request.pin_hash_enc {
        Some(v) => v,
        None => return (Err(CtapError::MissingParameter), None),
    };

    if blob.pin_retries == 0 {
        return (Err(CtapError::PinBlocked), None);
    }

    let shared = match auth.key_agreement.shared_secret_with(peer_x, peer_y) {
        Ok(shared) => shared,
        Err(err) => {
            log::warn!("clientPIN getPinUvAuthTokenUsingPin: bad peer key: {err:#}");
            return (Err(CtapError::InvalidParameter), None);
        }
    };

    blob.pin_retries -= 1;

    let pin_hash_1: [u8; 16] = match shared.decrypt(pin_hash_enc) {
        Ok(plain) if plain.len() >= 16 => plain[..16].try_into().expect("checked length"),
        _ => {
            state::store_public_only(platform, blob);
            auth.key_agreement.regenerate(platform);
            return fail_pin_attempt(blob.pin_retries);
        }
    };

    let key = state::derive_blob_key(&blob.salt, &pin_hash_1);
    let secret = match state::decrypt_secret(blob, &key) {
        Ok(secret) => secret,
        Err(_) => {
            state::store_public_only(platform, blob);
            auth.key_agreement.regenerate(platform);
            return fail_pin_attempt(blob.pin_retries);
        }
    };

    if blob.force_pin_change == Some(true) {
        return (Err(CtapError::PinPolicyViolation), None);
    }

    blob.pin_retries = auth.config.pin_retry_ceiling;
    state::store_public_only(platform, blob);

    let token_bytes = auth.token.reset_token(platform);
    auth.token.set_grant(permissions, request.rp_id.clone());
    auth.token.begin_using(true, platform.millis());
    auth.token.set_pin_key(key);

    let encrypted_token = shared.encrypt(platform, &token_bytes);

    let _ = secret;
    let body = cbor::encode_map(vec![(cbor::int(2), cbor::bytes(encrypted_token))]);
    match body {
        Ok(body) => (Ok(body), None),
        Err(err) => {
            log::error!("failed to encode getPinUvAuthTokenUsingPin response: {err:#}");
            (Err(CtapError::Other), None)
        }
    }
}

fn fail_pin_attempt(retries_remaining: u8) -> HandlerOutcome {
    if retries_remaining == 0 {
        (Err(CtapError::PinBlocked), None)
    } else {
        (Err(CtapError::PinInvalid), None)
    }
}
