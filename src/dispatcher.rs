//! Command dispatch (spec.md §4.A). Reads the leading command byte, loads
//! and (where already unlocked) decrypts the persistent blob, routes to a
//! handler, commits any blob change the handler asks for, and prepends the
//! status byte.

use crate::error::CtapError;
use crate::handlers;
use crate::platform::Platform;
use crate::state::{self, PublicBlob, SecretBlob};
use crate::Authenticator;

const CTAP2_MAKE_CREDENTIAL: u8 = 0x01;
const CTAP2_GET_ASSERTION: u8 = 0x02;
const CTAP2_GET_INFO: u8 = 0x04;
const CTAP2_CLIENT_PIN: u8 = 0x06;
const CTAP2_RESET: u8 = 0x07;
const CTAP2_GET_NEXT_ASSERTION: u8 = 0x08;
const CTAP2_SELECTION: u8 = 0x0B;

const STATUS_OK: u8 = 0x00;

/// Outcome of a handler: the CBOR body (or the error it failed with), plus
/// an optional `(secret, key)` pair the dispatcher should commit to
/// storage afterward regardless of whether the body was `Ok` (spec.md §4.A
/// step 3: "register deferred re-encrypt+write that runs whether the
/// handler succeeds, returns an error, or panics").
pub(crate) type HandlerOutcome = (Result<Vec<u8>, CtapError>, Option<(SecretBlob, [u8; 32])>);

pub(crate) fn dispatch(auth: &mut Authenticator, platform: &mut dyn Platform, command: &[u8]) -> Vec<u8> {
    if command.is_empty() {
        return vec![CtapError::InvalidCommand.as_status_byte()];
    }
    let (cmd, params) = (command[0], &command[1..]);

    // CTAP1/U2F commands are out of scope; never let a legacy byte panic
    // the dispatcher (spec.md §4.G / SPEC_FULL.md §4.G).
    if cmd >= 0x80 {
        log::warn!("rejecting CTAP1/U2F command byte 0x{cmd:02x}");
        return vec![CtapError::InvalidCommand.as_status_byte()];
    }

    let now = platform.millis();
    auth.token
        .timer_observer(now, auth.config.max_usage_period_ms, auth.config.user_present_time_limit_ms);

    let mut blob = match state::load(platform, &auth.config.default_pin) {
        Ok(blob) => blob,
        Err(err) => {
            log::error!("failed to load persistent state: {err:#}");
            return vec![CtapError::Other.as_status_byte()];
        }
    };

    let (result, pending_commit) = match cmd {
        CTAP2_MAKE_CREDENTIAL => handlers::make_credential::handle(auth, platform, &blob, params),
        CTAP2_GET_ASSERTION => handlers::get_assertion::handle(auth, platform, &blob, params),
        CTAP2_GET_NEXT_ASSERTION => handlers::get_assertion::handle_next(auth, platform, &blob),
        CTAP2_GET_INFO => handlers::get_info::handle(auth, &blob),
        CTAP2_CLIENT_PIN => handlers::client_pin::handle(auth, platform, &mut blob, params),
        CTAP2_RESET => handlers::reset::handle(auth, platform, &blob),
        CTAP2_SELECTION => handlers::selection::handle(platform),
        other => {
            log::warn!("rejecting unknown command byte 0x{other:02x}");
            (Err(CtapError::InvalidCommand), None)
        }
    };

    if let Some((secret, key)) = pending_commit {
        if let Err(err) = state::commit(platform, &mut blob, &secret, &key) {
            log::error!("failed to commit persistent state: {err:#}");
        }
    }

    match result {
        Ok(body) => {
            let mut out = Vec::with_capacity(1 + body.len());
            out.push(STATUS_OK);
            out.extend_from_slice(&body);
            out
        }
        Err(err) => vec![err.as_status_byte()],
    }
}
