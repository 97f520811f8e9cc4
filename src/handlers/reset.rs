//! `authenticatorReset` (0x07) — spec.md §4.E.

use crate::dispatcher::HandlerOutcome;
use crate::error::CtapError;
use crate::platform::{Platform, PresenceRequest, PresenceResult};
use crate::state::{self, PublicBlob};
use crate::Authenticator;

pub fn handle(auth: &mut Authenticator, platform: &mut dyn Platform, blob: &PublicBlob) -> HandlerOutcome {
    let approved = platform.request_user_presence(PresenceRequest { rp_id: None, user_name: None });
    if approved != PresenceResult::Accepted {
        log::info!("reset declined by user");
        return (Err(CtapError::OperationDenied), None);
    }

    if let Err(err) = state::reset(platform, blob.nonce_counter, &auth.config.default_pin) {
        log::error!("reset failed: {err:#}");
        return (Err(CtapError::Other), None);
    }

    // The master secret just rolled: any cached pin_key, token, and
    // key-agreement keypair are stale.
    auth.token.invalidate();
    auth.key_agreement.regenerate(platform);
    auth.next_assertion = None;

    log::info!("authenticator reset complete");
    (Ok(Vec::new()), None)
}
