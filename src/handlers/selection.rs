//! `authenticatorSelection` (0x0B) — spec.md §4.E.

use crate::dispatcher::HandlerOutcome;
use crate::error::CtapError;
use crate::platform::{Platform, PresenceRequest, PresenceResult};

pub fn handle(platform: &mut dyn Platform) -> HandlerOutcome {
    let result = platform.request_user_presence(PresenceRequest { rp_id: None, user_name: None });
    if result != PresenceResult::Accepted {
        log::info!("selection declined by user");
        return (Err(CtapError::OperationDenied), None);
    }
    (Ok(Vec::new()), None)
}
