#![forbid(unsafe_code)]
//! Device-side CTAP2.1 authenticator core.
//!
//! The single entry point is [`Authenticator::handle`]: it turns an inbound
//! CTAP2 command byte string into an outbound byte string (status byte
//! followed by a CBOR response body). Everything the core cannot do for
//! itself — randomness, a clock, persistent storage, the user-presence
//! prompt — is injected through the [`Platform`] trait; this crate never
//! touches a filesystem, a USB/HID/NFC stack, or a GUI.

mod aaguid;
mod auth_data;
mod cbor;
mod credential;
mod dispatcher;
mod error;
mod handlers;
mod pin_uv_auth;
mod platform;
mod state;
mod types;

pub use error::CtapError;
pub use platform::{AuthenticatorConfig, Platform, PresenceRequest, PresenceResult};

use pin_uv_auth::{KeyAgreement, PinUvAuthToken};

/// The next-assertion queue left behind by a multi-match `getAssertion`
/// (spec.md §4.F supplement: `getNextAssertion`).
pub(crate) struct NextAssertionQueue {
    pub rp_id: String,
    pub client_data_hash: Vec<u8>,
    pub remaining: Vec<Vec<u8>>,
}

/// Owns every piece of process-wide mutable state (spec.md §5: "mutated
/// only by the currently executing handler"). `&mut self` on every public
/// method is how that single-threaded contract is expressed in the type
/// system — an embedder that wants concurrent dispatch must wrap this
/// struct in a `Mutex` itself; that is out of scope here.
pub struct Authenticator {
    pub(crate) config: AuthenticatorConfig,
    pub(crate) key_agreement: KeyAgreement,
    pub(crate) token: PinUvAuthToken,
    pub(crate) next_assertion: Option<NextAssertionQueue>,
}

impl Authenticator {
    /// Generates the long-lived ECDH key-agreement keypair (spec.md §4.C
    /// `initialize`, "once at boot").
    pub fn new(platform: &mut dyn Platform, config: AuthenticatorConfig) -> Self {
        Authenticator {
            key_agreement: KeyAgreement::generate(platform),
            token: PinUvAuthToken::default(),
            next_assertion: None,
            config,
        }
    }

    /// Processes one CTAP2 command. Never panics: every error path returns
    /// a single status byte (spec.md §4.A / §7).
    pub fn handle(&mut self, platform: &mut dyn Platform, command: &[u8]) -> Vec<u8> {
        dispatcher::dispatch(self, platform, command)
    }
}
