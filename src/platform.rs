//! The injected-capability boundary (spec.md §6, §9).
//!
//! Everything the core cannot do for itself — generate entropy, read the
//! clock, persist the encrypted blob, ask a human to confirm presence —
//! comes through this trait. No transport, no filesystem, no GUI code lives
//! in this crate.

/// Context handed to `request_user_presence` so an embedder's prompt can
/// show the relevant names without the core depending on any display logic.
pub struct PresenceRequest<'a> {
    pub rp_id: Option<&'a str>,
    pub user_name: Option<&'a str>,
}

/// The three ways a user-presence prompt can resolve (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceResult {
    Accepted,
    Denied,
    Timeout,
}

/// The embedder-supplied capability record (spec.md §6/§9). A trait object
/// rather than a generic type parameter: spec.md §9 explicitly asks to
/// replace the source's comptime-generic authenticator with "a plain
/// configuration record", since every caller is monomorphic and there is no
/// reason to thread a type parameter through every handler signature.
pub trait Platform {
    /// Fill `out` with cryptographically secure random bytes.
    fn rand_bytes(&mut self, out: &mut [u8]);

    /// Monotonic milliseconds, supplied by the host (spec.md §5).
    fn millis(&self) -> u64;

    /// Load the persisted public blob, if one has ever been written.
    fn load(&self) -> Option<Vec<u8>>;

    /// Persist the public blob. Errors are not representable here: a
    /// storage failure is surfaced by the dispatcher as `ctap1_err_other`
    /// (spec.md §7); an embedder whose storage can fail should panic or log
    /// internally, the same way the teacher's own device I/O treats a
    /// write failure as fatal-to-the-operation rather than fatal-to-the-process.
    fn store(&mut self, blob: &[u8]);

    /// Ask the human to confirm presence (and optionally verify identity).
    fn request_user_presence(&mut self, info: PresenceRequest<'_>) -> PresenceResult;
}

/// Compile-time/run-time tunables that would otherwise be magic numbers
/// scattered through the handlers (spec.md §3's token lifecycle constants).
#[derive(Debug, Clone)]
pub struct AuthenticatorConfig {
    pub aaguid: [u8; 16],
    pub default_pin: String,
    pub max_usage_period_ms: u64,
    pub user_present_time_limit_ms: u64,
    pub pin_retry_ceiling: u8,
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        AuthenticatorConfig {
            aaguid: crate::aaguid::AAGUID,
            default_pin: "candystick".to_string(),
            max_usage_period_ms: 600_000,
            user_present_time_limit_ms: 30_000,
            pin_retry_ceiling: 8,
        }
    }
}

/// A `rand_core::RngCore` adapter over the embedder's `rand_bytes`
/// callback, so `p256`'s key-generation APIs (which want a `CryptoRng`) can
/// be driven by the injected capability instead of reaching for `OsRng`
/// directly (spec.md §6: all randomness comes from the embedder).
pub(crate) struct PlatformRng<'a, P: Platform + ?Sized> {
    platform: &'a mut P,
}

impl<'a, P: Platform + ?Sized> PlatformRng<'a, P> {
    pub(crate) fn new(platform: &'a mut P) -> Self {
        PlatformRng { platform }
    }
}

impl<'a, P: Platform + ?Sized> rand_core::RngCore for PlatformRng<'a, P> {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.platform.rand_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.platform.rand_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.platform.rand_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.platform.rand_bytes(dest);
        Ok(())
    }
}

impl<'a, P: Platform + ?Sized> rand_core::CryptoRng for PlatformRng<'a, P> {}
