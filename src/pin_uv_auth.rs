//! PIN/UV Auth Protocol Two and the pinUvAuthToken lifecycle (spec.md §3/§4.C).
//!
//! The key-agreement keypair is long-lived (regenerated only on
//! `authenticatorReset` or an explicit `getKeyAgreement` rotation request),
//! so it's held as a plain `p256::SecretKey` and driven through the
//! free-function `p256::ecdh::diffie_hellman`, rather than `EphemeralSecret`
//! — the latter is built to be consumed after a single exchange, which
//! doesn't fit a key that answers many `getPinUvAuthTokenUsingPin` calls
//! over its lifetime.

use anyhow::{anyhow, Result};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ciborium::Value;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::platform::{Platform, PlatformRng};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const PERM_MAKE_CREDENTIAL: u8 = 0x01;
pub const PERM_GET_ASSERTION: u8 = 0x02;
pub const PERM_CREDENTIAL_MGMT: u8 = 0x04;
pub const PERM_BIO_ENROLLMENT: u8 = 0x08;
pub const PERM_LARGE_BLOB_WRITE: u8 = 0x10;
pub const PERM_AUTHENTICATOR_CFG: u8 = 0x20;

/// Bits this authenticator can actually grant — everything else
/// (credential management, biometric enrollment, large-blob write,
/// authenticator config) is a spec.md Non-goal and always unauthorized.
pub const SUPPORTED_PERMISSIONS: u8 = PERM_MAKE_CREDENTIAL | PERM_GET_ASSERTION;

/// The negotiated symmetric keys for one ECDH exchange (spec.md §3).
/// Zeroized on drop since both halves are secret-derived.
#[derive(Zeroize)]
pub struct SharedSecret {
    hmac_key: [u8; 32],
    aes_key: [u8; 32],
}

impl SharedSecret {
    /// `HKDF-extract(salt = 32 zero bytes, IKM = Z)` gives the AES key
    /// directly; `HKDF-expand(prk, "CTAP2 HMAC key", 32)` gives the HMAC
    /// key (spec.md §4.C `ecdh`: "HKDF-extract(...) ‖ HKDF-expand(...)").
    fn from_z(z: &[u8]) -> Result<Self> {
        let (prk, hk) = Hkdf::<Sha256>::extract(Some(&[0u8; 32]), z);
        let aes_key: [u8; 32] = prk.as_slice().try_into().expect("HKDF-SHA256 PRK is 32 bytes");
        let mut hmac_key = [0u8; 32];
        hk.expand(b"CTAP2 HMAC key", &mut hmac_key)
            .map_err(|_| anyhow!("HKDF expand failed for hmac key"))?;
        Ok(SharedSecret { hmac_key, aes_key })
    }

    /// `pinUvAuthParam` verification: HMAC-SHA256 over `message`, the
    /// leftmost 16 bytes compared constant-time against `signature`
    /// (spec.md §3 protocol two truncation).
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        if signature.len() != 16 {
            return false;
        }
        let mut mac = match HmacSha256::new_from_slice(&self.hmac_key) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(message);
        let tag = mac.finalize().into_bytes();
        tag[..16].ct_eq(signature).into()
    }

    pub fn authenticate(&self, message: &[u8]) -> [u8; 16] {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).expect("32-byte key is always valid");
        mac.update(message);
        let tag = mac.finalize().into_bytes();
        tag[..16].try_into().expect("HMAC-SHA256 output is at least 16 bytes")
    }

    /// AES-256-CBC, IV-prepended, zero-padded to a block boundary (protocol
    /// two's `encrypt(key, demPlaintext)`, spec.md §3).
    pub fn encrypt(&self, platform: &mut dyn Platform, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; 16];
        platform.rand_bytes(&mut iv);

        let mut buf = plaintext.to_vec();
        let pad = (16 - buf.len() % 16) % 16;
        buf.extend(std::iter::repeat(0u8).take(pad));

        let encryptor = Aes256CbcEnc::new(&self.aes_key.into(), &iv.into());
        let mut out = iv.to_vec();
        let cipher_len = buf.len();
        let ciphertext = encryptor
            .encrypt_padded_mut::<NoPadding>(&mut buf, cipher_len)
            .expect("buffer is already block-aligned");
        out.extend_from_slice(ciphertext);
        out
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 32 || ciphertext.len() % 16 != 0 {
            return Err(anyhow!("ciphertext is not a valid IV-prefixed CBC blob"));
        }
        let (iv, body) = ciphertext.split_at(16);
        let mut buf = body.to_vec();
        let decryptor = Aes256CbcDec::new(&self.aes_key.into(), iv.into());
        decryptor
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| anyhow!("CBC decryption failed"))?;
        Ok(buf)
    }
}

/// The authenticator's long-lived ECDH key-agreement keypair.
pub struct KeyAgreement {
    secret: SecretKey,
}

impl KeyAgreement {
    pub fn generate(platform: &mut dyn Platform) -> Self {
        let secret = SecretKey::random(&mut PlatformRng::new(platform));
        KeyAgreement { secret }
    }

    /// Replaces the ephemeral keypair (spec.md §4.C `regenerate`), called
    /// whenever a PIN attempt fails.
    pub fn regenerate(&mut self, platform: &mut dyn Platform) {
        self.secret = SecretKey::random(&mut PlatformRng::new(platform));
    }

    pub fn cose_public_key(&self) -> Value {
        let public: PublicKey = self.secret.public_key();
        let point = public.to_encoded_point(false);
        let x = point.x().expect("uncompressed point has an x-coordinate").to_vec();
        let y = point.y().expect("uncompressed point has a y-coordinate").to_vec();
        Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(2.into())),
            (Value::Integer(3.into()), Value::Integer((-25).into())),
            (Value::Integer((-1).into()), Value::Integer(1.into())),
            (Value::Integer((-2).into()), Value::Bytes(x)),
            (Value::Integer((-3).into()), Value::Bytes(y)),
        ])
    }

    /// Derives the shared secret against a peer's COSE_Key-encoded public
    /// point (spec.md §4.C `getPinUvAuthTokenUsingPin`).
    pub fn shared_secret_with(&self, peer_x: &[u8], peer_y: &[u8]) -> Result<SharedSecret> {
        let mut sec1 = Vec::with_capacity(65);
        sec1.push(0x04);
        sec1.extend_from_slice(peer_x);
        sec1.extend_from_slice(peer_y);
        let peer_public = PublicKey::from_sec1_bytes(&sec1).map_err(|_| anyhow!("invalid peer public key"))?;

        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer_public.as_affine());
        SharedSecret::from_z(shared.raw_secret_bytes().as_slice())
    }
}

/// The single pinUvAuthToken slot (spec.md §3/§4.C). Only one token is live
/// at a time — generating a new one invalidates whatever was issued before.
pub struct PinUvAuthToken {
    token: Option<[u8; 32]>,
    permissions: u8,
    rp_id: Option<String>,
    in_use: bool,
    user_present: bool,
    user_verified: bool,
    initial_usage_time_ms: u64,
    rolling_timer_ms: u64,
    /// The AEAD key currently capable of decrypting the secret blob, cached
    /// from the last successful PIN entry (spec.md §3: "pin_key: when
    /// non-null, the HKDF key currently capable of decrypting the secret
    /// blob"). Zeroized on drop along with the token itself.
    pin_key: Option<[u8; 32]>,
}

impl Default for PinUvAuthToken {
    fn default() -> Self {
        PinUvAuthToken {
            token: None,
            permissions: 0,
            rp_id: None,
            in_use: false,
            user_present: false,
            user_verified: false,
            initial_usage_time_ms: 0,
            rolling_timer_ms: 0,
            pin_key: None,
        }
    }
}

impl Drop for PinUvAuthToken {
    fn drop(&mut self) {
        self.token.zeroize();
        self.pin_key.zeroize();
    }
}

impl PinUvAuthToken {
    /// Fills `pin_token` with 32 fresh random bytes (spec.md §4.C
    /// `reset_token`), independent of the permission/rp_id grant — callers
    /// pair this with a separate `set_grant` once the PIN check succeeds.
    pub fn reset_token(&mut self, platform: &mut dyn Platform) -> [u8; 32] {
        let mut token = [0u8; 32];
        platform.rand_bytes(&mut token);
        self.token = Some(token);
        token
    }

    pub fn set_grant(&mut self, permissions: u8, rp_id: Option<String>) {
        self.permissions = permissions;
        self.rp_id = rp_id;
    }

    /// `begin_using(uv, now)`: `in_use=true`, both timers start at `now`,
    /// `user_verified=uv`, `user_present=false` (spec.md §4.C).
    pub fn begin_using(&mut self, user_verified: bool, now_ms: u64) {
        self.in_use = true;
        self.initial_usage_time_ms = now_ms;
        self.rolling_timer_ms = now_ms;
        self.user_verified = user_verified;
        self.user_present = false;
    }

    /// Records that the UP prompt was just satisfied, renewing the rolling
    /// 30s decay window (spec.md §4.C / §5's "user_present decays ~30s
    /// after being set").
    pub fn confirm_user_presence(&mut self, now_ms: u64) {
        self.user_present = true;
        self.rolling_timer_ms = now_ms;
    }

    /// Polled once per command (spec.md §4.C `timer_observer`): decays
    /// `user_present` past its 30s window, and clears the whole grant past
    /// `max_usage_period`.
    pub fn timer_observer(&mut self, now_ms: u64, max_usage_period_ms: u64, user_present_time_limit_ms: u64) {
        if !self.in_use {
            return;
        }
        if now_ms.saturating_sub(self.rolling_timer_ms) > user_present_time_limit_ms {
            self.user_present = false;
        }
        if now_ms.saturating_sub(self.initial_usage_time_ms) > max_usage_period_ms {
            self.in_use = false;
            self.permissions = 0;
            self.rp_id = None;
            self.user_present = false;
            self.user_verified = false;
            self.token.zeroize();
            self.token = None;
        }
    }

    /// Invalidates the current token outright — called on `reset()` and on
    /// any PIN mismatch (spec.md §3 `platform_keypair` note: "regenerated
    /// ... on any PIN mismatch").
    pub fn invalidate(&mut self) {
        self.token.zeroize();
        self.token = None;
        self.permissions = 0;
        self.rp_id = None;
        self.in_use = false;
        self.user_present = false;
        self.user_verified = false;
        self.pin_key.zeroize();
        self.pin_key = None;
    }

    pub fn is_valid(&self) -> bool {
        self.token.is_some() && self.in_use
    }

    pub fn has_permission(&self, permission: u8) -> bool {
        self.token.is_some() && self.permissions & permission != 0
    }

    pub fn set_permissions(&mut self, permissions: u8) {
        self.permissions = permissions;
    }

    pub fn clear_user_presence_and_verification(&mut self) {
        self.user_present = false;
        self.user_verified = false;
    }

    /// Binds the token to an RP on first use, or verifies the binding holds
    /// on every subsequent use (spec.md §9 Open Question, resolved in
    /// DESIGN.md: first handler call with an unbound token binds it).
    pub fn check_and_bind_rp_id(&mut self, rp_id: &str) -> bool {
        match &self.rp_id {
            Some(bound) => bound == rp_id,
            None => {
                self.rp_id = Some(rp_id.to_string());
                true
            }
        }
    }

    pub fn matches(&self, candidate: &[u8]) -> bool {
        match &self.token {
            Some(token) => token.ct_eq(candidate).into(),
            None => false,
        }
    }

    /// Verifies a `pinUvAuthParam` computed by the platform over `message`
    /// using the live `pin_token` as the HMAC-SHA256 key — protocol two's
    /// `authenticate(pinUvAuthToken, message)`, truncated to 16 bytes
    /// (spec.md §3).
    pub fn verify_pin_uv_auth_param(&self, message: &[u8], signature: &[u8]) -> bool {
        let Some(token) = &self.token else { return false };
        if signature.len() != 16 {
            return false;
        }
        let mut mac = match HmacSha256::new_from_slice(token) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(message);
        let tag = mac.finalize().into_bytes();
        tag[..16].ct_eq(signature).into()
    }

    pub fn is_user_present(&self) -> bool {
        self.user_present
    }

    /// `get_user_verified_flag_value()`: `in_use && user_verified`
    /// (spec.md §4.C).
    pub fn get_user_verified_flag_value(&self) -> bool {
        self.in_use && self.user_verified
    }

    pub fn pin_key(&self) -> Option<&[u8; 32]> {
        self.pin_key.as_ref()
    }

    pub fn set_pin_key(&mut self, key: [u8; 32]) {
        self.pin_key = Some(key);
    }

    pub fn clear_pin_key(&mut self) {
        self.pin_key.zeroize();
        self.pin_key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestPlatform {
        counter: u8,
        clock_ms: u64,
    }

    impl Platform for TestPlatform {
        fn rand_bytes(&mut self, out: &mut [u8]) {
            for b in out.iter_mut() {
                *b = self.counter;
                self.counter = self.counter.wrapping_add(1);
            }
        }
        fn millis(&self) -> u64 {
            self.clock_ms
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

    #[test]
    fn ecdh_round_trip_produces_matching_shared_secrets() {
        let mut platform_a = TestPlatform { counter: 0, clock_ms: 0 };
        let mut platform_b = TestPlatform { counter: 100, clock_ms: 0 };
        let a = KeyAgreement::generate(&mut platform_a);
        let b = KeyAgreement::generate(&mut platform_b);

        let a_point = a.secret.public_key().to_encoded_point(false);
        let b_point = b.secret.public_key().to_encoded_point(false);

        let secret_a = a.shared_secret_with(b_point.x().unwrap(), b_point.y().unwrap()).unwrap();
        let secret_b = b.shared_secret_with(a_point.x().unwrap(), a_point.y().unwrap()).unwrap();

        let message = b"hello authenticator";
        let tag = secret_a.authenticate(message);
        assert!(secret_b.verify(message, &tag));
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let mut platform = TestPlatform { counter: 0, clock_ms: 0 };
        let secret = SharedSecret { hmac_key: [1u8; 32], aes_key: [2u8; 32] };
        let plaintext = b"pin_token_32_bytes_exactly_here";
        let ciphertext = secret.encrypt(&mut platform, plaintext);
        let decrypted = secret.decrypt(&ciphertext).unwrap();
        assert_eq!(&decrypted[..plaintext.len()], plaintext);
    }

    #[test]
    fn token_rp_binds_on_first_use() {
        let mut token = PinUvAuthToken::default();
        let mut platform = TestPlatform { counter: 0, clock_ms: 0 };
        token.reset_token(&mut platform);
        token.set_grant(PERM_MAKE_CREDENTIAL, None);
        assert!(token.check_and_bind_rp_id("example.com"));
        assert!(token.check_and_bind_rp_id("example.com"));
        assert!(!token.check_and_bind_rp_id("evil.example"));
    }

    #[test]
    fn token_expires_after_usage_period() {
        let mut token = PinUvAuthToken::default();
        let mut platform = TestPlatform { counter: 0, clock_ms: 0 };
        token.reset_token(&mut platform);
        token.set_grant(PERM_GET_ASSERTION, None);
        token.begin_using(true, platform.millis());
        platform.clock_ms = 700_000;
        token.timer_observer(platform.millis(), 600_000, 30_000);
        assert!(!token.is_valid());
    }

    #[test]
    fn user_present_decays_before_full_expiry() {
        let mut token = PinUvAuthToken::default();
        let mut platform = TestPlatform { counter: 0, clock_ms: 0 };
        token.reset_token(&mut platform);
        token.set_grant(PERM_GET_ASSERTION, None);
        token.begin_using(true, platform.millis());
        token.confirm_user_presence(platform.millis());
        platform.clock_ms = 40_000;
        token.timer_observer(platform.millis(), 600_000, 30_000);
        assert!(token.is_valid());
        assert!(!token.is_user_present());
    }

    #[test]
    fn permission_bits_are_checked() {
        let mut token = PinUvAuthToken::default();
        let mut platform = TestPlatform { counter: 0, clock_ms: 0 };
        token.reset_token(&mut platform);
        token.set_grant(PERM_MAKE_CREDENTIAL, None);
        assert!(token.has_permission(PERM_MAKE_CREDENTIAL));
        assert!(!token.has_permission(PERM_GET_ASSERTION));
    }
}
