//! Integration coverage for the six seed scenarios (spec.md §8), driven
//! through `Authenticator::handle` exactly as an embedder would. The
//! "platform/client" side of PIN/UV protocol two (ECDH, HKDF, AES-CBC,
//! HMAC) is reimplemented here from scratch rather than imported from the
//! crate, the same way a real host-side client would have to.

use ciborium::Value;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use ctap2_authenticator_core::{Authenticator, AuthenticatorConfig, Platform, PresenceRequest, PresenceResult};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const CTAP2_MAKE_CREDENTIAL: u8 = 0x01;
const CTAP2_GET_ASSERTION: u8 = 0x02;
const CTAP2_GET_INFO: u8 = 0x04;
const CTAP2_CLIENT_PIN: u8 = 0x06;
const CTAP2_RESET: u8 = 0x07;

const SUB_GET_RETRIES: i64 = 0x01;
const SUB_GET_KEY_AGREEMENT: i64 = 0x02;
const SUB_CHANGE_PIN: i64 = 0x04;
const SUB_GET_PIN_UV_AUTH_TOKEN_USING_PIN: i64 = 0x09;

struct FakePlatform {
    storage: Option<Vec<u8>>,
    rng_counter: u8,
    clock_ms: u64,
    presence_answer: PresenceResult,
}

impl FakePlatform {
    fn new() -> Self {
        FakePlatform { storage: None, rng_counter: 1, clock_ms: 0, presence_answer: PresenceResult::Accepted }
    }
}

impl Platform for FakePlatform {
    fn rand_bytes(&mut self, out: &mut [u8]) {
        for b in out.iter_mut() {
            *b = self.rng_counter;
            self.rng_counter = self.rng_counter.wrapping_add(1);
        }
    }
    fn millis(&self) -> u64 {
        self.clock_ms
    }
    fn load(&self) -> Option<Vec<u8>> {
        self.storage.clone()
    }
    fn store(&mut self, blob: &[u8]) {
        self.storage = Some(blob.to_vec());
    }
    fn request_user_presence(&mut self, _info: PresenceRequest<'_>) -> PresenceResult {
        self.presence_answer
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn encode(value: Value) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::into_writer(&value, &mut out).unwrap();
    out
}

fn decode_body(response: &[u8]) -> (u8, Option<Value>) {
    let status = response[0];
    let body = &response[1..];
    if body.is_empty() {
        (status, None)
    } else {
        (status, Some(ciborium::from_reader(body).unwrap()))
    }
}

fn map_get<'a>(value: &'a Value, key: i64) -> Option<&'a Value> {
    match value {
        Value::Map(entries) => entries.iter().find_map(|(k, v)| (k.as_integer().map(i128::from) == Some(key as i128)).then_some(v)),
        _ => None,
    }
}

fn pin_hash(pin: &str) -> [u8; 16] {
    let digest = Sha256::digest(pin.as_bytes());
    digest[..16].try_into().unwrap()
}

/// AES-256-CBC, IV-prepended, zero-padded — mirrors the device's own
/// `SharedSecret::encrypt`/`decrypt`, but implemented independently here
/// since the crate doesn't expose its PIN/UV internals.
fn cbc_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; 16];
    getrandom_fill(&mut iv);
    let mut buf = plaintext.to_vec();
    let pad = (16 - buf.len() % 16) % 16;
    buf.extend(std::iter::repeat(0u8).take(pad));
    let cipher_len = buf.len();
    let encryptor = Aes256CbcEnc::new(key.into(), &iv.into());
    let ciphertext = encryptor.encrypt_padded_mut::<NoPadding>(&mut buf, cipher_len).unwrap();
    let mut out = iv.to_vec();
    out.extend_from_slice(ciphertext);
    out
}

fn cbc_decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Vec<u8> {
    let (iv, body) = ciphertext.split_at(16);
    let mut buf = body.to_vec();
    let decryptor = Aes256CbcDec::new(key.into(), iv.into());
    decryptor.decrypt_padded_mut::<NoPadding>(&mut buf).unwrap().to_vec()
}

fn getrandom_fill(buf: &mut [u8]) {
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(buf);
}

fn hmac16(key: &[u8; 32], message: &[u8]) -> [u8; 16] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(message);
    mac.finalize().into_bytes()[..16].try_into().unwrap()
}

/// One PIN/UV protocol two exchange: generates a fresh client ephemeral
/// keypair, fetches the device's current key-agreement public key via
/// `getKeyAgreement`, and returns the negotiated (aes_key, hmac_key) plus
/// this client's own public point (what the device needs as its `peer`).
fn negotiate(auth: &mut Authenticator, platform: &mut FakePlatform) -> ([u8; 32], [u8; 32], Vec<u8>, Vec<u8>) {
    let params = encode(Value::Map(vec![(int(1), int(2)), (int(2), int(SUB_GET_KEY_AGREEMENT))]));
    let mut command = vec![CTAP2_CLIENT_PIN];
    command.extend_from_slice(&params);
    let response = auth.handle(platform, &command);
    let (status, body) = decode_body(&response);
    assert_eq!(status, 0x00, "getKeyAgreement failed");
    let body = body.unwrap();
    let cose = map_get(&body, 1).unwrap();
    let device_x = match map_get(cose, -2).unwrap() {
        Value::Bytes(b) => b.clone(),
        _ => panic!("x is not bytes"),
    };
    let device_y = match map_get(cose, -3).unwrap() {
        Value::Bytes(b) => b.clone(),
        _ => panic!("y is not bytes"),
    };

    let client_secret = SecretKey::random(&mut rand::rngs::OsRng);
    let mut sec1 = vec![0x04];
    sec1.extend_from_slice(&device_x);
    sec1.extend_from_slice(&device_y);
    let device_public = PublicKey::from_sec1_bytes(&sec1).unwrap();
    let shared = diffie_hellman(client_secret.to_nonzero_scalar(), device_public.as_affine());

    let (prk, hk) = Hkdf::<Sha256>::extract(Some(&[0u8; 32]), shared.raw_secret_bytes().as_slice());
    let aes_key: [u8; 32] = prk.as_slice().try_into().unwrap();
    let mut hmac_key = [0u8; 32];
    hk.expand(b"CTAP2 HMAC key", &mut hmac_key).unwrap();

    let client_point = client_secret.public_key().to_encoded_point(false);
    let client_x = client_point.x().unwrap().to_vec();
    let client_y = client_point.y().unwrap().to_vec();

    (aes_key, hmac_key, client_x, client_y)
}

fn int(i: i64) -> Value {
    Value::Integer(i.into())
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn bytes(b: Vec<u8>) -> Value {
    Value::Bytes(b)
}

fn change_pin(auth: &mut Authenticator, platform: &mut FakePlatform, new_pin: &str) {
    let (aes_key, hmac_key, client_x, client_y) = negotiate(auth, platform);

    let mut new_pin_plain = new_pin.as_bytes().to_vec();
    new_pin_plain.resize(64, 0);
    let new_pin_enc = cbc_encrypt(&aes_key, &new_pin_plain);
    let pin_hash_enc = cbc_encrypt(&aes_key, &pin_hash("candystick"));

    let mut message = new_pin_enc.clone();
    message.extend_from_slice(&pin_hash_enc);
    let pin_uv_auth_param = hmac16(&hmac_key, &message);

    let params = encode(Value::Map(vec![
        (int(1), int(2)),
        (int(2), int(SUB_CHANGE_PIN)),
        (int(3), Value::Map(vec![(int(-2), bytes(client_x)), (int(-3), bytes(client_y))])),
        (int(4), bytes(pin_uv_auth_param.to_vec())),
        (int(5), bytes(new_pin_enc)),
        (int(6), bytes(pin_hash_enc)),
    ]));
    let mut command = vec![CTAP2_CLIENT_PIN];
    command.extend_from_slice(&params);
    let response = auth.handle(platform, &command);
    let (status, _) = decode_body(&response);
    assert_eq!(status, 0x00, "changePIN failed");
}

/// Returns `(status_byte, Some(32-byte raw pinUvAuthToken))` on success.
fn get_pin_uv_auth_token(auth: &mut Authenticator, platform: &mut FakePlatform, pin: &str, permissions: u8) -> (u8, Option<[u8; 32]>) {
    let (aes_key, _hmac_key, client_x, client_y) = negotiate(auth, platform);
    let pin_hash_enc = cbc_encrypt(&aes_key, &pin_hash(pin));

    let params = encode(Value::Map(vec![
        (int(1), int(2)),
        (int(2), int(SUB_GET_PIN_UV_AUTH_TOKEN_USING_PIN)),
        (int(3), Value::Map(vec![(int(-2), bytes(client_x)), (int(-3), bytes(client_y))])),
        (int(6), bytes(pin_hash_enc)),
        (int(9), int(permissions as i64)),
    ]));
    let mut command = vec![CTAP2_CLIENT_PIN];
    command.extend_from_slice(&params);
    let response = auth.handle(platform, &command);
    let (status, body) = decode_body(&response);
    if status != 0x00 {
        return (status, None);
    }
    let body = body.unwrap();
    let encrypted_token = match map_get(&body, 2).unwrap() {
        Value::Bytes(b) => b.clone(),
        _ => panic!("token is not bytes"),
    };
    let plain = cbc_decrypt(&aes_key, &encrypted_token);
    let token: [u8; 32] = plain[..32].try_into().unwrap();
    (status, Some(token))
}

fn get_retries(auth: &mut Authenticator, platform: &mut FakePlatform) -> u8 {
    let params = encode(Value::Map(vec![(int(2), int(SUB_GET_RETRIES))]));
    let mut command = vec![CTAP2_CLIENT_PIN];
    command.extend_from_slice(&params);
    let response = auth.handle(platform, &command);
    let (status, body) = decode_body(&response);
    assert_eq!(status, 0x00);
    let body = body.unwrap();
    match map_get(&body, 3).unwrap() {
        Value::Integer(i) => u8::try_from(i128::from(*i)).unwrap(),
        _ => panic!("pinRetries is not an integer"),
    }
}

fn make_credential_command(token: &[u8; 32], rp_id: &str, client_data_hash: &[u8; 32], user_id: &[u8]) -> Vec<u8> {
    let pin_uv_auth_param = hmac16(token, client_data_hash);
    let params = encode(Value::Map(vec![
        (int(1), bytes(client_data_hash.to_vec())),
        (int(2), Value::Map(vec![(text("id"), text(rp_id))])),
        (int(3), Value::Map(vec![(text("id"), bytes(user_id.to_vec())), (text("name"), text("alice"))])),
        (int(4), Value::Array(vec![Value::Map(vec![(text("alg"), int(-7)), (text("type"), text("public-key"))])])),
        (int(8), bytes(pin_uv_auth_param.to_vec())),
        (int(9), int(2)),
    ]));
    let mut command = vec![CTAP2_MAKE_CREDENTIAL];
    command.extend_from_slice(&params);
    command
}

fn get_assertion_command(token: &[u8; 32], rp_id: &str, client_data_hash: &[u8; 32], allow_list: Vec<Vec<u8>>) -> Vec<u8> {
    let pin_uv_auth_param = hmac16(token, client_data_hash);
    let entries: Vec<Value> = allow_list
        .into_iter()
        .map(|id| Value::Map(vec![(text("id"), bytes(id)), (text("type"), text("public-key"))]))
        .collect();
    let params = encode(Value::Map(vec![
        (int(1), text(rp_id)),
        (int(2), bytes(client_data_hash.to_vec())),
        (int(3), Value::Array(entries)),
        (int(6), bytes(pin_uv_auth_param.to_vec())),
        (int(7), int(2)),
    ]));
    let mut command = vec![CTAP2_GET_ASSERTION];
    command.extend_from_slice(&params);
    command
}

#[test]
fn first_boot_reports_client_pin_and_eight_retries() {
    init_logging();
    let mut platform = FakePlatform::new();
    let mut auth = Authenticator::new(&mut platform, AuthenticatorConfig::default());

    let response = auth.handle(&mut platform, &[CTAP2_GET_INFO]);
    let (status, body) = decode_body(&response);
    assert_eq!(status, 0x00);
    let body = body.unwrap();
    let options = map_get(&body, 4).unwrap();
    match options {
        Value::Map(entries) => {
            let client_pin = entries.iter().find(|(k, _)| k.as_text() == Some("clientPin")).map(|(_, v)| v);
            assert_eq!(client_pin, Some(&Value::Bool(true)));
        }
        _ => panic!("options is not a map"),
    }

    assert_eq!(get_retries(&mut auth, &mut platform), 8);
}

#[test]
fn pin_set_and_token_issuance_tracks_retries() {
    init_logging();
    let mut platform = FakePlatform::new();
    let mut auth = Authenticator::new(&mut platform, AuthenticatorConfig::default());

    change_pin(&mut auth, &mut platform, "hello");
    assert_eq!(get_retries(&mut auth, &mut platform), 8);

    let (status, token) = get_pin_uv_auth_token(&mut auth, &mut platform, "wrong-pin", 0x03);
    assert_eq!(status, 0x31, "expected ctap2_err_pin_invalid");
    assert!(token.is_none());
    assert_eq!(get_retries(&mut auth, &mut platform), 7);

    let (status, token) = get_pin_uv_auth_token(&mut auth, &mut platform, "hello", 0x03);
    assert_eq!(status, 0x00);
    assert!(token.is_some());
    assert_eq!(get_retries(&mut auth, &mut platform), 8);
}

#[test]
fn make_credential_happy_path_increments_sign_counter() {
    init_logging();
    let mut platform = FakePlatform::new();
    let mut auth = Authenticator::new(&mut platform, AuthenticatorConfig::default());
    change_pin(&mut auth, &mut platform, "hello");
    let (_, token) = get_pin_uv_auth_token(&mut auth, &mut platform, "hello", 0x01);
    let token = token.unwrap();

    let rp_id = "example.com";
    let client_data_hash = [7u8; 32];
    let command = make_credential_command(&token, rp_id, &client_data_hash, b"user-1");
    let response = auth.handle(&mut platform, &command);
    let (status, body) = decode_body(&response);
    assert_eq!(status, 0x00);
    let body = body.unwrap();
    let auth_data = match map_get(&body, 2).unwrap() {
        Value::Bytes(b) => b.clone(),
        _ => panic!("authData is not bytes"),
    };
    let expected_rp_hash = Sha256::digest(rp_id.as_bytes());
    assert_eq!(&auth_data[..32], expected_rp_hash.as_slice());
    let sign_counter = u32::from_be_bytes(auth_data[33..37].try_into().unwrap());
    assert_eq!(sign_counter, 1);

    let command = make_credential_command(&token, rp_id, &client_data_hash, b"user-1");
    let response = auth.handle(&mut platform, &command);
    let (status, body) = decode_body(&response);
    assert_eq!(status, 0x00);
    let auth_data = match map_get(&body.unwrap(), 2).unwrap() {
        Value::Bytes(b) => b.clone(),
        _ => panic!("authData is not bytes"),
    };
    let sign_counter = u32::from_be_bytes(auth_data[33..37].try_into().unwrap());
    assert_eq!(sign_counter, 2);
}

#[test]
fn get_assertion_with_fabricated_cred_id_returns_no_credentials() {
    init_logging();
    let mut platform = FakePlatform::new();
    let mut auth = Authenticator::new(&mut platform, AuthenticatorConfig::default());
    change_pin(&mut auth, &mut platform, "hello");
    let (_, token) = get_pin_uv_auth_token(&mut auth, &mut platform, "hello", 0x02);
    let token = token.unwrap();

    let client_data_hash = [9u8; 32];
    let fabricated = vec![0u8; 64];
    let command = get_assertion_command(&token, "example.com", &client_data_hash, vec![fabricated]);
    let response = auth.handle(&mut platform, &command);
    let (status, _) = decode_body(&response);
    assert_eq!(status, 0x2E, "expected ctap2_err_no_credentials");
}

#[test]
fn token_expires_after_max_usage_period() {
    init_logging();
    let mut platform = FakePlatform::new();
    let mut auth = Authenticator::new(&mut platform, AuthenticatorConfig::default());
    change_pin(&mut auth, &mut platform, "hello");
    let (_, token) = get_pin_uv_auth_token(&mut auth, &mut platform, "hello", 0x01);
    let token = token.unwrap();

    platform.clock_ms = 700_000;
    let client_data_hash = [1u8; 32];
    let command = make_credential_command(&token, "example.com", &client_data_hash, b"user-1");
    let response = auth.handle(&mut platform, &command);
    let (status, _) = decode_body(&response);
    assert_eq!(status, 0x38, "expected ctap2_err_pin_uv_auth_token_expired");
}

#[test]
fn reset_invalidates_existing_credentials() {
    init_logging();
    let mut platform = FakePlatform::new();
    let mut auth = Authenticator::new(&mut platform, AuthenticatorConfig::default());
    change_pin(&mut auth, &mut platform, "hello");
    let (_, token) = get_pin_uv_auth_token(&mut auth, &mut platform, "hello", 0x03);
    let token = token.unwrap();

    let client_data_hash = [3u8; 32];
    let command = make_credential_command(&token, "example.com", &client_data_hash, b"user-1");
    let response = auth.handle(&mut platform, &command);
    let (status, body) = decode_body(&response);
    assert_eq!(status, 0x00);
    let cred_id = {
        let auth_data = match map_get(&body.unwrap(), 2).unwrap() {
            Value::Bytes(b) => b.clone(),
            _ => panic!("authData is not bytes"),
        };
        auth_data[55..119].to_vec()
    };

    let response = auth.handle(&mut platform, &[CTAP2_RESET]);
    let (status, _) = decode_body(&response);
    assert_eq!(status, 0x00);

    change_pin(&mut auth, &mut platform, "hello");
    let (_, token) = get_pin_uv_auth_token(&mut auth, &mut platform, "hello", 0x02);
    let token = token.unwrap();

    let command = get_assertion_command(&token, "example.com", &client_data_hash, vec![cred_id]);
    let response = auth.handle(&mut platform, &command);
    let (status, _) = decode_body(&response);
    assert_eq!(status, 0x2E, "old credential id must no longer verify after reset");
}
