//! Wire request/response shapes for the four handled commands (spec.md §4).
//!
//! These are parsed by hand from `IntMap` rather than derived, because the
//! integer-keyed CTAP2 parameter maps don't fit serde's struct-field model
//! any better than the credential engine's CBOR fits `Deserialize` — see
//! `cbor.rs`.

use crate::cbor::{CborResult, IntMap};

pub struct Rp {
    pub id: String,
}

pub struct User {
    pub id: Vec<u8>,
    pub name: Option<String>,
    pub display_name: Option<String>,
}

pub struct MakeCredentialOptions {
    pub rk: bool,
    pub uv: bool,
}

pub struct MakeCredentialRequest {
    pub client_data_hash: Vec<u8>,
    pub rp: Rp,
    pub user: User,
    pub pub_key_cred_params: Vec<i64>,
    pub exclude_list: Vec<Vec<u8>>,
    pub options: MakeCredentialOptions,
    pub pin_uv_auth_param: Option<Vec<u8>>,
    pub pin_uv_auth_protocol: Option<u64>,
}

impl MakeCredentialRequest {
    pub fn parse(bytes: &[u8]) -> CborResult<Self> {
        let value = IntMap::parse(bytes)?;
        let map = IntMap::from_value(&value)?;

        let client_data_hash = map.require_bytes(1)?;

        let rp_map = map.require_map(2)?;
        let rp = Rp { id: rp_map.require_text_text("id")? };

        let user_map = map.require_map(3)?;
        let user = User {
            id: user_map.require_bytes_text("id")?,
            name: user_map.get_text_text("name")?,
            display_name: user_map.get_text_text("displayName")?,
        };

        let params_array = map.require_array(4)?;
        let mut pub_key_cred_params = Vec::with_capacity(params_array.len());
        for entry in params_array {
            let entry_map = IntMap::from_value(entry)?;
            pub_key_cred_params.push(entry_map.require_i64_text("alg")?);
        }

        let mut exclude_list = Vec::new();
        if let Some(items) = map.get_array(5)? {
            for entry in items {
                let entry_map = IntMap::from_value(entry)?;
                exclude_list.push(entry_map.require_bytes_text("id")?);
            }
        }

        let mut options = MakeCredentialOptions { rk: false, uv: false };
        if let Some(opts) = map.get_map(7)? {
            options.rk = opts.get_bool_text("rk")?.unwrap_or(false);
            options.uv = opts.get_bool_text("uv")?.unwrap_or(false);
        }

        let pin_uv_auth_param = map.get_bytes(8)?;
        let pin_uv_auth_protocol = map.get_u64(9)?;

        Ok(MakeCredentialRequest {
            client_data_hash,
            rp,
            user,
            pub_key_cred_params,
            exclude_list,
            options,
            pin_uv_auth_param,
            pin_uv_auth_protocol,
        })
    }
}

pub struct GetAssertionOptions {
    pub up: bool,
    pub uv: bool,
}

pub struct GetAssertionRequest {
    pub rp_id: String,
    pub client_data_hash: Vec<u8>,
    pub allow_list: Vec<Vec<u8>>,
    pub options: GetAssertionOptions,
    pub pin_uv_auth_param: Option<Vec<u8>>,
    pub pin_uv_auth_protocol: Option<u64>,
}

impl GetAssertionRequest {
    pub fn parse(bytes: &[u8]) -> CborResult<Self> {
        let value = IntMap::parse(bytes)?;
        let map = IntMap::from_value(&value)?;

        let rp_id = map.require_text(1)?;
        let client_data_hash = map.require_bytes(2)?;

        let mut allow_list = Vec::new();
        if let Some(items) = map.get_array(3)? {
            for entry in items {
                let entry_map = IntMap::from_value(entry)?;
                allow_list.push(entry_map.require_bytes_text("id")?);
            }
        }

        let mut options = GetAssertionOptions { up: true, uv: false };
        if let Some(opts) = map.get_map(5)? {
            options.up = opts.get_bool_text("up")?.unwrap_or(true);
            options.uv = opts.get_bool_text("uv")?.unwrap_or(false);
        }

        let pin_uv_auth_param = map.get_bytes(6)?;
        let pin_uv_auth_protocol = map.get_u64(7)?;

        Ok(GetAssertionRequest {
            rp_id,
            client_data_hash,
            allow_list,
            options,
            pin_uv_auth_param,
            pin_uv_auth_protocol,
        })
    }
}

pub struct ClientPinRequest {
    pub pin_uv_auth_protocol: Option<u64>,
    pub sub_command: u64,
    pub key_agreement: Option<(Vec<u8>, Vec<u8>)>,
    pub pin_uv_auth_param: Option<Vec<u8>>,
    pub new_pin_enc: Option<Vec<u8>>,
    pub pin_hash_enc: Option<Vec<u8>>,
    pub permissions: Option<u8>,
    pub rp_id: Option<String>,
}

impl ClientPinRequest {
    pub fn parse(bytes: &[u8]) -> CborResult<Self> {
        let value = IntMap::parse(bytes)?;
        let map = IntMap::from_value(&value)?;

        let pin_uv_auth_protocol = map.get_u64(1)?;
        let sub_command = map.require_u64(2)?;

        let key_agreement = match map.get_map(3)? {
            Some(key_map) => {
                let x = key_map.require_bytes(-2)?;
                let y = key_map.require_bytes(-3)?;
                Some((x, y))
            }
            None => None,
        };

        let pin_uv_auth_param = map.get_bytes(4)?;
        let new_pin_enc = map.get_bytes(5)?;
        let pin_hash_enc = map.get_bytes(6)?;
        let permissions = map.get_u64(9)?.map(|p| p as u8);
        let rp_id = map.get_text(10)?;

        Ok(ClientPinRequest {
            pin_uv_auth_protocol,
            sub_command,
            key_agreement,
            pin_uv_auth_param,
            new_pin_enc,
            pin_hash_enc,
            permissions,
            rp_id,
        })
    }
}
