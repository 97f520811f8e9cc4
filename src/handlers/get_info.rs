//! `authenticatorGetInfo` (0x04) — spec.md §4.E.

use ciborium::Value;

use crate::cbor;
use crate::dispatcher::HandlerOutcome;
use crate::error::CtapError;
use crate::state::PublicBlob;
use crate::Authenticator;

pub fn handle(auth: &Authenticator, blob: &PublicBlob) -> HandlerOutcome {
    let versions = Value::Array(vec![Value::Text("FIDO_2_1".to_string())]);
    let extensions = Value::Array(vec![]);
    let aaguid = Value::Bytes(auth.config.aaguid.to_vec());
    let options = Value::Map(vec![
        (Value::Text("plat".to_string()), Value::Bool(false)),
        (Value::Text("rk".to_string()), Value::Bool(false)),
        (Value::Text("clientPin".to_string()), Value::Bool(true)),
        (Value::Text("up".to_string()), Value::Bool(true)),
        (Value::Text("pinUvAuthToken".to_string()), Value::Bool(true)),
    ]);
    let pin_protocols = Value::Array(vec![Value::Integer(2.into())]);

    let mut entries = vec![
        (cbor::int(1), versions),
        (cbor::int(2), extensions),
        (cbor::int(3), aaguid),
        (cbor::int(4), options),
        (cbor::int(6), pin_protocols),
    ];

    if blob.force_pin_change == Some(true) {
        entries.push((cbor::int(14), Value::Bool(true)));
    }

    match cbor::encode_map(entries) {
        Ok(body) => (Ok(body), None),
        Err(err) => {
            log::error!("failed to encode getInfo response: {err:#}");
            (Err(CtapError::Other), None)
        }
    }
}
