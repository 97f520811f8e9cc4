//! The CTAP2 status-byte taxonomy (spec.md §6/§7).

use thiserror::Error;

use crate::cbor::CborError;

/// Every way a command can fail, one variant per CTAP2 status byte this
/// authenticator is able to produce. `Other` is the catch-all for failures
/// that are fatal to the request but never to the process (signing failure,
/// storage failure, serialization failure — spec.md §7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CtapError {
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("missing parameter")]
    MissingParameter,
    #[error("invalid CBOR")]
    InvalidCbor,
    #[error("invalid option")]
    InvalidOption,
    #[error("unsupported option")]
    UnsupportedOption,
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("no credentials")]
    NoCredentials,
    #[error("operation denied")]
    OperationDenied,
    #[error("PIN invalid")]
    PinInvalid,
    #[error("PIN blocked")]
    PinBlocked,
    #[error("PIN auth invalid")]
    PinAuthInvalid,
    #[error("PIN auth blocked")]
    PinAuthBlocked,
    #[error("PIN not set")]
    PinNotSet,
    #[error("pinUvAuthToken required")]
    PinUvAuthTokenRequired,
    #[error("PIN policy violation")]
    PinPolicyViolation,
    #[error("pinUvAuthToken expired")]
    PinUvAuthTokenExpired,
    #[error("unauthorized permission")]
    UnauthorizedPermission,
    #[error("not allowed")]
    NotAllowed,
    #[error("other error")]
    Other,
}

impl CtapError {
    /// The single status byte the dispatcher prepends to the response.
    pub fn as_status_byte(self) -> u8 {
        match self {
            CtapError::InvalidCommand => 0x01,
            CtapError::InvalidParameter => 0x02,
            CtapError::MissingParameter => 0x14,
            CtapError::InvalidCbor => 0x11,
            CtapError::InvalidOption => 0x19,
            CtapError::UnsupportedOption => 0x2C,
            CtapError::UnsupportedAlgorithm => 0x26,
            CtapError::NoCredentials => 0x2E,
            CtapError::OperationDenied => 0x30,
            CtapError::PinInvalid => 0x31,
            CtapError::PinBlocked => 0x32,
            CtapError::PinAuthInvalid => 0x33,
            CtapError::PinAuthBlocked => 0x34,
            CtapError::PinNotSet => 0x35,
            CtapError::PinUvAuthTokenRequired => 0x36,
            CtapError::PinPolicyViolation => 0x37,
            CtapError::PinUvAuthTokenExpired => 0x38,
            CtapError::UnauthorizedPermission => 0x40,
            CtapError::NotAllowed => 0x27,
            CtapError::Other => 0x7F,
        }
    }
}

/// A request parse failure maps straight to its wire status: an absent key
/// is `missing_parameter`, anything else (wrong type, truncated/unparseable
/// CBOR, wrong shape) is `invalid_cbor` (spec.md §4.A).
impl From<CborError> for CtapError {
    fn from(err: CborError) -> Self {
        match err {
            CborError::Missing(_) => CtapError::MissingParameter,
            CborError::Invalid(_) => CtapError::InvalidCbor,
        }
    }
}
