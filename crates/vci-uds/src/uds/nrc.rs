//! UDS Negative Response Codes (NRC)

use std::fmt;

/// Negative response codes the engine and its callers act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    /// 0x78: request received, final response will follow
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    /// Any code without a dedicated variant
    Other(u8),
}

const TABLE: [(u8, NegativeResponseCode); 15] = [
    (0x10, NegativeResponseCode::GeneralReject),
    (0x11, NegativeResponseCode::ServiceNotSupported),
    (0x12, NegativeResponseCode::SubFunctionNotSupported),
    (0x13, NegativeResponseCode::IncorrectMessageLengthOrFormat),
    (0x21, NegativeResponseCode::BusyRepeatRequest),
    (0x22, NegativeResponseCode::ConditionsNotCorrect),
    (0x24, NegativeResponseCode::RequestSequenceError),
    (0x31, NegativeResponseCode::RequestOutOfRange),
    (0x33, NegativeResponseCode::SecurityAccessDenied),
    (0x35, NegativeResponseCode::InvalidKey),
    (0x36, NegativeResponseCode::ExceededNumberOfAttempts),
    (0x37, NegativeResponseCode::RequiredTimeDelayNotExpired),
    (0x78, NegativeResponseCode::ResponsePending),
    (0x7E, NegativeResponseCode::SubFunctionNotSupportedInActiveSession),
    (0x7F, NegativeResponseCode::ServiceNotSupportedInActiveSession),
];

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        TABLE
            .iter()
            .find(|(code, _)| *code == value)
            .map(|(_, nrc)| *nrc)
            .unwrap_or(Self::Other(value))
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        match nrc {
            NegativeResponseCode::Other(v) => v,
            known => TABLE
                .iter()
                .find(|(_, n)| *n == known)
                .map(|(code, _)| *code)
                .unwrap_or_default(),
        }
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(v) => write!(f, "Other(0x{:02X})", v),
            known => write!(f, "{:?}", known),
        }
    }
}
