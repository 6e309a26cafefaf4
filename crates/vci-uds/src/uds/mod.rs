//! UDS (ISO 14229) request/response layer
//!
//! [`Transaction`] runs one physical request/response exchange over ISO-TP.
//! [`FunctionalTransaction`] broadcasts a request and collects every
//! single-frame reply that arrives before the bus goes quiet.

mod functional;
mod nrc;
mod transaction;

pub use functional::{FunctionalResponse, FunctionalTransaction};
pub use nrc::NegativeResponseCode;
pub use transaction::{Transaction, TransactionResult, TransactionState};

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Added to a request SID to form the positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Positive response SID for a request SID
pub fn positive_response_sid(service_id: u8) -> u8 {
    service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET)
}

pub fn is_negative_response(payload: &[u8]) -> bool {
    payload.first() == Some(&service_id::NEGATIVE_RESPONSE)
}

/// `[0x7F, sid, 0x78]`: the ECU needs more time
pub fn is_response_pending(payload: &[u8]) -> bool {
    matches!(payload, [service_id::NEGATIVE_RESPONSE, _, nrc]
        if NegativeResponseCode::from(*nrc) == NegativeResponseCode::ResponsePending)
}

/// NRC carried by a negative response, if any
pub fn negative_response_code(payload: &[u8]) -> Option<NegativeResponseCode> {
    match payload {
        [service_id::NEGATIVE_RESPONSE, _, nrc, ..] => Some(NegativeResponseCode::from(*nrc)),
        _ => None,
    }
}
