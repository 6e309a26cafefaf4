//! Result codes and error types
//!
//! The [`Service`](crate::Service) façade reports every runtime outcome as a
//! [`ResultCode`]; the remaining error enums cover construction-time and
//! configuration failures and are mapped onto result codes at the boundary.

use thiserror::Error;

/// Stable result codes returned to callers of the service API
///
/// The integer values are part of the public contract and never change.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    #[error("OK")]
    Ok = 0,

    #[error("Invalid parameter")]
    InvalidParam = -1,

    #[error("Internal error")]
    InternalError = -2,

    #[error("Failed to send CAN frame")]
    SendFailed = -3,

    /// No response within N_As (P2)
    #[error("Timeout waiting for response (N_As)")]
    TimeoutA = -4,

    #[error("Timeout waiting for flow control (N_Bs)")]
    TimeoutBs = -5,

    #[error("Timeout waiting for consecutive frame (N_Cr)")]
    TimeoutCr = -6,

    /// No final response within N_Ar (P2*) after a response-pending reply
    #[error("Timeout waiting for response after NRC 0x78 (P2*)")]
    TimeoutP2Star = -7,

    #[error("Flow control overflow reported by receiver")]
    FcOverflow = -8,

    #[error("Consecutive frame sequence error")]
    SequenceError = -9,

    #[error("Unexpected frame")]
    UnexpectedFrame = -10,

    #[error("Payload too large for the transport protocol")]
    PayloadTooLarge = -11,

    #[error("Negative response from ECU")]
    NegativeResponse = -12,

    #[error("Response-pending (NRC 0x78) limit exceeded")]
    Nrc78LimitExceeded = -13,

    #[error("Aborted")]
    Aborted = -14,

    #[error("Request queue full")]
    QueueFull = -15,

    #[error("No response in queue")]
    NoResponseInQueue = -16,

    #[error("Invalid security seed")]
    SecurityInvalidSeed = -17,

    #[error("Security algorithm configuration failed")]
    SecurityConfigFailed = -18,

    #[error("Configuration failed")]
    ConfigFailed = -19,

    #[error("Frame logger configuration failed")]
    ConfigLoggerFailed = -20,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }

    /// All codes, in declaration order
    pub const ALL: [ResultCode; 21] = [
        ResultCode::Ok,
        ResultCode::InvalidParam,
        ResultCode::InternalError,
        ResultCode::SendFailed,
        ResultCode::TimeoutA,
        ResultCode::TimeoutBs,
        ResultCode::TimeoutCr,
        ResultCode::TimeoutP2Star,
        ResultCode::FcOverflow,
        ResultCode::SequenceError,
        ResultCode::UnexpectedFrame,
        ResultCode::PayloadTooLarge,
        ResultCode::NegativeResponse,
        ResultCode::Nrc78LimitExceeded,
        ResultCode::Aborted,
        ResultCode::QueueFull,
        ResultCode::NoResponseInQueue,
        ResultCode::SecurityInvalidSeed,
        ResultCode::SecurityConfigFailed,
        ResultCode::ConfigFailed,
        ResultCode::ConfigLoggerFailed,
    ];
}

impl From<ResultCode> for i32 {
    fn from(code: ResultCode) -> Self {
        code as i32
    }
}

impl TryFrom<i32> for ResultCode {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        ResultCode::ALL
            .iter()
            .copied()
            .find(|code| *code as i32 == value)
            .ok_or(value)
    }
}

/// Configuration parse/validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Construction-time errors for a transaction
///
/// These indicate programmer error (a request that can never be sent), not
/// a transport failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Request payload is empty")]
    EmptyPayload,
}

/// Seed/key derivation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("No security algorithm configured")]
    Unconfigured,

    #[error("Invalid security algorithm configuration: {0}")]
    InvalidConfig(String),

    #[error("Seed is empty")]
    EmptySeed,
}

impl From<SecurityError> for ResultCode {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::Unconfigured | SecurityError::InvalidConfig(_) => {
                ResultCode::SecurityConfigFailed
            }
            SecurityError::EmptySeed => ResultCode::SecurityInvalidSeed,
        }
    }
}

impl From<TransactionError> for ResultCode {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::EmptyPayload => ResultCode::InvalidParam,
        }
    }
}
