//! Session, security and logging configuration
//!
//! A [`SessionContext`] is an immutable snapshot: every transaction captures
//! the `Arc` that was current when it started, and configuration updates
//! replace the whole snapshot rather than mutating it.
//!
//! Configuration is expressed as TOML. Updates arrive as partial documents
//! ([`SessionContextPatch`]) so a caller can change a single timing value
//! without restating the rest of the context.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Highest valid 29-bit CAN identifier
pub const MAX_CAN_ID: u32 = 0x1FFF_FFFF;

/// Default capacity of each asynchronous request queue
pub const REQUEST_QUEUE_SIZE: usize = 64;

/// Idle period after which an asynchronous worker thread exits
pub const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Upper bound on a single blocking receive, and thus on abort latency
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// CAN type
// =============================================================================

/// Classic CAN (8-byte frames) or CAN FD (up to 64-byte frames)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanType {
    #[default]
    Classic,
    Fd,
}

impl CanType {
    /// Largest CAN payload for this frame type
    pub fn max_frame_len(self) -> usize {
        match self {
            CanType::Classic => 8,
            CanType::Fd => 64,
        }
    }

    /// Largest request that fits in one Single Frame
    pub fn single_frame_capacity(self) -> usize {
        match self {
            CanType::Classic => 7,
            CanType::Fd => 62,
        }
    }

    /// Largest payload a First Frame can announce
    pub fn max_payload_len(self) -> usize {
        match self {
            CanType::Classic => 0xFFF,
            CanType::Fd => u32::MAX as usize,
        }
    }
}

// =============================================================================
// Session context
// =============================================================================

/// Everything a transaction needs to know about the link it runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Physical request CAN ID (tester -> ECU)
    pub request_id: u32,
    /// Physical response CAN ID (ECU -> tester)
    pub response_id: u32,
    /// Functional (broadcast) request CAN ID
    #[serde(default = "default_functional_id")]
    pub functional_id: u32,
    #[serde(default)]
    pub can_type: CanType,
    /// Pad outgoing frames to this many bytes (0 = no padding)
    #[serde(default = "default_padding_size")]
    pub padding_size: u8,
    #[serde(default = "default_padding_byte")]
    pub padding_byte: u8,
    /// Largest multi-frame response accepted; longer announcements get FC Overflow
    #[serde(default = "default_max_response_size")]
    pub max_response_size: u32,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub tester_present: TesterPresentConfig,
}

fn default_functional_id() -> u32 {
    0x7DF
}

fn default_padding_size() -> u8 {
    8
}

fn default_padding_byte() -> u8 {
    0xCC
}

fn default_max_response_size() -> u32 {
    1024 * 1024
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            request_id: 0x7E0,
            response_id: 0x7E8,
            functional_id: default_functional_id(),
            can_type: CanType::default(),
            padding_size: default_padding_size(),
            padding_byte: default_padding_byte(),
            max_response_size: default_max_response_size(),
            timing: TimingConfig::default(),
            tester_present: TesterPresentConfig::default(),
        }
    }
}

/// ISO-TP and UDS timing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Response timeout (P2) in milliseconds
    #[serde(default = "default_n_as")]
    pub n_as_ms: u64,
    /// Extended response timeout (P2*) after NRC 0x78, in milliseconds
    #[serde(default = "default_n_ar")]
    pub n_ar_ms: u64,
    /// Flow control wait timeout in milliseconds
    #[serde(default = "default_n_bs")]
    pub n_bs_ms: u64,
    /// Consecutive frame wait timeout in milliseconds
    #[serde(default = "default_n_cr")]
    pub n_cr_ms: u64,
    /// Block size we advertise in our own flow control frames
    #[serde(default)]
    pub block_size: u8,
    /// STmin we advertise in our own flow control frames (raw ISO-TP value)
    #[serde(default)]
    pub st_min: u8,
    /// Maximum number of NRC 0x78 replies tolerated per request
    #[serde(default = "default_max_nrc78_count")]
    pub max_nrc78_count: u32,
    /// Silence window that ends a functional exchange, in milliseconds
    #[serde(default = "default_functional_silence")]
    pub functional_silence_ms: u64,
}

fn default_n_as() -> u64 {
    1000
}

fn default_n_ar() -> u64 {
    5000
}

fn default_n_bs() -> u64 {
    1000
}

fn default_n_cr() -> u64 {
    1000
}

fn default_max_nrc78_count() -> u32 {
    10
}

fn default_functional_silence() -> u64 {
    1000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            n_as_ms: default_n_as(),
            n_ar_ms: default_n_ar(),
            n_bs_ms: default_n_bs(),
            n_cr_ms: default_n_cr(),
            block_size: 0,
            st_min: 0,
            max_nrc78_count: default_max_nrc78_count(),
            functional_silence_ms: default_functional_silence(),
        }
    }
}

impl TimingConfig {
    pub fn n_as(&self) -> Duration {
        Duration::from_millis(self.n_as_ms)
    }

    pub fn n_ar(&self) -> Duration {
        Duration::from_millis(self.n_ar_ms)
    }

    pub fn n_bs(&self) -> Duration {
        Duration::from_millis(self.n_bs_ms)
    }

    pub fn n_cr(&self) -> Duration {
        Duration::from_millis(self.n_cr_ms)
    }

    pub fn functional_silence(&self) -> Duration {
        Duration::from_millis(self.functional_silence_ms)
    }
}

/// Tester Present keep-alive settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesterPresentConfig {
    /// Keep-alive interval in milliseconds (0 disables the keep-alive)
    #[serde(default = "default_tester_present_interval")]
    pub interval_ms: u64,
    /// CAN ID for Tester Present frames (0 = use the request ID)
    #[serde(default)]
    pub id: u32,
    /// Sub-function byte (0x80 = suppress positive response)
    #[serde(default = "default_tester_present_sub_function")]
    pub sub_function: u8,
}

fn default_tester_present_interval() -> u64 {
    2000
}

fn default_tester_present_sub_function() -> u8 {
    0x80
}

impl Default for TesterPresentConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_tester_present_interval(),
            id: 0,
            sub_function: default_tester_present_sub_function(),
        }
    }
}

impl TesterPresentConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SessionContext {
    /// Parse a complete context from TOML and validate it
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let context: SessionContext = toml::from_str(text)?;
        context.validate()?;
        Ok(context)
    }

    /// CAN ID used for Tester Present frames
    pub fn tester_present_target(&self) -> u32 {
        if self.tester_present.id != 0 {
            self.tester_present.id
        } else {
            self.request_id
        }
    }

    /// Check the context for values that would make every transaction fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, id) in [
            ("request_id", self.request_id),
            ("response_id", self.response_id),
            ("functional_id", self.functional_id),
            ("tester_present.id", self.tester_present.id),
        ] {
            if id > MAX_CAN_ID {
                return Err(ConfigError::Invalid(format!(
                    "{name} 0x{id:X} exceeds 29-bit CAN ID range"
                )));
            }
        }

        if self.request_id == self.response_id {
            return Err(ConfigError::Invalid(format!(
                "request_id and response_id are both 0x{:X}",
                self.request_id
            )));
        }

        let t = &self.timing;
        for (name, value) in [
            ("n_as_ms", t.n_as_ms),
            ("n_ar_ms", t.n_ar_ms),
            ("n_bs_ms", t.n_bs_ms),
            ("n_cr_ms", t.n_cr_ms),
            ("functional_silence_ms", t.functional_silence_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        if self.max_response_size == 0 {
            return Err(ConfigError::Invalid(
                "max_response_size must be non-zero".to_string(),
            ));
        }

        if usize::from(self.padding_size) > self.can_type.max_frame_len() {
            return Err(ConfigError::Invalid(format!(
                "padding_size {} exceeds {} bytes for {:?} CAN",
                self.padding_size,
                self.can_type.max_frame_len(),
                self.can_type
            )));
        }

        if !matches!(t.st_min, 0x00..=0x7F | 0xF1..=0xF9) {
            return Err(ConfigError::Invalid(format!(
                "st_min 0x{:02X} is a reserved value",
                t.st_min
            )));
        }

        Ok(())
    }

    /// Apply a partial TOML update to a copy of this context
    ///
    /// Returns `Ok(None)` when the text contains no settings at all.
    pub fn patched(&self, text: &str) -> Result<Option<Self>, ConfigError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let patch: SessionContextPatch = toml::from_str(text)?;
        if patch.is_empty() {
            return Ok(None);
        }

        let mut next = self.clone();
        patch.apply(&mut next);
        next.validate()?;
        Ok(Some(next))
    }
}

// =============================================================================
// Partial updates
// =============================================================================

/// Partial session context update, every field optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionContextPatch {
    pub request_id: Option<u32>,
    pub response_id: Option<u32>,
    pub functional_id: Option<u32>,
    pub can_type: Option<CanType>,
    pub padding_size: Option<u8>,
    pub padding_byte: Option<u8>,
    pub max_response_size: Option<u32>,
    #[serde(default)]
    pub timing: TimingPatch,
    #[serde(default)]
    pub tester_present: TesterPresentPatch,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingPatch {
    pub n_as_ms: Option<u64>,
    pub n_ar_ms: Option<u64>,
    pub n_bs_ms: Option<u64>,
    pub n_cr_ms: Option<u64>,
    pub block_size: Option<u8>,
    pub st_min: Option<u8>,
    pub max_nrc78_count: Option<u32>,
    pub functional_silence_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TesterPresentPatch {
    pub interval_ms: Option<u64>,
    pub id: Option<u32>,
    pub sub_function: Option<u8>,
}

fn set<T>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

impl SessionContextPatch {
    fn is_empty(&self) -> bool {
        self.clone().apply(&mut SessionContext::default()) == 0
    }

    /// Apply every present field, returning how many were set
    fn apply(self, ctx: &mut SessionContext) -> usize {
        let t = self.timing;
        let tp = self.tester_present;
        [
            set(&mut ctx.request_id, self.request_id),
            set(&mut ctx.response_id, self.response_id),
            set(&mut ctx.functional_id, self.functional_id),
            set(&mut ctx.can_type, self.can_type),
            set(&mut ctx.padding_size, self.padding_size),
            set(&mut ctx.padding_byte, self.padding_byte),
            set(&mut ctx.max_response_size, self.max_response_size),
            set(&mut ctx.timing.n_as_ms, t.n_as_ms),
            set(&mut ctx.timing.n_ar_ms, t.n_ar_ms),
            set(&mut ctx.timing.n_bs_ms, t.n_bs_ms),
            set(&mut ctx.timing.n_cr_ms, t.n_cr_ms),
            set(&mut ctx.timing.block_size, t.block_size),
            set(&mut ctx.timing.st_min, t.st_min),
            set(&mut ctx.timing.max_nrc78_count, t.max_nrc78_count),
            set(&mut ctx.timing.functional_silence_ms, t.functional_silence_ms),
            set(&mut ctx.tester_present.interval_ms, tp.interval_ms),
            set(&mut ctx.tester_present.id, tp.id),
            set(&mut ctx.tester_present.sub_function, tp.sub_function),
        ]
        .into_iter()
        .filter(|hit| *hit)
        .count()
    }
}

// =============================================================================
// Security algorithm configuration
// =============================================================================

/// CRC variants available to the CRC-based key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrcVariant {
    Crc16CcittFalse,
    Crc16Modbus,
    Crc16Xmodem,
    Crc32,
    Crc32Mpeg2,
}

/// Seed/key algorithm selection and parameters
///
/// The engine treats this as opaque input to a
/// [`SecurityProvider`](crate::security::SecurityProvider).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum SecurityAlgoConfig {
    /// No algorithm configured; security access fails with a config error
    #[default]
    None,
    /// key[i] = seed[i] ^ secret[i % secret.len()]
    Xor {
        /// Shared secret as a hex string (e.g. "deadbeef")
        secret: String,
    },
    /// key = CRC(seed ++ secret ++ level), big-endian
    Crc {
        variant: CrcVariant,
        #[serde(default)]
        secret: String,
    },
}

impl SecurityAlgoConfig {
    /// Parse a security configuration from TOML
    ///
    /// Returns `Ok(None)` for blank input.
    pub fn from_toml(text: &str) -> Result<Option<Self>, ConfigError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(toml::from_str(text)?))
    }
}

// =============================================================================
// Frame log configuration
// =============================================================================

/// Communicator frame log settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub enabled: bool,
    /// Log file path; the communicator picks a default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl LogConfig {
    /// Returns `Ok(None)` for blank input.
    pub fn from_toml(text: &str) -> Result<Option<Self>, ConfigError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(toml::from_str(text)?))
    }
}

// =============================================================================
// Service options
// =============================================================================

/// Tunables for the service façade that are not part of the session
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Outstanding asynchronous requests allowed per pipeline
    pub request_queue_size: usize,
    /// Idle period after which a worker thread exits
    pub worker_idle_timeout: Duration,
    /// Receive chunk used by every transaction wait
    pub poll_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            request_queue_size: REQUEST_QUEUE_SIZE,
            worker_idle_timeout: WORKER_IDLE_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }
}
