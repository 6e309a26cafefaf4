//! Communicator trait and CAN frame type

use std::time::Duration;

use super::TransportError;
use crate::config::LogConfig;

/// One CAN or CAN FD frame as seen on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanFrame {
    /// 11-bit or 29-bit identifier
    pub id: u32,
    /// Raw payload, 0..=8 bytes (classic) or a valid FD length up to 64
    pub data: Vec<u8>,
    /// Transmit as a CAN FD frame
    pub fd: bool,
}

impl CanFrame {
    pub fn new(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
            fd: false,
        }
    }

    pub fn new_fd(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
            fd: true,
        }
    }
}

/// Bus access used by transactions
///
/// Implementations must tolerate two concurrent callers: the holder of the
/// physical transaction lock and the holder of the functional transaction
/// lock.
pub trait Communicator: Send + Sync {
    /// Transmit one frame; `false` means the frame was not sent
    fn send(&self, frame: &CanFrame) -> bool;

    /// Wait up to `timeout` for the next received frame
    fn receive(&self, timeout: Duration) -> Option<CanFrame>;

    /// Drop any frames buffered from before the current exchange
    fn clear_receiver(&self) {}

    /// Start logging bus traffic
    fn open_log(&self, _config: &LogConfig) -> Result<(), TransportError> {
        Ok(())
    }

    fn close_log(&self) {}

    /// Release the underlying bus; called once at service teardown
    fn shutdown(&self) {}
}
