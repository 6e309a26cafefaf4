//! ISO-TP (ISO 15765-2) segmentation
//!
//! - [`frame`]: protocol frame type and the CAN payload codec
//! - [`Segmenter`]: splits an outbound payload into First + Consecutive Frames
//! - [`Reassembler`]: rebuilds an inbound payload from First + Consecutive Frames
//!
//! Sequence numbers follow ISO 15765-2: the First Frame implicitly carries
//! SN 0 and Consecutive Frames count 1, 2, ... 15, 0, 1, ... Both halves use
//! [`next_sequence_number`] so they cannot drift apart.

pub mod frame;
mod reassembler;
mod segmenter;

pub use frame::{
    build, next_sequence_number, parse, separation_time, FlowStatus, ProtocolFrame,
};
pub use reassembler::{ReassemblyStatus, Reassembler};
pub use segmenter::Segmenter;

use thiserror::Error;

use crate::error::ResultCode;

/// Segmentation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    #[error("Payload of {size} bytes exceeds the {max} byte protocol maximum")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Announced size {total_size} does not match payload length {actual}")]
    SizeMismatch { total_size: usize, actual: usize },
}

impl From<IsoTpError> for ResultCode {
    fn from(err: IsoTpError) -> Self {
        match err {
            IsoTpError::PayloadTooLarge { .. } => ResultCode::PayloadTooLarge,
            IsoTpError::SizeMismatch { .. } => ResultCode::InvalidParam,
        }
    }
}
