//! Outbound multi-frame segmentation

use super::frame::{next_sequence_number, ProtocolFrame, MAX_FF_DL_12BIT};
use super::IsoTpError;
use crate::config::CanType;

/// Splits one payload into a First Frame followed by Consecutive Frames
#[derive(Debug)]
pub struct Segmenter {
    payload: Vec<u8>,
    can_type: CanType,
    offset: usize,
    next_sn: u8,
    first_sent: bool,
}

impl Segmenter {
    pub fn new(payload: Vec<u8>, total_size: usize, can_type: CanType) -> Result<Self, IsoTpError> {
        let max = can_type.max_payload_len();
        if total_size > max {
            return Err(IsoTpError::PayloadTooLarge {
                size: total_size,
                max,
            });
        }
        if total_size != payload.len() {
            return Err(IsoTpError::SizeMismatch {
                total_size,
                actual: payload.len(),
            });
        }

        Ok(Self {
            payload,
            can_type,
            offset: 0,
            next_sn: 1,
            first_sent: false,
        })
    }

    pub fn total_size(&self) -> usize {
        self.payload.len()
    }

    /// Data bytes carried by the First Frame
    fn first_frame_capacity(&self) -> usize {
        match self.can_type {
            CanType::Classic => 6,
            CanType::Fd if self.payload.len() <= MAX_FF_DL_12BIT => 62,
            CanType::Fd => 58,
        }
    }

    /// Data bytes carried by each Consecutive Frame
    fn consecutive_frame_capacity(&self) -> usize {
        self.can_type.max_frame_len() - 1
    }

    /// Next frame to transmit, or `None` once every byte has been emitted
    pub fn get_next_frame(&mut self) -> Option<ProtocolFrame> {
        if !self.first_sent {
            self.first_sent = true;
            let end = self.first_frame_capacity().min(self.payload.len());
            self.offset = end;
            return Some(ProtocolFrame::FirstFrame {
                total_size: self.payload.len(),
                payload: self.payload[..end].to_vec(),
            });
        }

        if self.is_done() {
            return None;
        }

        let end = (self.offset + self.consecutive_frame_capacity()).min(self.payload.len());
        let frame = ProtocolFrame::ConsecutiveFrame {
            sequence_number: self.next_sn,
            payload: self.payload[self.offset..end].to_vec(),
        };
        self.offset = end;
        self.next_sn = next_sequence_number(self.next_sn);
        Some(frame)
    }

    pub fn is_done(&self) -> bool {
        self.first_sent && self.offset >= self.payload.len()
    }
}
