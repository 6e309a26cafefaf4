//! Inbound multi-frame reassembly

use super::frame::{next_sequence_number, ProtocolFrame, MAX_FF_DL_12BIT};

/// Upper bound on the buffer reserved up front; larger messages grow as data arrives
const INITIAL_RESERVE: usize = MAX_FF_DL_12BIT + 1;

/// Reassembly progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyStatus {
    Idle,
    InProgress,
    Complete,
    ErrorSequence,
    ErrorUnexpectedFrame,
}

impl ReassemblyStatus {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ReassemblyStatus::ErrorSequence | ReassemblyStatus::ErrorUnexpectedFrame
        )
    }
}

/// Rebuilds one message from a First Frame and its Consecutive Frames
///
/// Error states are terminal: once a sequence or framing error has been
/// reported the instance never reaches `Complete`.
#[derive(Debug)]
pub struct Reassembler {
    status: ReassemblyStatus,
    buffer: Vec<u8>,
    total_size: usize,
    expected_sn: u8,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            status: ReassemblyStatus::Idle,
            buffer: Vec::new(),
            total_size: 0,
            expected_sn: 0,
        }
    }

    pub fn status(&self) -> ReassemblyStatus {
        self.status
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn process_frame(&mut self, frame: &ProtocolFrame) -> ReassemblyStatus {
        self.status = match (self.status, frame) {
            (
                ReassemblyStatus::Idle,
                ProtocolFrame::FirstFrame {
                    total_size,
                    payload,
                },
            ) => {
                self.total_size = *total_size;
                self.buffer = Vec::with_capacity((*total_size).min(INITIAL_RESERVE));
                self.expected_sn = 1;
                self.append(payload)
            }
            (ReassemblyStatus::Idle, _) => ReassemblyStatus::ErrorUnexpectedFrame,
            (
                ReassemblyStatus::InProgress,
                ProtocolFrame::ConsecutiveFrame {
                    sequence_number,
                    payload,
                },
            ) => {
                if *sequence_number != self.expected_sn {
                    tracing::debug!(
                        expected = self.expected_sn,
                        received = sequence_number,
                        "ISO-TP sequence error"
                    );
                    ReassemblyStatus::ErrorSequence
                } else {
                    self.expected_sn = next_sequence_number(self.expected_sn);
                    self.append(payload)
                }
            }
            (ReassemblyStatus::InProgress, _) => ReassemblyStatus::ErrorUnexpectedFrame,
            (terminal, _) => terminal,
        };
        self.status
    }

    fn append(&mut self, data: &[u8]) -> ReassemblyStatus {
        let remaining = self.total_size - self.buffer.len();
        let take = remaining.min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        if self.buffer.len() == self.total_size {
            ReassemblyStatus::Complete
        } else {
            ReassemblyStatus::InProgress
        }
    }

    /// The reassembled message, available once `Complete`
    pub fn payload(&self) -> Option<&[u8]> {
        (self.status == ReassemblyStatus::Complete).then_some(self.buffer.as_slice())
    }

    pub fn into_payload(self) -> Option<Vec<u8>> {
        (self.status == ReassemblyStatus::Complete).then_some(self.buffer)
    }
}
