//! ISO-TP protocol frames and their CAN encoding

use std::time::Duration;

use crate::config::CanType;
use crate::transport::CanFrame;

const SF_PCI: u8 = 0x00; // Single Frame
const FF_PCI: u8 = 0x10; // First Frame
const CF_PCI: u8 = 0x20; // Consecutive Frame
const FC_PCI: u8 = 0x30; // Flow Control

/// Largest First Frame length expressible in the 12-bit form
pub const MAX_FF_DL_12BIT: usize = 0xFFF;

/// Valid CAN FD payload lengths above 8 bytes
const FD_LENGTHS: [usize; 7] = [12, 16, 20, 24, 32, 48, 64];

/// Flow control status nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowStatus {
    Continue = 0,
    Wait = 1,
    Overflow = 2,
}

impl FlowStatus {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(FlowStatus::Continue),
            1 => Some(FlowStatus::Wait),
            2 => Some(FlowStatus::Overflow),
            _ => None,
        }
    }
}

/// One ISO-TP protocol data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFrame {
    SingleFrame {
        payload: Vec<u8>,
    },
    FirstFrame {
        /// Length of the complete message
        total_size: usize,
        /// Leading bytes carried in the First Frame itself
        payload: Vec<u8>,
    },
    ConsecutiveFrame {
        sequence_number: u8,
        /// May include trailing padding; the reassembler clips it
        payload: Vec<u8>,
    },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        /// Raw STmin byte; see [`separation_time`]
        st_min: u8,
    },
}

impl ProtocolFrame {
    pub fn single(payload: impl Into<Vec<u8>>) -> Self {
        ProtocolFrame::SingleFrame {
            payload: payload.into(),
        }
    }

    pub fn flow_control(status: FlowStatus, block_size: u8, st_min: u8) -> Self {
        ProtocolFrame::FlowControl {
            status,
            block_size,
            st_min,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolFrame::SingleFrame { .. } => "SF",
            ProtocolFrame::FirstFrame { .. } => "FF",
            ProtocolFrame::ConsecutiveFrame { .. } => "CF",
            ProtocolFrame::FlowControl { .. } => "FC",
        }
    }
}

/// Sequence number following `sn`, wrapping 15 -> 0
pub fn next_sequence_number(sn: u8) -> u8 {
    sn.wrapping_add(1) & 0x0F
}

/// Interpret a raw STmin byte received in a Flow Control frame
///
/// 0x00..=0x7F are milliseconds. The 100..900 us range (0xF1..=0xF9) is
/// rounded up to 1 ms. Reserved values are treated as the 127 ms maximum.
pub fn separation_time(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(u64::from(raw)),
        0xF1..=0xF9 => Duration::from_millis(1),
        _ => Duration::from_millis(0x7F),
    }
}

/// Smallest valid CAN FD payload length holding `len` bytes
fn fd_frame_len(len: usize) -> usize {
    if len <= 8 {
        return len;
    }
    FD_LENGTHS
        .iter()
        .copied()
        .find(|l| *l >= len)
        .unwrap_or(64)
}

/// Encode a protocol frame into a CAN frame
///
/// Callers are responsible for sizing payloads to fit `can_type`; the
/// segmenter and transaction guarantee this. Bytes beyond the PCI and data
/// are filled with `pad_byte` up to `pad_size`, and FD frames are further
/// rounded up to the next valid FD length.
pub fn build(
    frame: &ProtocolFrame,
    target_id: u32,
    can_type: CanType,
    pad_size: u8,
    pad_byte: u8,
) -> CanFrame {
    let fd = can_type == CanType::Fd;
    let mut data = Vec::with_capacity(can_type.max_frame_len());

    match frame {
        ProtocolFrame::SingleFrame { payload } => {
            let escape = fd && (payload.len() > 7 || usize::from(pad_size) > 8);
            if escape {
                data.push(SF_PCI);
                data.push(payload.len() as u8);
            } else {
                data.push(SF_PCI | (payload.len() as u8 & 0x0F));
            }
            data.extend_from_slice(payload);
        }
        ProtocolFrame::FirstFrame {
            total_size,
            payload,
        } => {
            if *total_size <= MAX_FF_DL_12BIT {
                data.push(FF_PCI | ((*total_size >> 8) as u8 & 0x0F));
                data.push((*total_size & 0xFF) as u8);
            } else {
                data.push(FF_PCI);
                data.push(0x00);
                data.extend_from_slice(&(*total_size as u32).to_be_bytes());
            }
            data.extend_from_slice(payload);
        }
        ProtocolFrame::ConsecutiveFrame {
            sequence_number,
            payload,
        } => {
            data.push(CF_PCI | (sequence_number & 0x0F));
            data.extend_from_slice(payload);
        }
        ProtocolFrame::FlowControl {
            status,
            block_size,
            st_min,
        } => {
            data.push(FC_PCI | *status as u8);
            data.push(*block_size);
            data.push(*st_min);
        }
    }

    let pad_to = usize::from(pad_size).min(can_type.max_frame_len());
    if data.len() < pad_to {
        data.resize(pad_to, pad_byte);
    }
    if fd {
        let len = fd_frame_len(data.len());
        data.resize(len, pad_byte);
    }

    CanFrame {
        id: target_id,
        data,
        fd,
    }
}

/// Decode a CAN frame into a protocol frame
///
/// Returns `None` for an unknown PCI type or when the announced length does
/// not fit the frame.
pub fn parse(frame: &CanFrame) -> Option<ProtocolFrame> {
    let data = frame.data.as_slice();
    let pci = *data.first()?;

    match pci & 0xF0 {
        SF_PCI => {
            let nibble = usize::from(pci & 0x0F);
            let (offset, len) = if nibble == 0 {
                // Escape form: length in the second byte (CAN FD only)
                let len = usize::from(*data.get(1)?);
                if data.len() <= 8 || len == 0 {
                    return None;
                }
                (2, len)
            } else {
                if data.len() > 8 || nibble > 7 {
                    return None;
                }
                (1, nibble)
            };
            let payload = data.get(offset..offset + len)?;
            Some(ProtocolFrame::SingleFrame {
                payload: payload.to_vec(),
            })
        }
        FF_PCI => {
            let short_len = (usize::from(pci & 0x0F) << 8) | usize::from(*data.get(1)?);
            let (offset, total_size) = if short_len == 0 {
                // Escape form: 32-bit length, CAN FD only, above the 12-bit range
                if data.len() <= 8 {
                    return None;
                }
                let raw: [u8; 4] = data.get(2..6)?.try_into().ok()?;
                let total_size = u32::from_be_bytes(raw) as usize;
                if total_size <= MAX_FF_DL_12BIT {
                    return None;
                }
                (6, total_size)
            } else {
                (2, short_len)
            };
            if total_size == 0 {
                return None;
            }
            Some(ProtocolFrame::FirstFrame {
                total_size,
                payload: data[offset..].to_vec(),
            })
        }
        CF_PCI => Some(ProtocolFrame::ConsecutiveFrame {
            sequence_number: pci & 0x0F,
            payload: data[1..].to_vec(),
        }),
        FC_PCI => {
            let status = FlowStatus::from_nibble(pci & 0x0F)?;
            Some(ProtocolFrame::FlowControl {
                status,
                block_size: *data.get(1)?,
                st_min: *data.get(2)?,
            })
        }
        _ => None,
    }
}
