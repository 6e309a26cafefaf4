//! ECU-side ISO-TP endpoint
//!
//! Wraps a [`SimulatedEcu`] with the transport half of an ECU: it reassembles
//! multi-frame requests (sending flow control on its own block size) and
//! segments multi-frame responses (waiting for the tester's flow control).

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};
use vci_uds::isotp::{build, parse, FlowStatus, ProtocolFrame, ReassemblyStatus, Reassembler, Segmenter};
use vci_uds::{CanFrame, CanType};

use crate::config::EcuConfig;
use crate::ecu::SimulatedEcu;

/// Padding used on every frame the ECU transmits
const PAD_BYTE: u8 = 0xAA;

/// Outbound multi-frame transfer awaiting flow control
struct Transmit {
    segmenter: Segmenter,
}

/// Inbound multi-frame transfer
struct Receive {
    reassembler: Reassembler,
    in_block: u32,
}

pub struct EcuNode {
    ecu: Arc<SimulatedEcu>,
    request_id: u32,
    response_id: u32,
    functional_id: u32,
    can_type: CanType,
    block_size: u8,
    st_min: u8,
    rx: Option<Receive>,
    tx: Option<Transmit>,
    /// Messages waiting behind an unfinished multi-frame response
    outbox: VecDeque<Vec<u8>>,
}

impl EcuNode {
    pub fn new(ecu: Arc<SimulatedEcu>, config: &EcuConfig) -> Self {
        Self {
            ecu,
            request_id: config.request_id,
            response_id: config.response_id,
            functional_id: config.functional_id,
            can_type: config.can_type,
            block_size: config.block_size,
            st_min: config.st_min,
            rx: None,
            tx: None,
            outbox: VecDeque::new(),
        }
    }

    pub fn ecu(&self) -> &Arc<SimulatedEcu> {
        &self.ecu
    }

    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    /// Handle one frame seen on the bus; returns the frames the ECU transmits
    pub fn on_frame(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        if frame.id == self.request_id {
            self.on_physical(frame)
        } else if frame.id == self.functional_id {
            self.on_functional(frame)
        } else {
            Vec::new()
        }
    }

    fn on_physical(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        let Some(pdu) = parse(frame) else {
            debug!(ecu = self.ecu.name(), data = ?frame.data, "Ignoring malformed frame");
            return Vec::new();
        };

        match pdu {
            ProtocolFrame::SingleFrame { payload } => {
                self.rx = None;
                self.respond(&payload)
            }
            ProtocolFrame::FirstFrame { total_size, .. } => {
                let mut reassembler = Reassembler::new();
                reassembler.process_frame(&pdu);
                debug!(ecu = self.ecu.name(), total_size, "Receiving multi-frame request");
                self.rx = Some(Receive {
                    reassembler,
                    in_block: 0,
                });
                vec![self.flow_control()]
            }
            ProtocolFrame::ConsecutiveFrame { .. } => self.on_consecutive(&pdu),
            ProtocolFrame::FlowControl { status, block_size, .. } => {
                self.on_flow_control(status, block_size)
            }
        }
    }

    fn on_consecutive(&mut self, pdu: &ProtocolFrame) -> Vec<CanFrame> {
        let Some(rx) = self.rx.as_mut() else {
            debug!(ecu = self.ecu.name(), "Consecutive frame without first frame");
            return Vec::new();
        };

        match rx.reassembler.process_frame(pdu) {
            ReassemblyStatus::Complete => {
                let request = self
                    .rx
                    .take()
                    .and_then(|rx| rx.reassembler.into_payload())
                    .unwrap_or_default();
                self.respond(&request)
            }
            ReassemblyStatus::InProgress => {
                rx.in_block += 1;
                if self.block_size > 0 && rx.in_block >= u32::from(self.block_size) {
                    rx.in_block = 0;
                    vec![self.flow_control()]
                } else {
                    Vec::new()
                }
            }
            status => {
                warn!(ecu = self.ecu.name(), ?status, "Multi-frame request dropped");
                self.rx = None;
                Vec::new()
            }
        }
    }

    fn on_flow_control(&mut self, status: FlowStatus, block_size: u8) -> Vec<CanFrame> {
        let Some(mut tx) = self.tx.take() else {
            return Vec::new();
        };

        match status {
            FlowStatus::Continue => {
                let mut frames = Vec::new();
                let mut sent = 0u32;
                while block_size == 0 || sent < u32::from(block_size) {
                    let Some(cf) = tx.segmenter.get_next_frame() else {
                        break;
                    };
                    frames.push(self.encode(&cf));
                    sent += 1;
                }
                if tx.segmenter.is_done() {
                    frames.extend(self.flush());
                } else {
                    self.tx = Some(tx);
                }
                frames
            }
            FlowStatus::Wait => {
                self.tx = Some(tx);
                Vec::new()
            }
            FlowStatus::Overflow => {
                warn!(ecu = self.ecu.name(), "Tester reported overflow, response dropped");
                self.outbox.clear();
                Vec::new()
            }
        }
    }

    /// Functional requests are single-frame only and answered single-frame only
    fn on_functional(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        let Some(ProtocolFrame::SingleFrame { payload }) = parse(frame) else {
            return Vec::new();
        };

        let capacity = self.can_type.single_frame_capacity();
        self.ecu
            .process_request(&payload)
            .into_iter()
            .filter(|message| {
                let fits = message.len() <= capacity;
                if !fits {
                    debug!(
                        ecu = self.ecu.name(),
                        len = message.len(),
                        "Functional response too long, not sent"
                    );
                }
                fits
            })
            .map(|message| self.encode(&ProtocolFrame::single(message)))
            .collect()
    }

    fn respond(&mut self, request: &[u8]) -> Vec<CanFrame> {
        self.tx = None;
        self.outbox.clear();
        self.outbox.extend(self.ecu.process_request(request));
        self.flush()
    }

    /// Send queued messages until one needs flow control
    fn flush(&mut self) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        while let Some(message) = self.outbox.pop_front() {
            if message.len() <= self.can_type.single_frame_capacity() {
                frames.push(self.encode(&ProtocolFrame::single(message)));
                continue;
            }

            let total_size = message.len();
            let mut segmenter = match Segmenter::new(message, total_size, self.can_type) {
                Ok(segmenter) => segmenter,
                Err(e) => {
                    warn!(ecu = self.ecu.name(), error = %e, "Response cannot be segmented");
                    continue;
                }
            };
            if let Some(ff) = segmenter.get_next_frame() {
                frames.push(self.encode(&ff));
            }
            self.tx = Some(Transmit { segmenter });
            break;
        }
        frames
    }

    fn flow_control(&self) -> CanFrame {
        self.encode(&ProtocolFrame::flow_control(
            FlowStatus::Continue,
            self.block_size,
            self.st_min,
        ))
    }

    fn encode(&self, pdu: &ProtocolFrame) -> CanFrame {
        let pad_size = match self.can_type {
            CanType::Classic => 8,
            CanType::Fd => 0,
        };
        build(pdu, self.response_id, self.can_type, pad_size, PAD_BYTE)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn node(config: EcuConfig) -> EcuNode {
        let ecu = Arc::new(SimulatedEcu::from_config(&config).unwrap());
        EcuNode::new(ecu, &config)
    }

    fn tester(data: Vec<u8>) -> CanFrame {
        CanFrame::new(0x7E0, data)
    }

    #[test]
    fn test_single_frame_exchange() {
        let mut node = node(EcuConfig::default());
        let frames = node.on_frame(&tester(vec![0x02, 0x10, 0x03]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x7E8);
        assert_eq!(&frames[0].data[..7], &[0x06, 0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
    }

    #[test]
    fn test_multi_frame_response_waits_for_flow_control() {
        let mut node = node(EcuConfig::default());
        let frames = node.on_frame(&tester(vec![0x03, 0x22, 0xF1, 0x90]));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data[..5], &[0x10, 20, 0x62, 0xF1, 0x90]);

        // Block size 1: one CF per flow control
        let frames = node.on_frame(&tester(vec![0x30, 0x01, 0x00]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data[0], 0x21);
        let frames = node.on_frame(&tester(vec![0x30, 0x01, 0x00]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data[0], 0x22);

        // Transfer finished; further flow control is ignored
        assert!(node.on_frame(&tester(vec![0x30, 0x00, 0x00])).is_empty());
    }

    #[test]
    fn test_multi_frame_request_with_block_size() {
        let config = EcuConfig {
            block_size: 1,
            ..EcuConfig::default()
        };
        let mut node = node(config);

        // 0x31 01 FF 00 + 8 option bytes = 12 bytes
        let frames = node.on_frame(&tester(vec![0x10, 12, 0x31, 0x01, 0xFF, 0x00, 1, 2]));
        assert_eq!(&frames[0].data[..3], &[0x30, 0x01, 0x00]);

        // 12 bytes fit FF + one CF; the routine runs with two pending replies
        let frames = node.on_frame(&tester(vec![0x21, 3, 4, 5, 6, 7, 8, 0xCC]));
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0].data[..4], &[0x03, 0x7F, 0x31, 0x78]);
        assert_eq!(&frames[2].data[..2], &[0x05, 0x71]);
        assert!(node.rx.is_none());
    }

    #[test]
    fn test_block_size_flow_control_every_block() {
        let config = EcuConfig {
            block_size: 1,
            ..EcuConfig::default()
        };
        let mut node = node(config);

        // 20 bytes: FF(6) + CF(7) + CF(7)
        let mut ff = vec![0x10, 20, 0x2E, 0xF1, 0x87];
        ff.extend_from_slice(&[0x41; 3]);
        assert_eq!(node.on_frame(&tester(ff))[0].data[0], 0x30);

        let frames = node.on_frame(&tester(vec![0x21, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data[0], 0x30);

        // Completion: write is refused while locked
        let frames = node.on_frame(&tester(vec![0x22, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41]));
        assert_eq!(&frames[0].data[..4], &[0x03, 0x7F, 0x2E, 0x33]);
    }

    #[test]
    fn test_sequence_error_drops_request() {
        let mut node = node(EcuConfig::default());
        node.on_frame(&tester(vec![0x10, 20, 0x2E, 0xF1, 0x87, 0, 0, 0]));
        assert!(node
            .on_frame(&tester(vec![0x23, 0, 0, 0, 0, 0, 0, 0]))
            .is_empty());
        assert!(node.rx.is_none());
    }

    #[test]
    fn test_pending_then_final() {
        let mut node = node(EcuConfig::default());
        let frames = node.on_frame(&tester(vec![0x04, 0x31, 0x01, 0xFF, 0x00]));
        let data: Vec<_> = frames.iter().map(|f| f.data[..4].to_vec()).collect();
        assert_eq!(
            data,
            vec![
                vec![0x03, 0x7F, 0x31, 0x78],
                vec![0x03, 0x7F, 0x31, 0x78],
                vec![0x05, 0x71, 0x01, 0xFF],
            ]
        );
    }

    #[test]
    fn test_functional_request_single_frame_only() {
        let mut node = node(EcuConfig::default());
        let frames = node.on_frame(&CanFrame::new(0x7DF, vec![0x02, 0x3E, 0x00]));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data[..3], &[0x02, 0x7E, 0x00]);

        // VIN does not fit a single frame
        assert!(node
            .on_frame(&CanFrame::new(0x7DF, vec![0x03, 0x22, 0xF1, 0x90]))
            .is_empty());
    }

    #[test]
    fn test_fd_response_fits_single_frame() {
        let config = EcuConfig {
            can_type: CanType::Fd,
            ..EcuConfig::default()
        };
        let mut node = node(config);
        let frames = node.on_frame(&CanFrame::new_fd(0x7E0, vec![0x03, 0x22, 0xF1, 0x90]));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fd);
        assert_eq!(&frames[0].data[..2], &[0x00, 20]);
    }
}
