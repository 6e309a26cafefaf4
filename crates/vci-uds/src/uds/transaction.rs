//! Physical request/response state machine
//!
//! One [`Transaction`] carries one UDS request to the ECU and brings back its
//! final response:
//!
//! ```text
//!  START ──► SEND_SINGLE_FRAME ─────────────────────────────┐
//!    │                                                      ▼
//!    └─────► SEND_FIRST_FRAME ─► WAIT_FOR_FC ◄─┐   WAIT_FOR_RESPONSE ◄─┐
//!                                    │         │      │   │    │       │
//!                                    ▼         │      │   │    └─NRC78─┘
//!                     SEND_CONSECUTIVE_FRAMES ─┘      │   ▼
//!                                    │  (block full)  │ RECEIVE_CONSECUTIVE_FRAMES
//!                                    └────────────────┘   │
//!                                                         ▼
//!                                               COMPLETED / FAILED
//! ```
//!
//! Every wait receives in chunks of at most the poll interval and checks the
//! cancellation token between chunks, so [`Transaction::stop_execution`] is
//! observed promptly regardless of the configured timeouts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{is_negative_response, is_response_pending, negative_response_code};
use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::config::{SessionContext, POLL_INTERVAL};
use crate::error::{ResultCode, TransactionError};
use crate::isotp::{
    build, parse, separation_time, FlowStatus, ProtocolFrame, ReassemblyStatus, Reassembler,
    Segmenter,
};
use crate::transport::{CanFrame, Communicator};

/// Transaction state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Start,
    SendSingleFrame,
    SendFirstFrame,
    WaitForFc,
    SendConsecutiveFrames,
    WaitForResponse,
    ReceiveConsecutiveFrames,
    Completed,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Failed)
    }
}

/// Outcome of [`Transaction::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub success: bool,
    pub result_code: ResultCode,
    /// Response bytes; also set for negative responses
    pub response_payload: Vec<u8>,
}

/// Result of one bounded wait
enum Wait {
    Frame(CanFrame),
    TimedOut,
    Aborted,
}

/// One physical UDS request/response exchange
pub struct Transaction {
    context: Arc<SessionContext>,
    comm: Arc<dyn Communicator>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
    poll_interval: Duration,

    request: Vec<u8>,
    state: TransactionState,
    history: Vec<TransactionState>,
    result_code: ResultCode,
    response: Vec<u8>,

    segmenter: Option<Segmenter>,
    reassembler: Option<Reassembler>,
    /// Block size granted by the receiver's last Flow Control
    tx_block_size: u8,
    tx_separation: Duration,
    tx_in_block: u32,
    nrc78_count: u32,
}

impl Transaction {
    pub fn new(
        context: Arc<SessionContext>,
        comm: Arc<dyn Communicator>,
        request: Vec<u8>,
    ) -> Result<Self, TransactionError> {
        if request.is_empty() {
            return Err(TransactionError::EmptyPayload);
        }

        Ok(Self {
            context,
            comm,
            clock: Arc::new(SystemClock),
            token: CancellationToken::new(),
            poll_interval: POLL_INTERVAL,
            request,
            state: TransactionState::Start,
            history: vec![TransactionState::Start],
            result_code: ResultCode::InternalError,
            response: Vec::new(),
            segmenter: None,
            reassembler: None,
            tx_block_size: 0,
            tx_separation: Duration::ZERO,
            tx_in_block: 0,
            nrc78_count: 0,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Handle that aborts this transaction from another thread
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stop_execution(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[TransactionState] {
        &self.history
    }

    /// Response-pending replies seen so far
    pub fn pending_count(&self) -> u32 {
        self.nrc78_count
    }

    /// Run the exchange to completion
    pub fn execute(&mut self) -> TransactionResult {
        debug!(
            request_id = format_args!("0x{:X}", self.context.request_id),
            len = self.request.len(),
            "Transaction started"
        );

        while !self.state.is_terminal() {
            let next = if self.token.is_cancelled() {
                self.fail(ResultCode::Aborted)
            } else {
                match self.state {
                    TransactionState::Start => self.on_start(),
                    TransactionState::SendSingleFrame => self.on_send_single_frame(),
                    TransactionState::SendFirstFrame => self.on_send_first_frame(),
                    TransactionState::WaitForFc => self.on_wait_for_fc(),
                    TransactionState::SendConsecutiveFrames => self.on_send_consecutive_frames(),
                    TransactionState::WaitForResponse => self.on_wait_for_response(),
                    TransactionState::ReceiveConsecutiveFrames => {
                        self.on_receive_consecutive_frames()
                    }
                    TransactionState::Completed | TransactionState::Failed => self.state,
                }
            };
            self.enter(next);
        }

        let success = self.state == TransactionState::Completed;
        if success {
            self.result_code = ResultCode::Ok;
            info!(
                sid = format_args!("0x{:02X}", self.request[0]),
                response_len = self.response.len(),
                nrc78 = self.nrc78_count,
                "Transaction completed"
            );
        }

        TransactionResult {
            success,
            result_code: self.result_code,
            response_payload: self.response.clone(),
        }
    }

    fn enter(&mut self, next: TransactionState) {
        if next != self.state {
            debug!(from = ?self.state, to = ?next, "Transaction state change");
            self.state = next;
            self.history.push(next);
        }
    }

    fn fail(&mut self, code: ResultCode) -> TransactionState {
        self.result_code = code;
        if code == ResultCode::Aborted {
            info!(state = ?self.state, "Transaction aborted");
        } else {
            warn!(state = ?self.state, result = %code, "Transaction failed");
        }
        TransactionState::Failed
    }

    fn send(&self, frame: &ProtocolFrame) -> bool {
        let ctx = &self.context;
        let can = build(
            frame,
            ctx.request_id,
            ctx.can_type,
            ctx.padding_size,
            ctx.padding_byte,
        );
        let sent = self.comm.send(&can);
        if !sent {
            warn!(kind = frame.kind(), id = format_args!("0x{:X}", can.id), "CAN send failed");
        }
        sent
    }

    fn send_flow_control(&self, status: FlowStatus) -> bool {
        let timing = &self.context.timing;
        self.send(&ProtocolFrame::flow_control(
            status,
            timing.block_size,
            timing.st_min,
        ))
    }

    /// Receive the next frame from the response ID before `deadline`
    fn wait_for_frame(&self, deadline: Instant) -> Wait {
        loop {
            if self.token.is_cancelled() {
                return Wait::Aborted;
            }
            let now = self.clock.now();
            if now >= deadline {
                return Wait::TimedOut;
            }
            let chunk = (deadline - now).min(self.poll_interval);
            if let Some(frame) = self.comm.receive(chunk) {
                if frame.id == self.context.response_id {
                    return Wait::Frame(frame);
                }
                debug!(id = format_args!("0x{:X}", frame.id), "Ignoring frame from other ID");
            }
        }
    }

    /// Sleep for the separation time in 1 ms steps; false if aborted
    fn pace(&self, duration: Duration) -> bool {
        let deadline = self.clock.now() + duration;
        loop {
            if self.token.is_cancelled() {
                return false;
            }
            let now = self.clock.now();
            if now >= deadline {
                return true;
            }
            self.clock.sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }

    fn on_start(&mut self) -> TransactionState {
        let can_type = self.context.can_type;
        if self.request.len() <= can_type.single_frame_capacity() {
            return TransactionState::SendSingleFrame;
        }

        match Segmenter::new(self.request.clone(), self.request.len(), can_type) {
            Ok(segmenter) => {
                self.segmenter = Some(segmenter);
                TransactionState::SendFirstFrame
            }
            Err(e) => {
                warn!(error = %e, "Request cannot be segmented");
                self.fail(e.into())
            }
        }
    }

    fn on_send_single_frame(&mut self) -> TransactionState {
        if self.send(&ProtocolFrame::single(self.request.clone())) {
            TransactionState::WaitForResponse
        } else {
            self.fail(ResultCode::SendFailed)
        }
    }

    fn on_send_first_frame(&mut self) -> TransactionState {
        let Some(first) = self.segmenter.as_mut().and_then(Segmenter::get_next_frame) else {
            return self.fail(ResultCode::InternalError);
        };
        if self.send(&first) {
            TransactionState::WaitForFc
        } else {
            self.fail(ResultCode::SendFailed)
        }
    }

    fn on_wait_for_fc(&mut self) -> TransactionState {
        let n_bs = self.context.timing.n_bs();
        let mut deadline = self.clock.now() + n_bs;

        loop {
            let frame = match self.wait_for_frame(deadline) {
                Wait::Frame(frame) => frame,
                Wait::TimedOut => return self.fail(ResultCode::TimeoutBs),
                Wait::Aborted => return self.fail(ResultCode::Aborted),
            };

            match parse(&frame) {
                Some(ProtocolFrame::FlowControl {
                    status: FlowStatus::Continue,
                    block_size,
                    st_min,
                }) => {
                    self.tx_block_size = block_size;
                    self.tx_separation = separation_time(st_min);
                    self.tx_in_block = 0;
                    debug!(block_size, st_min, "Flow control: continue");
                    return TransactionState::SendConsecutiveFrames;
                }
                Some(ProtocolFrame::FlowControl {
                    status: FlowStatus::Wait,
                    ..
                }) => {
                    debug!("Flow control: wait");
                    deadline = self.clock.now() + n_bs;
                }
                Some(ProtocolFrame::FlowControl {
                    status: FlowStatus::Overflow,
                    ..
                }) => return self.fail(ResultCode::FcOverflow),
                other => {
                    debug!(frame = ?other, "Expected flow control");
                    return self.fail(ResultCode::UnexpectedFrame);
                }
            }
        }
    }

    fn on_send_consecutive_frames(&mut self) -> TransactionState {
        loop {
            if self.token.is_cancelled() {
                return self.fail(ResultCode::Aborted);
            }

            let Some(frame) = self.segmenter.as_mut().and_then(Segmenter::get_next_frame) else {
                return TransactionState::WaitForResponse;
            };
            if !self.send(&frame) {
                return self.fail(ResultCode::SendFailed);
            }
            self.tx_in_block += 1;

            if self.segmenter.as_ref().map_or(true, Segmenter::is_done) {
                return TransactionState::WaitForResponse;
            }
            if self.tx_block_size > 0 && self.tx_in_block >= u32::from(self.tx_block_size) {
                return TransactionState::WaitForFc;
            }
            if !self.pace(self.tx_separation) {
                return self.fail(ResultCode::Aborted);
            }
        }
    }

    fn on_wait_for_response(&mut self) -> TransactionState {
        let timing = self.context.timing.clone();
        let mut deadline = self.clock.now()
            + if self.nrc78_count > 0 {
                timing.n_ar()
            } else {
                timing.n_as()
            };

        loop {
            let frame = match self.wait_for_frame(deadline) {
                Wait::Frame(frame) => frame,
                Wait::TimedOut if self.nrc78_count > 0 => {
                    return self.fail(ResultCode::TimeoutP2Star)
                }
                Wait::TimedOut => return self.fail(ResultCode::TimeoutA),
                Wait::Aborted => return self.fail(ResultCode::Aborted),
            };

            match parse(&frame) {
                Some(ProtocolFrame::SingleFrame { payload }) if is_response_pending(&payload) => {
                    self.nrc78_count += 1;
                    debug!(
                        count = self.nrc78_count,
                        max = timing.max_nrc78_count,
                        "Response pending"
                    );
                    if self.nrc78_count > timing.max_nrc78_count {
                        return self.fail(ResultCode::Nrc78LimitExceeded);
                    }
                    deadline = self.clock.now() + timing.n_ar();
                }
                Some(ProtocolFrame::SingleFrame { payload }) => return self.finish(payload),
                Some(first @ ProtocolFrame::FirstFrame { total_size, .. }) => {
                    let limit = self.context.max_response_size as usize;
                    if total_size > limit {
                        warn!(total = total_size, limit, "Response exceeds receive limit");
                        if !self.send_flow_control(FlowStatus::Overflow) {
                            return self.fail(ResultCode::SendFailed);
                        }
                        return self.fail(ResultCode::PayloadTooLarge);
                    }

                    let mut reassembler = Reassembler::new();
                    let status = reassembler.process_frame(&first);
                    debug!(total = total_size, "Multi-frame response started");
                    self.reassembler = Some(reassembler);

                    if status == ReassemblyStatus::Complete {
                        return self.finish_reassembly();
                    }
                    if !self.send_flow_control(FlowStatus::Continue) {
                        return self.fail(ResultCode::SendFailed);
                    }
                    return TransactionState::ReceiveConsecutiveFrames;
                }
                other => {
                    debug!(frame = ?other, "Ignoring frame while waiting for response");
                }
            }
        }
    }

    fn on_receive_consecutive_frames(&mut self) -> TransactionState {
        let timing = self.context.timing.clone();
        let mut rx_in_block: u32 = 0;

        loop {
            let deadline = self.clock.now() + timing.n_cr();
            let frame = match self.wait_for_frame(deadline) {
                Wait::Frame(frame) => frame,
                Wait::TimedOut => return self.fail(ResultCode::TimeoutCr),
                Wait::Aborted => return self.fail(ResultCode::Aborted),
            };

            let Some(pdu) = parse(&frame) else {
                debug!(data = ?frame.data, "Skipping unparseable frame");
                continue;
            };
            let Some(reassembler) = self.reassembler.as_mut() else {
                return self.fail(ResultCode::InternalError);
            };

            match reassembler.process_frame(&pdu) {
                ReassemblyStatus::InProgress => {
                    rx_in_block += 1;
                    if timing.block_size > 0 && rx_in_block >= u32::from(timing.block_size) {
                        rx_in_block = 0;
                        if !self.send_flow_control(FlowStatus::Continue) {
                            return self.fail(ResultCode::SendFailed);
                        }
                    }
                }
                ReassemblyStatus::Complete => return self.finish_reassembly(),
                ReassemblyStatus::ErrorSequence => return self.fail(ResultCode::SequenceError),
                ReassemblyStatus::ErrorUnexpectedFrame | ReassemblyStatus::Idle => {
                    return self.fail(ResultCode::UnexpectedFrame)
                }
            }
        }
    }

    fn finish_reassembly(&mut self) -> TransactionState {
        match self.reassembler.take().and_then(Reassembler::into_payload) {
            Some(payload) => self.finish(payload),
            None => self.fail(ResultCode::InternalError),
        }
    }

    /// Classify a complete response
    fn finish(&mut self, payload: Vec<u8>) -> TransactionState {
        let negative = is_negative_response(&payload);
        if negative {
            debug!(nrc = ?negative_response_code(&payload), "Negative response");
        }
        self.response = payload;
        if negative {
            self.fail(ResultCode::NegativeResponse)
        } else {
            TransactionState::Completed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CanType;
    use crate::transport::mock::MockCommunicator;

    const REQ: u32 = 0x7E0;
    const RESP: u32 = 0x7E8;

    fn setup(context: SessionContext) -> (Arc<SessionContext>, Arc<MockCommunicator>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let mock = Arc::new(MockCommunicator::with_clock(clock.clone()));
        (Arc::new(context), mock, clock)
    }

    fn transaction(
        ctx: &Arc<SessionContext>,
        mock: &Arc<MockCommunicator>,
        clock: &Arc<ManualClock>,
        request: Vec<u8>,
    ) -> Transaction {
        Transaction::new(ctx.clone(), mock.clone(), request)
            .unwrap()
            .with_clock(clock.clone())
    }

    fn sf(data: &[u8]) -> CanFrame {
        let mut bytes = vec![data.len() as u8];
        bytes.extend_from_slice(data);
        bytes.resize(8, 0xAA);
        CanFrame::new(RESP, bytes)
    }

    #[test]
    fn test_rejects_empty_request() {
        let (ctx, mock, _) = setup(SessionContext::default());
        assert_eq!(
            Transaction::new(ctx, mock, Vec::new()).err(),
            Some(TransactionError::EmptyPayload)
        );
    }

    #[test]
    fn test_single_frame_exchange() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_responder(|_| vec![sf(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4])]);

        let mut tx = transaction(&ctx, &mock, &clock, vec![0x10, 0x03]);
        let result = tx.execute();

        assert_eq!(result.result_code, ResultCode::Ok);
        assert!(result.success);
        assert_eq!(result.response_payload, vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
        assert_eq!(
            tx.history(),
            &[
                TransactionState::Start,
                TransactionState::SendSingleFrame,
                TransactionState::WaitForResponse,
                TransactionState::Completed,
            ]
        );
        assert_eq!(mock.sent_data(), vec![vec![0x02, 0x10, 0x03, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]]);
    }

    #[test]
    fn test_negative_response_carries_payload() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_responder(|_| vec![sf(&[0x7F, 0x22, 0x31])]);

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0x12, 0x34]).execute();
        assert_eq!(result.result_code, ResultCode::NegativeResponse);
        assert!(!result.success);
        assert_eq!(result.response_payload, vec![0x7F, 0x22, 0x31]);
    }

    #[test]
    fn test_timeout_a_without_pending() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        let result = transaction(&ctx, &mock, &clock, vec![0x3E, 0x00]).execute();

        assert_eq!(result.result_code, ResultCode::TimeoutA);
        assert!(clock.elapsed() >= ctx.timing.n_as());
    }

    #[test]
    fn test_timeout_p2star_after_pending() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_responder(|_| vec![sf(&[0x7F, 0x31, 0x78])]);

        let result = transaction(&ctx, &mock, &clock, vec![0x31, 0x01, 0xFF, 0x00]).execute();
        assert_eq!(result.result_code, ResultCode::TimeoutP2Star);
        assert!(clock.elapsed() >= ctx.timing.n_ar());
    }

    #[test]
    fn test_ignores_frames_from_other_ids_and_garbage() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_responder(|_| {
            vec![
                CanFrame::new(0x123, vec![0x02, 0x50, 0x01]),
                CanFrame::new(RESP, vec![0xF0, 0x00]),
                CanFrame::new(RESP, vec![0x30, 0x00, 0x00]),
                sf(&[0x50, 0x01]),
            ]
        });

        let result = transaction(&ctx, &mock, &clock, vec![0x10, 0x01]).execute();
        assert_eq!(result.result_code, ResultCode::Ok);
        assert_eq!(result.response_payload, vec![0x50, 0x01]);
    }

    #[test]
    fn test_multi_frame_request_with_block_size() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        let sent_cfs = Arc::new(parking_lot::Mutex::new(0u32));
        let counter = sent_cfs.clone();
        mock.set_responder(move |frame| match frame.data[0] >> 4 {
            // FC after the FF and after every second CF
            1 => vec![CanFrame::new(RESP, vec![0x30, 0x02, 0x05])],
            2 => {
                let mut n = counter.lock();
                *n += 1;
                match *n {
                    2 => vec![CanFrame::new(RESP, vec![0x30, 0x02, 0x05])],
                    3 => vec![sf(&[0x6E, 0xF1, 0x90])],
                    _ => vec![],
                }
            }
            _ => vec![],
        });

        let mut request = vec![0x2E, 0xF1, 0x90];
        request.extend_from_slice(b"WDB1234567890ABCDEFGHIJK");
        let mut tx = transaction(&ctx, &mock, &clock, request.clone());
        let result = tx.execute();

        assert_eq!(result.result_code, ResultCode::Ok);
        let sent = mock.sent_data();
        assert_eq!(sent.len(), 4);
        assert_eq!(&sent[0][..2], &[0x10, 27]);
        assert_eq!(sent[1][0], 0x21);
        assert_eq!(sent[2][0], 0x22);
        assert_eq!(sent[3][0], 0x23);

        let mut joined = sent[0][2..].to_vec();
        for cf in &sent[1..] {
            joined.extend_from_slice(&cf[1..]);
        }
        joined.truncate(request.len());
        assert_eq!(joined, request);

        let fc_waits = tx
            .history()
            .iter()
            .filter(|s| **s == TransactionState::WaitForFc)
            .count();
        assert_eq!(fc_waits, 2);
        // Separation time of 5 ms was honoured between the paced frames
        assert!(clock.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_flow_control_wait_then_continue() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_responder(|frame| match frame.data[0] >> 4 {
            1 => vec![
                CanFrame::new(RESP, vec![0x31, 0x00, 0x00]),
                CanFrame::new(RESP, vec![0x31, 0x00, 0x00]),
                CanFrame::new(RESP, vec![0x30, 0x00, 0x00]),
            ],
            2 if frame.data[0] == 0x22 => vec![sf(&[0x76, 0x01])],
            _ => vec![],
        });

        let mut tx = transaction(&ctx, &mock, &clock, vec![0x36; 14]);
        let result = tx.execute();
        assert_eq!(result.result_code, ResultCode::Ok);
        assert!(!tx.history().contains(&TransactionState::Failed));
    }

    #[test]
    fn test_flow_control_wait_until_timeout() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_responder(|frame| match frame.data[0] >> 4 {
            1 => vec![CanFrame::new(RESP, vec![0x31, 0x00, 0x00])],
            _ => vec![],
        });

        let result = transaction(&ctx, &mock, &clock, vec![0x36; 14]).execute();
        assert_eq!(result.result_code, ResultCode::TimeoutBs);
    }

    #[test]
    fn test_flow_control_overflow() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_responder(|_| vec![CanFrame::new(RESP, vec![0x32, 0x00, 0x00])]);

        let result = transaction(&ctx, &mock, &clock, vec![0x36; 14]).execute();
        assert_eq!(result.result_code, ResultCode::FcOverflow);
    }

    #[test]
    fn test_non_flow_control_while_waiting_for_fc() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_responder(|_| vec![sf(&[0x7F, 0x36, 0x13])]);

        let result = transaction(&ctx, &mock, &clock, vec![0x36; 14]).execute();
        assert_eq!(result.result_code, ResultCode::UnexpectedFrame);
    }

    #[test]
    fn test_payload_too_large_classic() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        let result = transaction(&ctx, &mock, &clock, vec![0x36; 4096]).execute();

        assert_eq!(result.result_code, ResultCode::PayloadTooLarge);
        assert!(mock.sent_frames().is_empty());
    }

    #[test]
    fn test_send_failure() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.set_fail_sends(true);
        let result = transaction(&ctx, &mock, &clock, vec![0x10, 0x01]).execute();
        assert_eq!(result.result_code, ResultCode::SendFailed);
    }

    #[test]
    fn test_multi_frame_response_sends_flow_control() {
        let mut context = SessionContext::default();
        context.timing.block_size = 2;
        context.timing.st_min = 0x0A;
        let (ctx, mock, clock) = setup(context);

        let mut vin = vec![0x62, 0xF1, 0x90];
        vin.extend_from_slice(b"1HGCM82633A123456");
        let response = vin.clone();
        mock.set_responder(move |frame| match frame.data[0] {
            0x03 => vec![CanFrame::new(RESP, [&[0x10, 20][..], &response[..6]].concat())],
            0x30 => vec![
                CanFrame::new(RESP, [&[0x21][..], &response[6..13]].concat()),
                CanFrame::new(RESP, [&[0x22][..], &response[13..20]].concat()),
            ],
            _ => vec![],
        });

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0xF1, 0x90]).execute();
        assert_eq!(result.result_code, ResultCode::Ok);
        assert_eq!(result.response_payload, vin);

        let fcs: Vec<Vec<u8>> = mock
            .sent_data()
            .into_iter()
            .filter(|d| d[0] >> 4 == 3)
            .collect();
        // One FC after the FF; the block of two completes the message
        assert_eq!(fcs.len(), 1);
        assert_eq!(&fcs[0][..3], &[0x30, 0x02, 0x0A]);
    }

    #[test]
    fn test_receive_block_size_triggers_additional_flow_control() {
        let mut context = SessionContext::default();
        context.timing.block_size = 1;
        let (ctx, mock, clock) = setup(context);

        let payload: Vec<u8> = (0..30).collect();
        let first = CanFrame::new(RESP, [&[0x10, 30][..], &payload[..6]].concat());
        let cfs: Vec<CanFrame> = payload[6..]
            .chunks(7)
            .enumerate()
            .map(|(i, chunk)| {
                let sn = (i as u8 + 1) & 0x0F;
                CanFrame::new(RESP, [&[0x20 | sn][..], chunk].concat())
            })
            .collect();
        let mut next_cf = 0;
        mock.set_responder(move |frame| match frame.data[0] {
            0x03 => vec![first.clone()],
            // One CF per flow control
            0x30 => {
                let out: Vec<CanFrame> = cfs.get(next_cf).cloned().into_iter().collect();
                next_cf += 1;
                out
            }
            _ => vec![],
        });

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0x01, 0x00]).execute();
        assert_eq!(result.result_code, ResultCode::Ok);
        assert_eq!(result.response_payload, payload);

        // 24 bytes in 4 CFs: FC after the FF, then after each of the first 3 CFs
        let fc_count = mock
            .sent_data()
            .iter()
            .filter(|d| d[0] == 0x30)
            .count();
        assert_eq!(fc_count, 4);
    }

    #[test]
    fn test_sequence_error_in_response() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.push_incoming(CanFrame::new(RESP, vec![0x10, 0x14, 0x62, 0xF1, 0x90, 1, 2, 3]));
        mock.push_incoming(CanFrame::new(RESP, vec![0x22, 4, 5, 6, 7, 8, 9, 10]));

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0xF1, 0x90]).execute();
        assert_eq!(result.result_code, ResultCode::SequenceError);
    }

    #[test]
    fn test_consecutive_frame_timeout() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.push_incoming(CanFrame::new(RESP, vec![0x10, 0x14, 0x62, 0xF1, 0x90, 1, 2, 3]));

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0xF1, 0x90]).execute();
        assert_eq!(result.result_code, ResultCode::TimeoutCr);
    }

    #[test]
    fn test_oversized_response_answered_with_overflow() {
        let mut context = SessionContext::default();
        context.max_response_size = 64;
        let (ctx, mock, clock) = setup(context);
        mock.push_incoming(CanFrame::new(RESP, vec![0x10, 0x41, 0x62, 0xF1, 0x90, 1, 2, 3]));

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0xF1, 0x90]).execute();
        assert_eq!(result.result_code, ResultCode::PayloadTooLarge);

        let sent = mock.sent_data();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[1][..3], &[0x32, 0x00, 0x00]);
    }

    #[test]
    fn test_unparseable_frame_between_consecutive_frames_is_skipped() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.push_incoming(CanFrame::new(RESP, vec![0x10, 0x14, 0x62, 0xF1, 0x90, 1, 2, 3]));
        mock.push_incoming(CanFrame::new(RESP, vec![0xF0, 0x00]));
        mock.push_incoming(CanFrame::new(RESP, vec![0x21, 4, 5, 6, 7, 8, 9, 10]));
        mock.push_incoming(CanFrame::new(RESP, vec![0x22, 11, 12, 13, 14, 15, 16, 17]));

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0xF1, 0x90]).execute();
        assert_eq!(result.result_code, ResultCode::Ok);
        let mut expected = vec![0x62, 0xF1, 0x90];
        expected.extend(1..=17);
        assert_eq!(result.response_payload, expected);
    }

    #[test]
    fn test_first_frame_carrying_whole_message_sends_no_flow_control() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.push_incoming(CanFrame::new(RESP, vec![0x10, 0x05, 0x62, 0xF1, 0x90, 1, 2, 0xAA]));

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0xF1, 0x90]).execute();
        assert_eq!(result.result_code, ResultCode::Ok);
        assert_eq!(result.response_payload, vec![0x62, 0xF1, 0x90, 1, 2]);
        assert!(mock.sent_data().iter().all(|d| d[0] >> 4 != 3));
    }

    #[test]
    fn test_multi_frame_negative_response() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        mock.push_incoming(CanFrame::new(RESP, vec![0x10, 0x08, 0x7F, 0x22, 0x31, 0, 0, 0]));
        mock.push_incoming(CanFrame::new(RESP, vec![0x21, 0, 0, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]));

        let result = transaction(&ctx, &mock, &clock, vec![0x22, 0xF1, 0x90]).execute();
        assert_eq!(result.result_code, ResultCode::NegativeResponse);
        assert_eq!(result.response_payload, vec![0x7F, 0x22, 0x31, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_nrc78_within_budget_completes() {
        let mut context = SessionContext::default();
        context.timing.max_nrc78_count = 5;
        let (ctx, mock, clock) = setup(context);
        mock.set_responder(|_| {
            vec![
                sf(&[0x7F, 0x31, 0x78]),
                sf(&[0x7F, 0x31, 0x78]),
                sf(&[0x7F, 0x31, 0x78]),
                sf(&[0x71, 0x01, 0xFF, 0x00]),
            ]
        });

        let mut tx = transaction(&ctx, &mock, &clock, vec![0x31, 0x01, 0xFF, 0x00]);
        let result = tx.execute();
        assert_eq!(result.result_code, ResultCode::Ok);
        assert_eq!(tx.pending_count(), 3);
    }

    #[test]
    fn test_nrc78_budget_exceeded() {
        let mut context = SessionContext::default();
        context.timing.max_nrc78_count = 2;
        let (ctx, mock, clock) = setup(context);
        mock.set_responder(|_| {
            vec![
                sf(&[0x7F, 0x31, 0x78]),
                sf(&[0x7F, 0x31, 0x78]),
                sf(&[0x7F, 0x31, 0x78]),
                sf(&[0x71, 0x01, 0xFF, 0x00]),
            ]
        });

        let mut tx = transaction(&ctx, &mock, &clock, vec![0x31, 0x01, 0xFF, 0x00]);
        let result = tx.execute();
        assert_eq!(result.result_code, ResultCode::Nrc78LimitExceeded);
        assert_eq!(tx.pending_count(), 3);
    }

    #[test]
    fn test_fd_single_frame_escape() {
        let mut context = SessionContext::default();
        context.can_type = CanType::Fd;
        context.padding_size = 0;
        let (ctx, mock, clock) = setup(context);
        mock.set_responder(|_| vec![CanFrame::new_fd(RESP, vec![0x02, 0x6E, 0xF1])]);

        let request: Vec<u8> = (0..40).collect();
        let mut tx = transaction(&ctx, &mock, &clock, request.clone());
        assert_eq!(tx.execute().result_code, ResultCode::Ok);

        let sent = mock.sent_frames();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].frame.fd);
        assert_eq!(&sent[0].frame.data[..2], &[0x00, 40]);
        assert_eq!(&sent[0].frame.data[2..42], &request[..]);
        assert_eq!(sent[0].frame.data.len(), 48);
    }

    #[test]
    fn test_cancelled_before_execute() {
        let (ctx, mock, clock) = setup(SessionContext::default());
        let mut tx = transaction(&ctx, &mock, &clock, vec![0x10, 0x01]);
        tx.stop_execution();

        let result = tx.execute();
        assert_eq!(result.result_code, ResultCode::Aborted);
        assert!(mock.sent_frames().is_empty());
    }

    #[test]
    fn test_abort_from_other_thread_while_waiting() {
        // Real clock: the mock never answers and the abort must win the race
        let mut context = SessionContext::default();
        context.timing.n_as_ms = 60_000;
        let ctx = Arc::new(context);
        let mock = Arc::new(MockCommunicator::new());

        let mut tx = Transaction::new(ctx, mock, vec![0x31, 0x01, 0xFF, 0x00]).unwrap();
        let token = tx.cancellation_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let at = Instant::now();
            token.cancel();
            at
        });

        let result = tx.execute();
        let returned = Instant::now();
        let cancelled_at = canceller.join().unwrap();

        assert_eq!(result.result_code, ResultCode::Aborted);
        assert!(returned.duration_since(cancelled_at) < Duration::from_millis(100));
        assert_eq!(tx.state(), TransactionState::Failed);
    }
}
