//! Functional (broadcast) request
//!
//! The request goes out once on the functional ID as a single frame. Every
//! ECU that answers does so from its own response ID; replies are collected
//! until no frame has arrived for the configured silence window.
//!
//! No flow control is ever sent on a broadcast, so a responder that starts a
//! multi-frame reply cannot complete it. Such First Frames are logged and
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::is_response_pending;
use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::config::{SessionContext, POLL_INTERVAL};
use crate::error::TransactionError;
use crate::isotp::{build, parse, ProtocolFrame};
use crate::transport::Communicator;

/// One reply to a functional request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionalResponse {
    pub payload: Vec<u8>,
    /// CAN ID the reply arrived on
    pub source_id: u32,
}

pub struct FunctionalTransaction {
    context: Arc<SessionContext>,
    comm: Arc<dyn Communicator>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
    poll_interval: Duration,
    request: Vec<u8>,
}

impl FunctionalTransaction {
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

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stop_execution(&self) {
        self.token.cancel();
    }

    /// Broadcast the request and collect replies until the bus goes quiet
    ///
    /// Returns an empty list if the request cannot be sent.
    pub fn execute(&mut self) -> Vec<FunctionalResponse> {
        if self.token.is_cancelled() {
            return Vec::new();
        }
        let ctx = &self.context;
        let capacity = ctx.can_type.single_frame_capacity();
        if self.request.len() > capacity {
            warn!(
                len = self.request.len(),
                capacity, "Functional request does not fit a single frame"
            );
            return Vec::new();
        }

        let frame = build(
            &ProtocolFrame::single(self.request.clone()),
            ctx.functional_id,
            ctx.can_type,
            ctx.padding_size,
            ctx.padding_byte,
        );
        if !self.comm.send(&frame) {
            warn!(id = format_args!("0x{:X}", ctx.functional_id), "Functional send failed");
            return Vec::new();
        }

        let silence = ctx.timing.functional_silence();
        let mut deadline = self.clock.now() + silence;
        let mut responses = Vec::new();

        loop {
            if self.token.is_cancelled() {
                info!(collected = responses.len(), "Functional transaction aborted");
                break;
            }
            let now = self.clock.now();
            if now >= deadline {
                break;
            }

            let Some(frame) = self.comm.receive((deadline - now).min(self.poll_interval)) else {
                continue;
            };
            if frame.id == ctx.functional_id {
                continue;
            }

            match parse(&frame) {
                Some(ProtocolFrame::SingleFrame { payload }) if is_response_pending(&payload) => {
                    debug!(source = format_args!("0x{:X}", frame.id), "Functional response pending");
                    deadline = deadline.max(self.clock.now() + ctx.timing.n_ar());
                }
                Some(ProtocolFrame::SingleFrame { payload }) => {
                    responses.push(FunctionalResponse {
                        payload,
                        source_id: frame.id,
                    });
                    deadline = self.clock.now() + silence;
                }
                Some(ProtocolFrame::FirstFrame { total_size, .. }) => {
                    warn!(
                        source = format_args!("0x{:X}", frame.id),
                        total_size, "Ignoring multi-frame reply to functional request"
                    );
                }
                _ => {}
            }
        }

        debug!(count = responses.len(), "Functional transaction finished");
        responses
    }
}
