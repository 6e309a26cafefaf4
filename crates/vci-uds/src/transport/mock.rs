//! Mock communicator for testing
//!
//! Frames handed to `send` are recorded together with the start and end of
//! the send span. A responder closure plays the ECU: it sees each sent frame
//! and returns the frames the ECU would put on the bus in reply.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{CanFrame, Communicator, TransportError};
use crate::clock::{Clock, SystemClock};
use crate::config::LogConfig;

type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

/// A frame accepted by [`MockCommunicator::send`]
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub frame: CanFrame,
    pub started: Instant,
    pub finished: Instant,
}

/// A frame handed out by [`MockCommunicator::receive`]
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub frame: CanFrame,
    pub at: Instant,
}

/// Scripted in-memory bus
pub struct MockCommunicator {
    clock: Arc<dyn Clock>,
    /// Frames waiting to be received, each with the time it becomes visible
    incoming: Mutex<VecDeque<(Instant, CanFrame)>>,
    sent: Mutex<Vec<SentFrame>>,
    received: Mutex<Vec<ReceivedFrame>>,
    responder: Mutex<Option<Responder>>,
    response_delay: Mutex<Duration>,
    send_duration: Mutex<Duration>,
    fail_sends: AtomicBool,
    fail_log_open: AtomicBool,
    log_open: AtomicBool,
    clear_calls: AtomicUsize,
    shut_down: AtomicBool,
}

impl MockCommunicator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            incoming: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            response_delay: Mutex::new(Duration::ZERO),
            send_duration: Mutex::new(Duration::ZERO),
            fail_sends: AtomicBool::new(false),
            fail_log_open: AtomicBool::new(false),
            log_open: AtomicBool::new(false),
            clear_calls: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Install the ECU side of the conversation
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Delay before responder output becomes receivable
    pub fn set_response_delay(&self, delay: Duration) {
        *self.response_delay.lock() = delay;
    }

    /// Time each `send` call takes
    pub fn set_send_duration(&self, duration: Duration) {
        *self.send_duration.lock() = duration;
    }

    /// Make every subsequent `send` fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_log_open(&self, fail: bool) {
        self.fail_log_open.store(fail, Ordering::SeqCst);
    }

    /// Queue a frame for immediate reception
    pub fn push_incoming(&self, frame: CanFrame) {
        let now = self.clock.now();
        self.incoming.lock().push_back((now, frame));
    }

    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.sent.lock().clone()
    }

    /// Payloads of all sent frames, in order
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.sent.lock().iter().map(|s| s.frame.data.clone()).collect()
    }

    pub fn received_frames(&self) -> Vec<ReceivedFrame> {
        self.received.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
        self.received.lock().clear();
    }

    pub fn is_log_open(&self) -> bool {
        self.log_open.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn pop_ready(&self, now: Instant) -> Option<CanFrame> {
        let mut incoming = self.incoming.lock();
        match incoming.front() {
            Some((ready_at, _)) if *ready_at <= now => incoming.pop_front().map(|(_, f)| f),
            _ => None,
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.incoming.lock().front().map(|(ready_at, _)| *ready_at)
    }

    fn record_received(&self, frame: CanFrame) -> CanFrame {
        self.received.lock().push(ReceivedFrame {
            frame: frame.clone(),
            at: self.clock.now(),
        });
        frame
    }
}

impl Default for MockCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for MockCommunicator {
    fn send(&self, frame: &CanFrame) -> bool {
        if self.fail_sends.load(Ordering::SeqCst) {
            tracing::debug!(id = frame.id, "Mock communicator: send failure injected");
            return false;
        }

        let started = self.clock.now();
        let duration = *self.send_duration.lock();
        if !duration.is_zero() {
            self.clock.sleep(duration);
        }
        let finished = self.clock.now();

        self.sent.lock().push(SentFrame {
            frame: frame.clone(),
            started,
            finished,
        });
        tracing::debug!(id = frame.id, data = ?frame.data, "Mock communicator: sent frame");

        let replies = match self.responder.lock().as_mut() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        if !replies.is_empty() {
            let ready_at = finished + *self.response_delay.lock();
            self.incoming
                .lock()
                .extend(replies.into_iter().map(|reply| (ready_at, reply)));
        }
        true
    }

    fn receive(&self, timeout: Duration) -> Option<CanFrame> {
        let now = self.clock.now();
        if let Some(frame) = self.pop_ready(now) {
            return Some(self.record_received(frame));
        }

        // Sleep until the next frame becomes visible or the timeout expires
        let deadline = now + timeout;
        match self.next_ready_at() {
            Some(ready_at) if ready_at <= deadline => {
                self.clock.sleep(ready_at.saturating_duration_since(now));
            }
            _ => self.clock.sleep(timeout),
        }

        let frame = self.pop_ready(self.clock.now())?;
        Some(self.record_received(frame))
    }

    fn clear_receiver(&self) {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn open_log(&self, config: &LogConfig) -> Result<(), TransportError> {
        if self.fail_log_open.load(Ordering::SeqCst) {
            return Err(TransportError::LogFailed(format!(
                "cannot open {:?}",
                config.path
            )));
        }
        self.log_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_log(&self) {
        self.log_open.store(false, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
