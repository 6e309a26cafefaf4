//! Tester Present keep-alive
//!
//! The keep-alive thread only transmits when the bus has been quiet for a
//! full interval. Every frame the service sends goes through a
//! [`StampedChannel`], which records the time of the last transmission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::Inner;
use crate::clock::Clock;
use crate::config::LogConfig;
use crate::isotp::{build, ProtocolFrame};
use crate::transport::{CanFrame, Communicator, TransportError};
use crate::uds::service_id;

/// Wait used while the keep-alive interval is configured as zero
const DISABLED_RECHECK: Duration = Duration::from_millis(100);

// =============================================================================
// Last transmit time
// =============================================================================

/// Time of the most recent transmission, lock-free
pub(crate) struct LastTransmit {
    base: Instant,
    /// Milliseconds since `base`
    millis: AtomicU64,
}

impl LastTransmit {
    pub(crate) fn new(clock: &dyn Clock) -> Self {
        Self {
            base: clock.now(),
            millis: AtomicU64::new(0),
        }
    }

    pub(crate) fn stamp(&self, clock: &dyn Clock) {
        let millis = clock.now().saturating_duration_since(self.base).as_millis() as u64;
        self.millis.store(millis, Ordering::Release);
    }

    /// Time since the last transmission
    pub(crate) fn idle(&self, clock: &dyn Clock) -> Duration {
        let last = self.base + Duration::from_millis(self.millis.load(Ordering::Acquire));
        clock.now().saturating_duration_since(last)
    }
}

/// Communicator wrapper that stamps every transmission attempt
pub(crate) struct StampedChannel {
    inner: Arc<dyn Communicator>,
    clock: Arc<dyn Clock>,
    last_tx: Arc<LastTransmit>,
}

impl StampedChannel {
    pub(crate) fn new(
        inner: Arc<dyn Communicator>,
        clock: Arc<dyn Clock>,
        last_tx: Arc<LastTransmit>,
    ) -> Self {
        Self {
            inner,
            clock,
            last_tx,
        }
    }
}

impl Communicator for StampedChannel {
    fn send(&self, frame: &CanFrame) -> bool {
        self.last_tx.stamp(self.clock.as_ref());
        self.inner.send(frame)
    }

    fn receive(&self, timeout: Duration) -> Option<CanFrame> {
        self.inner.receive(timeout)
    }

    fn clear_receiver(&self) {
        self.inner.clear_receiver();
    }

    fn open_log(&self, config: &LogConfig) -> Result<(), TransportError> {
        self.inner.open_log(config)
    }

    fn close_log(&self) {
        self.inner.close_log();
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

// =============================================================================
// Keep-alive thread
// =============================================================================

/// Background thread running a tick function until stopped
///
/// The tick returns how long to wait before the next tick, or `None` to end
/// the thread. Dropping the stop sender wakes the thread and ends it.
pub(crate) struct KeepAlive {
    stop: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAlive {
    pub(crate) fn new() -> Self {
        Self {
            stop: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Start the thread; returns false if it could not be spawned
    pub(crate) fn start<F>(self: &Arc<Self>, tick: F) -> bool
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.as_ref().map_or(false, |h| !h.is_finished()) {
            return true;
        }
        if let Some(old) = handle.take() {
            if old.join().is_err() {
                error!("Keep-alive thread panicked, restarting");
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        match std::thread::Builder::new()
            .name("uds-keepalive".to_string())
            .spawn(move || Self::run(stop_rx, tick))
        {
            Ok(h) => {
                *self.stop.lock() = Some(stop_tx);
                *handle = Some(h);
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn keep-alive thread");
                false
            }
        }
    }

    fn run<F>(stop: mpsc::Receiver<()>, mut tick: F)
    where
        F: FnMut() -> Option<Duration>,
    {
        info!("Keep-alive started");
        let mut wait = Duration::ZERO;
        loop {
            match stop.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            match tick() {
                Some(next) => wait = next.max(Duration::from_millis(1)),
                None => break,
            }
        }
        info!("Keep-alive stopped");
    }

    pub(crate) fn stop(&self) {
        let handle = {
            let mut handle = self.handle.lock();
            self.stop.lock().take();
            handle.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Keep-alive thread panicked");
            }
        }
    }
}

impl Inner {
    /// Send Tester Present if nothing was transmitted for a full interval
    pub(super) fn keep_alive_tick(&self) -> Duration {
        let ctx = self.context();
        let interval = ctx.tester_present.interval();
        if interval.is_zero() {
            return DISABLED_RECHECK;
        }

        let clock = self.clock.as_ref();
        let idle = self.last_tx.idle(clock);
        if idle < interval {
            return interval - idle;
        }

        // Never interleave with a physical transaction
        let _exclusive = self.exec_lock.lock();
        let idle = self.last_tx.idle(clock);
        if idle < interval {
            return interval - idle;
        }

        let frame = build(
            &ProtocolFrame::single(vec![
                service_id::TESTER_PRESENT,
                ctx.tester_present.sub_function,
            ]),
            ctx.tester_present_target(),
            ctx.can_type,
            ctx.padding_size,
            ctx.padding_byte,
        );
        if self.channel.send(&frame) {
            debug!(id = format_args!("0x{:X}", frame.id), "Tester present sent");
        } else {
            warn!(id = format_args!("0x{:X}", frame.id), "Tester present send failed");
        }
        interval
    }
}
