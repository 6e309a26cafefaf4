//! Asynchronous request pipelines
//!
//! Each pipeline owns a request channel, a response channel and at most one
//! worker thread. The worker is spawned on demand, exits after an idle
//! period, and is respawned transparently by the next submission. The
//! pipeline itself only tracks admission: requests queued or in flight.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::ResultCode;
use crate::queue::BlockingQueue;

struct WorkerSlot {
    handle: Option<JoinHandle<()>>,
    alive: bool,
}

pub(crate) struct Pipeline<R> {
    name: &'static str,
    capacity: usize,
    idle_timeout: Duration,
    requests: BlockingQueue<Vec<u8>>,
    responses: BlockingQueue<R>,
    /// Requests queued or being processed
    pending: AtomicUsize,
    stopping: AtomicBool,
    worker: Mutex<WorkerSlot>,
}

impl<R: Send + 'static> Pipeline<R> {
    pub(crate) fn new(name: &'static str, capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            name,
            capacity,
            idle_timeout,
            requests: BlockingQueue::new(),
            responses: BlockingQueue::new(),
            pending: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            worker: Mutex::new(WorkerSlot {
                handle: None,
                alive: false,
            }),
        }
    }

    /// Queue a request without blocking
    ///
    /// `job` is only used if a worker has to be spawned; it turns one request
    /// into the responses to queue.
    pub(crate) fn submit<F>(self: &Arc<Self>, payload: Vec<u8>, job: F) -> ResultCode
    where
        F: FnMut(Vec<u8>) -> Vec<R> + Send + 'static,
    {
        if payload.is_empty() {
            return ResultCode::InvalidParam;
        }
        if self.stopping.load(Ordering::Acquire) {
            return ResultCode::Aborted;
        }

        let mut slot = self.worker.lock();
        let finished = slot.handle.as_ref().map_or(true, JoinHandle::is_finished);
        if !slot.alive || finished {
            // A previous worker may have exited on idle or panicked; reap it first
            if let Some(old) = slot.handle.take() {
                if old.join().is_err() {
                    error!(pipeline = self.name, "Worker panicked, restarting");
                    // The request it was running is lost
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
            slot.alive = false;
        }

        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            debug!(pipeline = self.name, capacity = self.capacity, "Request queue full");
            return ResultCode::QueueFull;
        }
        self.requests.push(payload);

        if !slot.alive {
            let pipeline = Arc::clone(self);
            let spawned = std::thread::Builder::new()
                .name(format!("uds-{}", self.name))
                .spawn(move || pipeline.run(job));
            match spawned {
                Ok(handle) => {
                    slot.handle = Some(handle);
                    slot.alive = true;
                }
                Err(e) => {
                    error!(pipeline = self.name, error = %e, "Failed to spawn worker");
                    self.requests.clear();
                    self.pending.store(0, Ordering::Release);
                    return ResultCode::InternalError;
                }
            }
        }
        ResultCode::Ok
    }

    fn run<F>(self: Arc<Self>, mut job: F)
    where
        F: FnMut(Vec<u8>) -> Vec<R>,
    {
        info!(pipeline = self.name, "Worker started");
        loop {
            let payload = match self.requests.pop_timeout(self.idle_timeout) {
                Some(payload) => payload,
                None => {
                    // Submitters push under the slot lock, so nothing can slip in after this
                    let mut slot = self.worker.lock();
                    match self.requests.try_pop() {
                        Some(payload) => payload,
                        None => {
                            slot.alive = false;
                            info!(
                                pipeline = self.name,
                                idle = ?self.idle_timeout,
                                "Worker idle timeout, exiting"
                            );
                            return;
                        }
                    }
                }
            };

            if payload.is_empty() {
                if self.stopping.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }

            if !self.stopping.load(Ordering::Acquire) {
                let results = job(payload);
                self.responses.push_all(results);
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        info!(pipeline = self.name, "Worker stopped");
    }

    /// Stop the worker and wait for it to exit
    ///
    /// The current job runs to completion; queued requests are discarded.
    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let handle = {
            let mut slot = self.worker.lock();
            slot.alive = false;
            slot.handle.take()
        };
        if let Some(handle) = handle {
            // Empty payload unblocks a worker waiting on the queue
            self.requests.push(Vec::new());
            if handle.join().is_err() {
                error!(pipeline = self.name, "Worker panicked");
            }
        }
        self.requests.clear();
        self.pending.store(0, Ordering::Release);
    }

    pub(crate) fn read(&self, timeout: Duration) -> Option<R> {
        self.responses.pop_timeout(timeout)
    }

    pub(crate) fn read_bulk(&self, max: usize, timeout: Duration) -> Vec<R> {
        self.responses.pop_bulk_timeout(max, timeout)
    }

    /// Drop queued requests and unread responses
    pub(crate) fn clear(&self) {
        let dropped = self
            .requests
            .drain()
            .into_iter()
            .filter(|p| !p.is_empty())
            .count();
        self.pending.fetch_sub(dropped, Ordering::AcqRel);
        self.responses.clear();
    }

    pub(crate) fn is_worker_alive(&self) -> bool {
        self.worker.lock().alive
    }
}
