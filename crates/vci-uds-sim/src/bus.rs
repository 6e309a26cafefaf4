//! In-process loopback CAN bus
//!
//! [`SimBus`] is the tester's [`Communicator`]. Every frame sent is offered
//! to each attached [`EcuNode`]; the frames they transmit in reply become
//! receivable by the tester, optionally after a fixed bus latency.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vci_uds::queue::BlockingQueue;
use vci_uds::{CanFrame, Communicator, LogConfig, TransportError};

use crate::config::SimConfig;
use crate::ecu::SimulatedEcu;
use crate::error::SimResult;
use crate::node::EcuNode;

/// Default frame log location when the log config names no path
const DEFAULT_LOG_PATH: &str = "vci-uds-sim.log";

/// Frame log writer
struct FrameLog {
    writer: BufWriter<File>,
    started: Instant,
}

impl FrameLog {
    fn record(&mut self, direction: &str, frame: &CanFrame) {
        let elapsed = self.started.elapsed();
        let result = writeln!(
            self.writer,
            "{:>10.3} {} {:08X} [{:2}]{} {}",
            elapsed.as_secs_f64(),
            direction,
            frame.id,
            frame.data.len(),
            if frame.fd { " FD" } else { "" },
            hex::encode_upper(&frame.data)
        );
        if let Err(e) = result {
            warn!(error = %e, "Frame log write failed");
        }
    }
}

pub struct SimBus {
    nodes: Vec<Mutex<EcuNode>>,
    incoming: BlockingQueue<(Instant, CanFrame)>,
    latency: Duration,
    log: Mutex<Option<FrameLog>>,
    closed: AtomicBool,
}

impl SimBus {
    pub fn new(nodes: Vec<EcuNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(Mutex::new).collect(),
            incoming: BlockingQueue::new(),
            latency: Duration::ZERO,
            log: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a bus with one node per configured ECU
    pub fn from_config(config: &SimConfig) -> SimResult<Self> {
        let mut nodes = Vec::with_capacity(config.ecus.len());
        for ecu_config in &config.ecus {
            let ecu = Arc::new(SimulatedEcu::from_config(ecu_config)?);
            info!(
                ecu = ecu.name(),
                request_id = format_args!("0x{:X}", ecu_config.request_id),
                response_id = format_args!("0x{:X}", ecu_config.response_id),
                "ECU attached"
            );
            nodes.push(EcuNode::new(ecu, ecu_config));
        }
        Ok(Self::new(nodes))
    }

    /// Delay between an ECU transmitting and the tester seeing the frame
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The simulated ECU answering on `response_id`
    pub fn ecu(&self, response_id: u32) -> Option<Arc<SimulatedEcu>> {
        self.nodes.iter().find_map(|node| {
            let node = node.lock();
            (node.response_id() == response_id).then(|| Arc::clone(node.ecu()))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn log_frame(&self, direction: &str, frame: &CanFrame) {
        if let Some(log) = self.log.lock().as_mut() {
            log.record(direction, frame);
        }
    }
}

impl Communicator for SimBus {
    fn send(&self, frame: &CanFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        self.log_frame("Tx", frame);

        let ready_at = Instant::now() + self.latency;
        for node in &self.nodes {
            let replies = node.lock().on_frame(frame);
            for reply in replies {
                self.incoming.push((ready_at, reply));
            }
        }
        true
    }

    fn receive(&self, timeout: Duration) -> Option<CanFrame> {
        let (ready_at, frame) = self.incoming.pop_timeout(timeout)?;
        let now = Instant::now();
        if ready_at > now {
            std::thread::sleep(ready_at - now);
        }
        self.log_frame("Rx", &frame);
        Some(frame)
    }

    fn clear_receiver(&self) {
        let dropped = self.incoming.drain().len();
        if dropped > 0 {
            debug!(dropped, "Discarded stale frames");
        }
    }

    fn open_log(&self, config: &LogConfig) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let path = config
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH));
        let file = File::create(&path)
            .map_err(|e| TransportError::LogFailed(format!("{}: {}", path.display(), e)))?;
        *self.log.lock() = Some(FrameLog {
            writer: BufWriter::new(file),
            started: Instant::now(),
        });
        info!(path = %path.display(), "Frame log opened");
        Ok(())
    }

    fn close_log(&self) {
        if let Some(mut log) = self.log.lock().take() {
            if let Err(e) = log.writer.flush() {
                warn!(error = %e, "Frame log flush failed");
            }
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.incoming.clear();
        info!("Simulated bus closed");
    }
}
