//! Diagnostic service façade
//!
//! [`Service`] owns the session configuration and the communicator, and
//! offers three ways to run requests:
//!
//! - [`Service::request_sync`] runs a [`Transaction`] on the calling thread
//! - [`Service::request_async`] queues it for the physical worker thread
//! - [`Service::request_functional`] queues a broadcast for the functional
//!   worker thread
//!
//! Physical transactions, from any source, and keep-alive frames are
//! serialized by one execution lock. Functional broadcasts use their own
//! lock and may overlap a physical exchange. Cancellation handles for the
//! running transactions live behind separate small locks so [`Service::abort`]
//! never waits for a transaction to finish.

mod keepalive;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use self::keepalive::{KeepAlive, LastTransmit, StampedChannel};
use self::worker::Pipeline;
use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::config::{LogConfig, SecurityAlgoConfig, ServiceOptions, SessionContext};
use crate::error::{ConfigError, ResultCode};
use crate::security::{self, ConfiguredKeyProvider, SecurityProvider};
use crate::transport::Communicator;
use crate::uds::{FunctionalResponse, FunctionalTransaction, Transaction};

/// Result code and response bytes of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsResponse {
    pub result_code: ResultCode,
    pub payload: Vec<u8>,
}

impl UdsResponse {
    pub fn error(result_code: ResultCode) -> Self {
        Self {
            result_code,
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result_code.is_ok()
    }
}

/// Shared state behind a [`Service`], also reachable from its threads
pub(crate) struct Inner {
    comm: Arc<dyn Communicator>,
    /// `comm` wrapped so every send updates `last_tx`
    channel: Arc<dyn Communicator>,
    clock: Arc<dyn Clock>,
    options: ServiceOptions,
    provider: Arc<dyn SecurityProvider>,

    context: RwLock<Arc<SessionContext>>,
    security: RwLock<Arc<SecurityAlgoConfig>>,

    exec_lock: Mutex<()>,
    functional_lock: Mutex<()>,
    active: Mutex<Option<CancellationToken>>,
    active_functional: Mutex<Option<CancellationToken>>,

    last_tx: Arc<LastTransmit>,
    running: AtomicBool,
    physical: Arc<Pipeline<UdsResponse>>,
    functional: Arc<Pipeline<FunctionalResponse>>,
    keep_alive: Arc<KeepAlive>,
}

impl Inner {
    fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.context.read())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one physical transaction under the execution lock
    fn execute_physical(&self, payload: Vec<u8>) -> UdsResponse {
        if !self.is_running() {
            return UdsResponse::error(ResultCode::Aborted);
        }

        let transaction = Transaction::new(self.context(), Arc::clone(&self.channel), payload);
        let mut transaction = match transaction {
            Ok(t) => t
                .with_clock(Arc::clone(&self.clock))
                .with_poll_interval(self.options.poll_interval),
            Err(e) => {
                warn!(error = %e, "Rejected request");
                return UdsResponse::error(e.into());
            }
        };

        let result = {
            let _exclusive = self.exec_lock.lock();
            *self.active.lock() = Some(transaction.cancellation_token());
            if !self.is_running() {
                transaction.stop_execution();
            }
            self.comm.clear_receiver();
            let result = transaction.execute();
            *self.active.lock() = None;
            result
        };

        UdsResponse {
            result_code: result.result_code,
            payload: result.response_payload,
        }
    }

    /// Run one functional broadcast under the functional lock
    fn execute_functional(&self, payload: Vec<u8>) -> Vec<FunctionalResponse> {
        if !self.is_running() {
            return Vec::new();
        }

        let transaction =
            FunctionalTransaction::new(self.context(), Arc::clone(&self.channel), payload);
        let mut transaction = match transaction {
            Ok(t) => t
                .with_clock(Arc::clone(&self.clock))
                .with_poll_interval(self.options.poll_interval),
            Err(e) => {
                warn!(error = %e, "Rejected functional request");
                return Vec::new();
            }
        };

        let _exclusive = self.functional_lock.lock();
        *self.active_functional.lock() = Some(transaction.cancellation_token());
        let responses = transaction.execute();
        *self.active_functional.lock() = None;
        responses
    }

    fn abort(&self) {
        if let Some(token) = self.active.lock().as_ref() {
            token.cancel();
        }
        if let Some(token) = self.active_functional.lock().as_ref() {
            token.cancel();
        }
    }
}

/// Builder for [`Service`]
pub struct ServiceBuilder {
    comm: Arc<dyn Communicator>,
    context: SessionContext,
    security: SecurityAlgoConfig,
    clock: Arc<dyn Clock>,
    options: ServiceOptions,
    provider: Arc<dyn SecurityProvider>,
}

impl ServiceBuilder {
    pub fn context(mut self, context: SessionContext) -> Self {
        self.context = context;
        self
    }

    pub fn security_config(mut self, config: SecurityAlgoConfig) -> Self {
        self.security = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn security_provider(mut self, provider: Arc<dyn SecurityProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn build(self) -> Result<Service, ConfigError> {
        self.context.validate()?;

        let last_tx = Arc::new(LastTransmit::new(self.clock.as_ref()));
        let channel: Arc<dyn Communicator> = Arc::new(StampedChannel::new(
            Arc::clone(&self.comm),
            Arc::clone(&self.clock),
            Arc::clone(&last_tx),
        ));
        let options = self.options;

        info!(
            request_id = format_args!("0x{:X}", self.context.request_id),
            response_id = format_args!("0x{:X}", self.context.response_id),
            can_type = ?self.context.can_type,
            "UDS service created"
        );

        Ok(Service {
            inner: Arc::new(Inner {
                comm: self.comm,
                channel,
                clock: self.clock,
                provider: self.provider,
                context: RwLock::new(Arc::new(self.context)),
                security: RwLock::new(Arc::new(self.security)),
                exec_lock: Mutex::new(()),
                functional_lock: Mutex::new(()),
                active: Mutex::new(None),
                active_functional: Mutex::new(None),
                last_tx,
                running: AtomicBool::new(true),
                physical: Arc::new(Pipeline::new(
                    "physical",
                    options.request_queue_size,
                    options.worker_idle_timeout,
                )),
                functional: Arc::new(Pipeline::new(
                    "functional",
                    options.request_queue_size,
                    options.worker_idle_timeout,
                )),
                keep_alive: Arc::new(KeepAlive::new()),
                options,
            }),
        })
    }
}

/// UDS diagnostic service bound to one communicator
///
/// Dropping the service shuts it down.
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn builder(comm: Arc<dyn Communicator>) -> ServiceBuilder {
        ServiceBuilder {
            comm,
            context: SessionContext::default(),
            security: SecurityAlgoConfig::default(),
            clock: Arc::new(SystemClock),
            options: ServiceOptions::default(),
            provider: Arc::new(ConfiguredKeyProvider),
        }
    }

    pub fn new(comm: Arc<dyn Communicator>, context: SessionContext) -> Result<Self, ConfigError> {
        Self::builder(comm).context(context).build()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Current session context snapshot
    pub fn context(&self) -> Arc<SessionContext> {
        self.inner.context()
    }

    pub fn security_config(&self) -> Arc<SecurityAlgoConfig> {
        Arc::clone(&self.inner.security.read())
    }

    /// Apply a partial TOML update to the session context
    ///
    /// Transactions already running keep the snapshot they started with.
    /// Blank input leaves the context unchanged.
    pub fn set_uds_config(&self, text: &str) -> ResultCode {
        let mut current = self.inner.context.write();
        match current.patched(text) {
            Ok(Some(next)) => {
                info!(
                    request_id = format_args!("0x{:X}", next.request_id),
                    response_id = format_args!("0x{:X}", next.response_id),
                    "Session context updated"
                );
                *current = Arc::new(next);
                ResultCode::Ok
            }
            Ok(None) => ResultCode::Ok,
            Err(e) => {
                warn!(error = %e, "Rejected session configuration");
                ResultCode::ConfigFailed
            }
        }
    }

    /// Replace the security algorithm configuration from TOML
    pub fn set_security_config(&self, text: &str) -> ResultCode {
        match SecurityAlgoConfig::from_toml(text) {
            Ok(Some(config)) => {
                info!(config = ?config, "Security configuration updated");
                *self.inner.security.write() = Arc::new(config);
                ResultCode::Ok
            }
            Ok(None) => ResultCode::Ok,
            Err(e) => {
                warn!(error = %e, "Rejected security configuration");
                ResultCode::SecurityConfigFailed
            }
        }
    }

    /// Enable or disable the communicator's frame log
    pub fn set_log_config(&self, text: &str) -> ResultCode {
        let config = match LogConfig::from_toml(text) {
            Ok(Some(config)) => config,
            Ok(None) => return ResultCode::Ok,
            Err(e) => {
                warn!(error = %e, "Rejected log configuration");
                return ResultCode::ConfigLoggerFailed;
            }
        };

        if !config.enabled {
            self.inner.comm.close_log();
            info!("Frame log closed");
            return ResultCode::Ok;
        }
        match self.inner.comm.open_log(&config) {
            Ok(()) => {
                info!(path = ?config.path, "Frame log opened");
                ResultCode::Ok
            }
            Err(e) => {
                warn!(error = %e, "Failed to open frame log");
                ResultCode::ConfigLoggerFailed
            }
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Run one request on the calling thread
    pub fn request_sync(&self, payload: &[u8]) -> UdsResponse {
        self.inner.execute_physical(payload.to_vec())
    }

    /// Queue a request for the physical worker; never blocks
    pub fn request_async(&self, payload: &[u8]) -> ResultCode {
        if !self.inner.is_running() {
            return ResultCode::Aborted;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.physical.submit(payload.to_vec(), move |request| {
            let Some(inner) = weak.upgrade() else {
                return Vec::new();
            };
            let response = inner.execute_physical(request);
            if response.result_code == ResultCode::Aborted {
                debug!("Dropping aborted async result");
                return Vec::new();
            }
            vec![response]
        })
    }

    /// Next queued async result, waiting up to `timeout`
    pub fn read_response(&self, timeout: Duration) -> UdsResponse {
        self.inner
            .physical
            .read(timeout)
            .unwrap_or_else(|| UdsResponse::error(ResultCode::NoResponseInQueue))
    }

    /// Queue a functional broadcast; never blocks
    pub fn request_functional(&self, payload: &[u8]) -> ResultCode {
        if !self.inner.is_running() {
            return ResultCode::Aborted;
        }
        let capacity = self.inner.context().can_type.single_frame_capacity();
        if payload.len() > capacity {
            warn!(len = payload.len(), capacity, "Functional request exceeds a single frame");
            return ResultCode::PayloadTooLarge;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.functional.submit(payload.to_vec(), move |request| {
            weak.upgrade()
                .map(|inner| inner.execute_functional(request))
                .unwrap_or_default()
        })
    }

    /// Up to `max_count` queued functional replies
    ///
    /// Waits up to `timeout` for the first one; a zero timeout only takes
    /// what is already queued.
    pub fn read_functional_responses(
        &self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<FunctionalResponse>, ResultCode> {
        let responses = self.inner.functional.read_bulk(max_count, timeout);
        if responses.is_empty() {
            Err(ResultCode::NoResponseInQueue)
        } else {
            Ok(responses)
        }
    }

    /// Drop queued requests and unread responses of both pipelines
    pub fn clear_async_queues(&self) {
        self.inner.physical.clear();
        self.inner.functional.clear();
        debug!("Async queues cleared");
    }

    /// Cancel the running physical and functional transactions
    pub fn abort(&self) {
        info!("Abort requested");
        self.inner.abort();
    }

    // =========================================================================
    // Security access
    // =========================================================================

    /// Unlock `level` with the configured provider and algorithm
    pub fn security_access(&self, level: u8) -> UdsResponse {
        let provider = Arc::clone(&self.inner.provider);
        let config = self.security_config();
        self.security_access_with(provider.as_ref(), &config, level)
    }

    /// Unlock `level` with an explicit provider and algorithm
    ///
    /// A seed of all zero bytes means the level is already unlocked; the seed
    /// response is returned without sending a key.
    pub fn security_access_with(
        &self,
        provider: &dyn SecurityProvider,
        config: &SecurityAlgoConfig,
        level: u8,
    ) -> UdsResponse {
        let seed_request = match security::seed_request(level) {
            Ok(request) => request,
            Err(code) => return UdsResponse::error(code),
        };

        let seed_response = self.request_sync(&seed_request);
        if !seed_response.is_ok() {
            warn!(level, result = %seed_response.result_code, "Seed request failed");
            return seed_response;
        }

        let seed = match security::extract_seed(level, &seed_response.payload) {
            Ok(seed) => seed,
            Err(code) => {
                warn!(level, response = ?seed_response.payload, "Invalid seed response");
                return UdsResponse {
                    result_code: code,
                    payload: seed_response.payload,
                };
            }
        };

        if security::is_unlocked_seed(seed) {
            info!(level, "Security already unlocked (zero seed)");
            return seed_response;
        }
        info!(level, seed_len = seed.len(), "Security seed received");

        let key = match provider.calculate_key(level, seed, config) {
            Ok(key) => key,
            Err(e) => {
                warn!(level, error = %e, "Key calculation failed");
                return UdsResponse::error(e.into());
            }
        };

        let response = self.request_sync(&security::key_request(level, &key));
        if response.is_ok() {
            info!(level, "Security access granted");
        } else {
            warn!(level, result = %response.result_code, "Security key rejected");
        }
        response
    }

    // =========================================================================
    // Keep-alive and lifecycle
    // =========================================================================

    /// Start sending Tester Present whenever the bus is idle for an interval
    pub fn start_keep_alive(&self) -> ResultCode {
        if !self.inner.is_running() {
            return ResultCode::Aborted;
        }
        self.inner.last_tx.stamp(self.inner.clock.as_ref());

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let started = self.inner.keep_alive.start(move || {
            let inner = weak.upgrade()?;
            inner.is_running().then(|| inner.keep_alive_tick())
        });
        if started {
            ResultCode::Ok
        } else {
            ResultCode::InternalError
        }
    }

    pub fn stop_keep_alive(&self) {
        self.inner.keep_alive.stop();
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.inner.keep_alive.is_running()
    }

    /// Stop all threads and release the communicator
    ///
    /// Idempotent. Any running transaction is aborted; queued requests are
    /// discarded. Later requests return [`ResultCode::Aborted`].
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("UDS service shutting down");

        self.inner.abort();
        self.inner.keep_alive.stop();
        self.inner.physical.stop();
        self.inner.functional.stop();

        // Wait out any synchronous caller still inside a transaction
        let _exclusive = self.inner.exec_lock.lock();
        let _functional = self.inner.functional_lock.lock();
        self.inner.comm.close_log();
        self.inner.comm.shutdown();
        info!("UDS service stopped");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}
