//! vci-uds - UDS diagnostic transaction engine over ISO-TP
//!
//! This crate runs UDS (ISO 14229) request/response exchanges over ISO-TP
//! (ISO 15765-2) on classic CAN or CAN-FD, on top of any bus driver that
//! implements [`Communicator`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Service                             │
//! │  sync / async / functional requests, security access,       │
//! │  keep-alive, runtime configuration                          │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ physical    │  │ functional  │  │ keep-alive          │  │
//! │  │ worker      │  │ worker      │  │ (Tester Present)    │  │
//! │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//! │         │                │                    │             │
//! │  ┌──────┴──────┐  ┌──────┴───────────┐        │             │
//! │  │ Transaction │  │ Functional-      │        │             │
//! │  │ (FSM)       │  │ Transaction      │        │             │
//! │  └──────┬──────┘  └──────┬───────────┘        │             │
//! │         │                │                    │             │
//! │  ┌──────┴────────────────┴────────────────────┴──────────┐  │
//! │  │ isotp: frame codec, Segmenter, Reassembler            │  │
//! │  └──────────────────────────┬────────────────────────────┘  │
//! │                             │                               │
//! │                    ┌────────┴────────┐                      │
//! │                    │  Communicator   │                      │
//! │                    │  (bus driver)   │                      │
//! │                    └─────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vci_uds::transport::mock::MockCommunicator;
//! use vci_uds::{ResultCode, Service, SessionContext};
//!
//! # fn main() -> Result<(), vci_uds::ConfigError> {
//! let bus = Arc::new(MockCommunicator::new());
//! let service = Service::new(bus, SessionContext::default())?;
//! let response = service.request_sync(&[0x22, 0xF1, 0x90]);
//! if response.result_code == ResultCode::Ok {
//!     println!("VIN: {:02X?}", &response.payload[3..]);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod isotp;
pub mod queue;
pub mod security;
pub mod service;
pub mod transport;
pub mod uds;

pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CanType, CrcVariant, LogConfig, SecurityAlgoConfig, ServiceOptions, SessionContext,
    TesterPresentConfig, TimingConfig,
};
pub use error::{ConfigError, ResultCode, SecurityError, TransactionError};
pub use security::{ConfiguredKeyProvider, SecurityProvider};
pub use service::{Service, ServiceBuilder, UdsResponse};
pub use transport::{CanFrame, Communicator, TransportError};
pub use uds::{
    FunctionalResponse, FunctionalTransaction, NegativeResponseCode, Transaction,
    TransactionResult, TransactionState,
};
