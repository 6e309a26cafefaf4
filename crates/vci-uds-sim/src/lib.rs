//! vci-uds-sim - Simulated ECUs for the vci-uds engine
//!
//! Provides an in-process CAN bus with simulated ECUs so the transaction
//! engine can be exercised end to end without hardware.
//!
//! # Modules
//!
//! - [`bus`] - loopback [`Communicator`](vci_uds::Communicator) with frame log
//! - [`node`] - ECU-side ISO-TP endpoint (flow control in both directions)
//! - [`ecu`] - UDS service handling of a simulated ECU
//! - [`config`] - TOML configuration for tester and ECUs

pub mod bus;
pub mod config;
pub mod ecu;
pub mod error;
pub mod node;

pub use bus::SimBus;
pub use config::{DidConfig, EcuConfig, SimConfig};
pub use ecu::SimulatedEcu;
pub use error::{SimError, SimResult};
pub use node::EcuNode;
