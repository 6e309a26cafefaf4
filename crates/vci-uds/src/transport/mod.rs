//! Transport layer for UDS communication
//!
//! The engine talks to the bus through the [`Communicator`] trait: a pair of
//! blocking primitives that send and receive already-framed CAN messages.
//! Concrete bus drivers live outside this crate; a scripted
//! [`MockCommunicator`](mock::MockCommunicator) is provided for tests.

mod adapter;
pub mod error;
pub mod mock;

pub use adapter::{CanFrame, Communicator};
pub use error::TransportError;
