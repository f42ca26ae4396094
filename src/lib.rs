//! # Trading Wire Library
//!
//! The messaging substrate shared by the strategy, gateway, and account/risk
//! processes of the trading platform. Everything that crosses a process
//! boundary goes through this crate.
//!
//! ## Modules
//! - `codec`: Self-describing object serialization and the class/enum registry.
//! - `comms`: Point-to-point, many-to-one, and broadcast connections over ZMQ,
//!   with per-connection statistics.
//! - `processor`: Sequential, health-monitored event queue processor.

pub mod codec;
pub mod comms;
pub mod processor;

mod macros;
mod thread_util;
