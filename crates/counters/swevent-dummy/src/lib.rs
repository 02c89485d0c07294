//! Dummy counter for testing.
//!
//! This crate provides a counter that never touches kernel memory. Each call opens
//! a real file handle, so workers hit the same open file limits as with the real
//! call, and records the increment in a tally file that tests can inspect.
//!
//! Implements the [`swevent_core::counter::CounterSyscall`] trait.
//!
//! # Use Cases
//!
//! - Integration testing of the Swevent orchestration on any Linux host
//! - Checking how many increments were issued before a callback runs

#![warn(missing_docs)]

mod dummy;

pub use dummy::{RECORD_SIZE, Tally, TallyError};
