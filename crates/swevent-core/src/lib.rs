//! # Swevent Core
//!
//! `swevent-core` is the foundational library for turning the perf software event
//! counter into an "increment arbitrary kernel address" primitive. The kernel
//! increments a 32-bit counter at `counter_address + offset * 4` for every opened
//! software event, where `offset` is taken from the caller. Pointing the offset at
//! a different address and opening enough events turns that side effect into a
//! controlled add.
//!
//! ## Architecture Overview
//!
//! The crate is built around three traits that define the interface for each
//! pluggable component:
//!
//! - [`target::TargetDetector`] - Fingerprints the running system so the fixed
//!   counter address can be looked up in a [`target::TargetTable`].
//!
//! - [`counter::CounterSyscall`] - Issues a single counting call. The production
//!   implementation lives in `swevent-perf`, a file-backed stand-in in `swevent-dummy`.
//!
//! - [`worker::WorkerSpawner`] - Creates one worker process that performs a batch
//!   of counting calls and reports back over a pipe.
//!
//! ## Main Components
//!
//! - [`Swevent`] - The orchestrator that resolves the counter address, plans the
//!   batches, spawns the workers one after another, runs the caller's callback and
//!   tears every worker down again.
//!
//! - [`offset`] module - Offset encoding and the packed argument block of the call.
//!
//! - [`worker`] module - Worker handles, the pool owned by a run, and the fork
//!   based spawner.
//!
//! ## Platform Support
//!
//! Workers are created with `fork(2)` and signalled with `kill(2)`, so only Linux
//! and Android are supported. The kernel side effect only exists on kernels that
//! predate the fix for the signed event id check in `perf_swevent_init`.

#![warn(missing_docs)]

pub mod counter;
pub mod offset;
mod swevent;
pub mod target;
pub mod util;
pub mod worker;

pub use swevent::{
    BatchPlan, BuildError, Swevent, SweventBuilder, SweventConfig, SweventError, ZeroPlanPolicy,
};
