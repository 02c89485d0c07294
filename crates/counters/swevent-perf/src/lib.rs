//! `perf_event_open` based counter.
//!
//! This crate provides the counter that actually triggers the kernel side effect: every
//! call opens a software perf event whose config is the encoded offset. On affected
//! kernels `perf_swevent_init` uses that value as a signed index into
//! `perf_swevent_enabled` and increments the word it lands on.
//!
//! Implements the [`swevent_core::counter::CounterSyscall`] trait.
//!
//! # Platform Requirements
//!
//! - Linux or Android
//! - A kernel without the fix for the `event_id` sign check (CVE-2013-2094)

#![warn(missing_docs)]

mod perf;

pub use perf::PerfSwevent;
