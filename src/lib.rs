//! # Swevent
//!
//! Facade crate for the Swevent kernel increment primitive. Re-exports
//! [`swevent_core`] and, behind cargo features, the pluggable components:
//!
//! - `perf` - [`perf::PerfSwevent`], the real `perf_event_open` counter
//! - `dummy` - [`dummy::Tally`], a file backed counter for testing
//! - `build-prop` - [`build_prop::BuildProp`], an Android target detector

pub use swevent_core::*;

#[cfg(feature = "build-prop")]
pub use swevent_build_prop as build_prop;
#[cfg(feature = "dummy")]
pub use swevent_dummy as dummy;
#[cfg(feature = "perf")]
pub use swevent_perf as perf;
