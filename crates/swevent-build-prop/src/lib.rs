//! `build.prop` based target detector.
//!
//! This crate provides a detector that identifies an Android device by the model and
//! build id recorded in its `build.prop`. These two values select the kernel build and
//! with it the counter address.
//!
//! Implements the [`swevent_core::target::TargetDetector`] trait.
//!
//! # Platform Requirements
//!
//! - Android, or any system with a `build.prop` style properties file

#![warn(missing_docs)]

mod build_prop;

pub use build_prop::{BuildProp, DEFAULT_BUILD_PROP, parse_props};
