//! Target detection and counter address resolution.
//!
//! The counter the kernel increments sits at a fixed address for a given kernel
//! build. This module provides the [`TargetDetector`] trait to fingerprint the running
//! system and the [`TargetTable`] that maps a fingerprint to that address. There is no
//! fallback: a fingerprint missing from the table ends the run.

use crate::offset::KernelAddr;
use log::error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Identifier of a device and kernel build.
///
/// Produced by a [`TargetDetector`]. Two ids only match if both fields are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId {
    /// Device model, e.g. `ro.product.model`
    pub model: String,
    /// Build identifier, e.g. `ro.build.display.id`
    pub build_id: String,
}

impl TargetId {
    /// Creates a new target id.
    pub fn new(model: impl Into<String>, build_id: impl Into<String>) -> Self {
        TargetId {
            model: model.into(),
            build_id: build_id.into(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.model, self.build_id)
    }
}

/// A known target together with the address of its kernel counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProfile {
    /// Identifier of the target
    #[serde(flatten)]
    pub id: TargetId,
    /// Address of the counter array the kernel indexes with the event id
    pub counter_address: KernelAddr,
}

const BUILTIN_TARGETS: &[(&str, &str, u64)] = &[
    ("F-10D", "V21R48A", 0xc09882f4),
    ("F-11D", "V24R40A", 0xc104cf1c),
    ("HTL21", "JRO03C", 0xc0d07a7c),
    ("IS17SH", "01.00.04", 0xc0ecbebc),
    ("ISW12K", "010.0.3000", 0xc0db6244),
    ("ISW13F", "V69R51I", 0xc09de374),
    ("L-01D", "V20d", 0xc1140768),
    ("L-02E", "V10c", 0xc0c61038),
    ("L-02E", "V10e", 0xc0c61038),
    ("L-06D", "V10k", 0xc12f00e8),
    ("LT29i", "9.1.B.0.411", 0xc0cecd74),
    ("SC-04E", "SC04EOMUAMDI", 0xc11489d4),
    ("SH-04E", "01.00.02", 0xc0ed41ec),
    ("SH-04E", "01.00.03", 0xc0ed41ec),
    ("SOL21", "9.1.D.0.395", 0xc0cedfb4),
    ("Sony Tablet S", "RELEASE5A", 0xc06db714),
    ("Sony Tablet P", "RELEASE5A", 0xc06dd794),
];

/// Errors that can occur when loading a target table.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum TableError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

/// Immutable mapping from [`TargetId`] to counter address.
#[derive(Clone, Debug, Default)]
pub struct TargetTable {
    entries: Vec<TargetProfile>,
}

impl TargetTable {
    /// Returns the table of targets measured so far.
    pub fn builtin() -> Self {
        TargetTable {
            entries: BUILTIN_TARGETS
                .iter()
                .map(|(model, build_id, addr)| TargetProfile {
                    id: TargetId::new(*model, *build_id),
                    counter_address: KernelAddr::new(*addr),
                })
                .collect(),
        }
    }

    /// Creates a table from the given profiles.
    pub fn new(entries: Vec<TargetProfile>) -> Self {
        TargetTable { entries }
    }

    /// Loads a table from a JSON file.
    ///
    /// The file holds an array of objects with `model`, `build_id` and
    /// `counter_address` (JSON number, or string with a `0x` prefix).
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_jsonfile(filepath: impl AsRef<Path>) -> Result<TargetTable, TableError> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let entries: Vec<TargetProfile> = serde_json::from_str(&contents)?;
        Ok(TargetTable { entries })
    }

    /// Merges `other` into this table. Entries of `other` win on exact matches.
    pub fn extend(&mut self, other: TargetTable) {
        for profile in other.entries {
            self.entries.retain(|e| e.id != profile.id);
            self.entries.push(profile);
        }
    }

    /// Looks up the profile for `id`.
    ///
    /// Only exact matches count.
    pub fn resolve(&self, id: &TargetId) -> Option<&TargetProfile> {
        self.entries.iter().find(|e| e.id == *id)
    }

    /// Number of known targets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no target is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all known profiles.
    pub fn iter(&self) -> impl Iterator<Item = &TargetProfile> {
        self.entries.iter()
    }
}

/// Trait for fingerprinting the running system.
///
/// Implementors decide how the device and kernel build are identified. The result
/// must be stable for the lifetime of the process.
///
/// # Examples
///
/// See `swevent-build-prop` for a detector reading Android's `build.prop`, or
/// [`FixedTarget`] for a detector returning a known id.
pub trait TargetDetector {
    /// Identifies the running system.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the identifying information cannot be read.
    fn detect(&self) -> std::io::Result<TargetId>;

    /// Explains to the operator that `id` has no known counter address.
    ///
    /// Called once when resolution fails. The default implementation logs the id
    /// and where to add it.
    fn report_unsupported(&self, id: &TargetId) {
        error!("{} is not supported.", id);
        error!(
            "Add model \"{}\" with build id \"{}\" and its perf_swevent_enabled address to a target table.",
            id.model, id.build_id
        );
    }
}

/// Detector that always reports the same target.
#[derive(Clone, Debug)]
pub struct FixedTarget(pub TargetId);

impl TargetDetector for FixedTarget {
    fn detect(&self) -> std::io::Result<TargetId> {
        Ok(self.0.clone())
    }
}
