// crates/stage-relay-core/src/core/identifiers.rs
// ============================================================================
// Module: Stage Relay Identifiers
// Description: Canonical opaque identifiers for datasets and worker pools.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Identifiers are opaque and serialize as numbers or strings on the wire.
//! Dataset identifiers enforce the non-zero, 1-based invariant of the
//! ingestion database at construction boundaries.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Identifier Types
// ============================================================================

/// Dataset identifier assigned at ingestion.
///
/// # Invariants
/// - Always >= 1 (non-zero, 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(NonZeroU64);

impl DatasetId {
    /// Creates a new dataset identifier from a non-zero value.
    #[must_use]
    pub const fn new(id: NonZeroU64) -> Self {
        Self(id)
    }

    /// Creates a dataset identifier from a raw value (returns `None` if zero).
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Returns the raw identifier value (always >= 1).
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.get().fmt(f)
    }
}

impl FromStr for DatasetId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = value.trim().parse::<u64>().map_err(|err| format!("invalid dataset id: {err}"))?;
        Self::from_raw(raw).ok_or_else(|| "dataset id must be non-zero".to_string())
    }
}

/// Worker pool identifier.
///
/// Pool identifiers become the last segment of outbound routing keys, so the
/// routing table rejects identifiers that are not valid topic segments.
///
/// # Invariants
/// - Opaque UTF-8 string; validation happens when a routing table is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerPoolId(String);

impl WorkerPoolId {
    /// Creates a new worker pool identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerPoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkerPoolId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for WorkerPoolId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
