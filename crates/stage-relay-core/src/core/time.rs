// crates/stage-relay-core/src/core/time.rs
// ============================================================================
// Module: Stage Relay Time Model
// Description: Timestamp representation for revision records.
// Purpose: Keep revision timestamps explicit and serializable.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Revisions record when they were appended. Stores stamp wall-clock unix
//! milliseconds; tests may construct logical timestamps directly.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Time Values
// ============================================================================

/// Timestamp attached to revision records.
///
/// # Invariants
/// - No validation is performed; monotonicity is not required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Timestamp {
    /// Unix epoch milliseconds.
    UnixMillis(i64),
    /// Monotonic logical time value.
    Logical(u64),
}

impl Timestamp {
    /// Returns the current wall-clock time as unix milliseconds.
    ///
    /// Clocks set before the epoch collapse to zero.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
        Self::UnixMillis(millis)
    }

    /// Returns the timestamp as unix milliseconds when available.
    #[must_use]
    pub const fn as_unix_millis(&self) -> Option<i64> {
        match self {
            Self::UnixMillis(value) => Some(*value),
            Self::Logical(_) => None,
        }
    }
}
