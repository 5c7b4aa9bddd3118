// crates/stage-relay-core/src/core/stage.rs
// ============================================================================
// Module: Stage Relay Stages
// Description: Closed enumeration of pipeline stage names.
// Purpose: Reject unrecognized stage names loudly instead of matching nothing.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! [`Stage`] is the closed set of processing steps a dataset moves through.
//! Wire names are snake_case and stable; parsing any other name fails with
//! [`StageError::UnknownStage`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when parsing stage names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Stage name is not part of the closed stage set.
    #[error("unknown stage: {0}")]
    UnknownStage(String),
}

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Pipeline stage producing one artifact type per dataset.
///
/// # Invariants
/// - Wire names returned by [`Stage::as_str`] round-trip through [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Uploaded source grid.
    Raw,
    /// Regridding onto the model grid.
    Regrid,
    /// Internal ocean detection.
    InternalOceans,
    /// River routing.
    Routing,
    /// Bathymetry produced by the routing step.
    Bathy,
    /// Soils produced by the routing step.
    Soils,
    /// High resolution topography produced by the routing step.
    TopoHighRes,
    /// Passage problem correction.
    PassageProblems,
    /// Sub-basin extraction.
    Subbasins,
    /// Plant functional type mapping.
    Pft,
    /// Geothermal heat flow.
    Heatflow,
    /// Ocean mixing coefficients.
    Ahmcoef,
    /// Grid mosaic weights.
    Mosaix,
}

impl Stage {
    /// All stages in declaration order.
    pub const ALL: [Self; 13] = [
        Self::Raw,
        Self::Regrid,
        Self::InternalOceans,
        Self::Routing,
        Self::Bathy,
        Self::Soils,
        Self::TopoHighRes,
        Self::PassageProblems,
        Self::Subbasins,
        Self::Pft,
        Self::Heatflow,
        Self::Ahmcoef,
        Self::Mosaix,
    ];

    /// Returns the stable wire name for the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Regrid => "regrid",
            Self::InternalOceans => "internal_oceans",
            Self::Routing => "routing",
            Self::Bathy => "bathy",
            Self::Soils => "soils",
            Self::TopoHighRes => "topo_high_res",
            Self::PassageProblems => "passage_problems",
            Self::Subbasins => "subbasins",
            Self::Pft => "pft",
            Self::Heatflow => "heatflow",
            Self::Ahmcoef => "ahmcoef",
            Self::Mosaix => "mosaix",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
            .ok_or_else(|| StageError::UnknownStage(value.to_string()))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
