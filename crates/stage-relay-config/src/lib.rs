// crates/stage-relay-config/src/lib.rs
// ============================================================================
// Module: Stage Relay Config Library
// Description: Canonical config model, defaults, and validation.
// Purpose: Single source of truth for stage-relay.toml semantics.
// Dependencies: stage-relay-core, stage-relay-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `stage-relay-config` defines the configuration model for Stage Relay:
//! broker connection, worker pools, cascade declarations, the optional
//! revision store, and logging. Validation is strict and fail-closed; a
//! config that loads successfully always yields a valid [`Topology`].
//!
//! [`Topology`]: stage_relay_core::Topology

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod examples;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
pub use examples::config_toml_example;
