// crates/stage-relay-cli/src/logging.rs
// ============================================================================
// Module: Stage Relay CLI Logging
// Description: tracing-subscriber initialisation for the relay binary.
// Purpose: Emit structured logs to stderr in pretty or JSON form.
// Dependencies: stage-relay-config, thiserror, tracing-subscriber
// ============================================================================

//! ## Overview
//! The filter directive comes from `RUST_LOG` when set, then from
//! `[logging] filter`, then defaults to `info`. Logs always go to stderr so
//! command output on stdout stays machine readable.

// ============================================================================
// SECTION: Imports
// ============================================================================

use stage_relay_config::LogFormat;
use stage_relay_config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Filter directive used when neither the environment nor config sets one.
pub const DEFAULT_FILTER: &str = "info";

/// Environment variable holding the filter directive.
pub const LOG_ENV_VAR: &str = "RUST_LOG";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Logging initialisation errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive did not parse.
    #[error("invalid log filter '{directive}': {reason}")]
    InvalidFilter {
        /// Offending directive.
        directive: String,
        /// Parser message.
        reason: String,
    },
    /// A global subscriber was already installed.
    #[error("logging initialisation failed: {0}")]
    Install(String),
}

// ============================================================================
// SECTION: Initialisation
// ============================================================================

/// Picks the effective filter directive and parses it.
///
/// # Errors
///
/// Returns [`LoggingError::InvalidFilter`] when the directive does not parse.
pub fn resolve_filter(
    env_directive: Option<&str>,
    configured: Option<&str>,
) -> Result<EnvFilter, LoggingError> {
    let directive = env_directive
        .filter(|value| !value.trim().is_empty())
        .or(configured)
        .unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directive).map_err(|err| LoggingError::InvalidFilter {
        directive: directive.to_string(),
        reason: err.to_string(),
    })
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_directive = std::env::var(LOG_ENV_VAR).ok();
    let filter = resolve_filter(env_directive.as_deref(), config.filter.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => {
            registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init()
        }
        LogFormat::Pretty => {
            registry.with(fmt::layer().pretty().with_writer(std::io::stderr)).try_init()
        }
    };
    installed.map_err(|err| LoggingError::Install(err.to_string()))
}
