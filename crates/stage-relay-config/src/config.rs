// crates/stage-relay-config/src/config.rs
// ============================================================================
// Module: Stage Relay Configuration
// Description: Configuration loading and validation for Stage Relay.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: stage-relay-core, stage-relay-store-sqlite, serde, toml, url
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits.
//! When no file is given and none exists at the default location, built-in
//! defaults describing the preprocessing pipeline are used. The broker host
//! can always be overridden with `BROKER_HOSTNAME`.
//!
//! Invariants:
//! - A validated config always builds a valid [`Topology`].
//! - No worker pool shares its name with the completion suffix.
//! - Broker credentials and vhost are percent-encoded in the AMQP URI.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use stage_relay_core::DependencyGraph;
use stage_relay_core::RoutingKeyScheme;
use stage_relay_core::RoutingTable;
use stage_relay_core::Stage;
use stage_relay_core::Topology;
use stage_relay_core::TopologyError;
use stage_relay_core::WorkerPoolId;
use stage_relay_store_sqlite::SqliteStoreConfig;
use thiserror::Error;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
pub const DEFAULT_CONFIG_NAME: &str = "stage-relay.toml";
/// Environment variable overriding the config path.
pub const CONFIG_ENV_VAR: &str = "STAGE_RELAY_CONFIG";
/// Environment variable overriding the broker host.
pub const BROKER_HOSTNAME_ENV_VAR: &str = "BROKER_HOSTNAME";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum broker hostname length.
pub(crate) const MAX_HOSTNAME_LENGTH: usize = 253;
/// Maximum AMQP short string length (exchange and queue names).
pub(crate) const MAX_AMQP_NAME_LENGTH: usize = 255;
/// Maximum number of worker pools.
pub(crate) const MAX_POOLS: usize = 64;
/// Default AMQP port.
pub(crate) const DEFAULT_BROKER_PORT: u16 = 5672;
/// Default pipeline namespace, also used as the exchange name.
pub(crate) const DEFAULT_NAMESPACE: &str = "preprocessing";
/// Default durable dispatcher queue.
pub(crate) const DEFAULT_QUEUE: &str = "preprocessing_task_queue";
/// Default completion suffix.
pub(crate) const DEFAULT_COMPLETION_SUFFIX: &str = "done";
/// Default initial reconnect delay in milliseconds.
pub(crate) const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
/// Default maximum reconnect delay in milliseconds.
pub(crate) const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

// ============================================================================
// SECTION: Configuration Types
// ============================================================================

/// Stage Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageRelayConfig {
    /// Broker connection and addressing.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Worker pool declarations.
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,
    /// Cascade declarations.
    #[serde(default = "default_cascade")]
    pub cascade: Vec<CascadeConfig>,
    /// Optional revision store used as the staleness ledger.
    #[serde(default)]
    pub store: Option<SqliteStoreConfig>,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for StageRelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            pools: default_pools(),
            cascade: default_cascade(),
            store: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl StageRelayConfig {
    /// Loads configuration using process environment defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| env::var(key).ok())
    }

    /// Loads configuration with an explicit environment lookup.
    ///
    /// Resolution order: `path`, then `STAGE_RELAY_CONFIG`, then
    /// `stage-relay.toml` when it exists, then built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load_with_env<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match resolve_path(path, &lookup)? {
            Some(resolved) => Self::read_file(&resolved)?,
            None => Self::default(),
        };
        config.apply_env_overrides(&lookup);
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file from disk without validating it.
    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        validate_path(path)?;
        let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Applies environment overrides.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(BROKER_HOSTNAME_ENV_VAR) {
            let host = host.trim();
            if !host.is_empty() {
                self.broker.host = host.to_string();
            }
        }
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.validate_pools()?;
        if let Some(store) = &self.store {
            validate_path_string("store.path", &store.path.to_string_lossy())?;
        }
        self.build_topology()?;
        Ok(())
    }

    /// Validates pool names and counts.
    fn validate_pools(&self) -> Result<(), ConfigError> {
        if self.pools.len() > MAX_POOLS {
            return Err(ConfigError::Invalid(format!("too many pools (max {MAX_POOLS})")));
        }
        let mut names = BTreeSet::new();
        for pool in &self.pools {
            if !names.insert(pool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "pool '{}' is declared more than once",
                    pool.name
                )));
            }
            if pool.name == self.broker.completion_suffix {
                return Err(ConfigError::Invalid(format!(
                    "pool '{}' collides with the completion suffix",
                    pool.name
                )));
            }
        }
        Ok(())
    }

    /// Returns the routing key scheme for the configured namespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the namespace or suffix is invalid.
    pub fn routing_key_scheme(&self) -> Result<RoutingKeyScheme, ConfigError> {
        RoutingKeyScheme::new(&self.broker.namespace, &self.broker.completion_suffix)
            .map_err(|err| ConfigError::Invalid(format!("broker: {err}")))
    }

    /// Builds the immutable topology from pool and cascade declarations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Topology`] when the graph is cyclic, a stage is
    /// claimed twice, or a graph stage has no pool.
    pub fn build_topology(&self) -> Result<Topology, ConfigError> {
        let routing = RoutingTable::new(self.pools.iter().map(|pool| {
            (WorkerPoolId::new(pool.name.as_str()), pool.stages.iter().copied())
        }))
        .map_err(TopologyError::from)?;
        let graph = DependencyGraph::new(
            self.cascade.iter().map(|entry| (entry.stage, entry.invalidates.iter().copied())),
        )
        .map_err(TopologyError::from)?;
        Ok(Topology::new(graph, routing)?)
    }
}

// ============================================================================
// SECTION: Broker
// ============================================================================

/// Broker connection and addressing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Broker hostname.
    #[serde(default = "default_host")]
    pub host: String,
    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// AMQP virtual host.
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// AMQP username.
    #[serde(default = "default_credential")]
    pub username: String,
    /// AMQP password.
    #[serde(default = "default_credential")]
    pub password: String,
    /// Topic exchange name.
    #[serde(default = "default_namespace")]
    pub exchange: String,
    /// Durable dispatcher queue name.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Leading routing key segment.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Trailing segment marking completion signals.
    #[serde(default = "default_completion_suffix")]
    pub completion_suffix: String,
    /// Reconnect backoff settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_BROKER_PORT,
            vhost: default_vhost(),
            username: default_credential(),
            password: default_credential(),
            exchange: default_namespace(),
            queue: default_queue(),
            namespace: default_namespace(),
            completion_suffix: default_completion_suffix(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Validates broker settings.
    fn validate(&self) -> Result<(), ConfigError> {
        let host = self.host.trim();
        if host.is_empty() || host.len() > MAX_HOSTNAME_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "broker.host must be 1..={MAX_HOSTNAME_LENGTH} characters"
            )));
        }
        if host.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid("broker.host must not contain whitespace".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be non-zero".to_string()));
        }
        for (field, value) in [("broker.exchange", &self.exchange), ("broker.queue", &self.queue)] {
            if value.trim().is_empty() || value.len() > MAX_AMQP_NAME_LENGTH {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be 1..={MAX_AMQP_NAME_LENGTH} characters"
                )));
            }
        }
        RoutingKeyScheme::new(&self.namespace, &self.completion_suffix)
            .map_err(|err| ConfigError::Invalid(format!("broker: {err}")))?;
        self.amqp_uri()?;
        self.reconnect.validate()
    }

    /// Returns the AMQP connection URI.
    ///
    /// Username, password, and vhost are percent-encoded, so the default
    /// vhost `/` becomes `%2F`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the host does not form a URI.
    pub fn amqp_uri(&self) -> Result<String, ConfigError> {
        let mut uri = Url::parse(&format!("amqp://{}:{}", self.host.trim(), self.port))
            .map_err(|err| ConfigError::Invalid(format!("broker.host: {err}")))?;
        let bare = uri.port() == Some(self.port)
            && uri.username().is_empty()
            && uri.path().is_empty()
            && uri.query().is_none()
            && uri.fragment().is_none();
        if !bare {
            return Err(ConfigError::Invalid("broker.host must be a bare host name".to_string()));
        }
        let unsupported = |()| ConfigError::Invalid("broker.host cannot carry credentials".to_string());
        uri.set_username(&self.username).map_err(unsupported)?;
        uri.set_password(Some(&self.password)).map_err(unsupported)?;
        uri.path_segments_mut().map_err(unsupported)?.clear().push(&self.vhost);
        Ok(uri.into())
    }

    /// Returns the connection target without credentials, for logs.
    #[must_use]
    pub fn display_target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Exponential reconnect backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    /// First retry delay in milliseconds.
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on the retry delay in milliseconds.
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_RECONNECT_INITIAL_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_MS,
        }
    }
}

impl ReconnectConfig {
    /// Validates backoff bounds.
    fn validate(self) -> Result<(), ConfigError> {
        if self.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker.reconnect.initial_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "broker.reconnect.max_delay_ms must be >= initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Topology Declarations
// ============================================================================

/// Worker pool declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Pool identifier used as the last routing key segment.
    pub name: String,
    /// Stages owned by the pool.
    pub stages: Vec<Stage>,
}

/// Cascade declaration: completing `stage` invalidates `invalidates`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CascadeConfig {
    /// Upstream stage.
    pub stage: Stage,
    /// Directly downstream stages, in emission order.
    pub invalidates: Vec<Stage>,
}

// ============================================================================
// SECTION: Logging
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Pools and cascades do not form a valid topology.
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),
}

// ============================================================================
// SECTION: Defaults
// ============================================================================

/// Returns the default broker host.
fn default_host() -> String {
    "localhost".to_string()
}

/// Returns the default broker port.
const fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

/// Returns the default AMQP virtual host.
fn default_vhost() -> String {
    "/".to_string()
}

/// Returns the default AMQP credential.
fn default_credential() -> String {
    "guest".to_string()
}

/// Returns the default namespace and exchange.
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Returns the default dispatcher queue.
fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// Returns the default completion suffix.
fn default_completion_suffix() -> String {
    DEFAULT_COMPLETION_SUFFIX.to_string()
}

/// Returns the default initial reconnect delay.
const fn default_reconnect_initial_ms() -> u64 {
    DEFAULT_RECONNECT_INITIAL_MS
}

/// Returns the default maximum reconnect delay.
const fn default_reconnect_max_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_MS
}

/// Returns the preprocessing worker pools.
#[must_use]
pub fn default_pools() -> Vec<PoolConfig> {
    vec![
        PoolConfig {
            name: "python".to_string(),
            stages: vec![Stage::Regrid, Stage::Routing, Stage::Heatflow, Stage::Ahmcoef, Stage::Pft],
        },
        PoolConfig {
            name: "fortran".to_string(),
            stages: vec![Stage::Mosaix],
        },
        PoolConfig {
            name: "panel".to_string(),
            stages: vec![Stage::InternalOceans, Stage::PassageProblems, Stage::Subbasins],
        },
    ]
}

/// Returns the preprocessing cascade declarations.
#[must_use]
pub fn default_cascade() -> Vec<CascadeConfig> {
    vec![
        CascadeConfig {
            stage: Stage::Regrid,
            invalidates: vec![Stage::InternalOceans, Stage::Routing],
        },
        CascadeConfig {
            stage: Stage::InternalOceans,
            invalidates: vec![Stage::Routing],
        },
        CascadeConfig {
            stage: Stage::Routing,
            invalidates: vec![
                Stage::Pft,
                Stage::PassageProblems,
                Stage::Subbasins,
                Stage::Heatflow,
                Stage::Ahmcoef,
            ],
        },
        CascadeConfig {
            stage: Stage::PassageProblems,
            invalidates: vec![Stage::Subbasins, Stage::Heatflow, Stage::Ahmcoef],
        },
    ]
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from CLI, environment, or the default file.
///
/// Returns `None` when no explicit path is given and the default file is
/// absent.
fn resolve_path<F>(path: Option<&Path>, lookup: &F) -> Result<Option<PathBuf>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = path {
        return Ok(Some(path.to_path_buf()));
    }
    if let Some(env_path) = lookup(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(Some(PathBuf::from(env_path)));
    }
    let default = PathBuf::from(DEFAULT_CONFIG_NAME);
    Ok(default.is_file().then_some(default))
}

/// Validates the resolved path against length limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in Path::new(trimmed).components() {
        let component_value = component.as_os_str().to_string_lossy();
        if component_value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    #[test]
    fn validate_path_string_rejects_empty_string() {
        let err = validate_path_string("store.path", "  ").unwrap_err();
        assert!(err.to_string().contains("non-empty"));
    }

    #[test]
    fn validate_path_rejects_long_component() {
        let long = "a".repeat(MAX_PATH_COMPONENT_LENGTH + 1);
        assert!(validate_path(Path::new(&long)).is_err());
    }

    #[test]
    fn resolve_path_prefers_explicit_path() {
        let lookup = |_: &str| Some("from-env.toml".to_string());
        let resolved = resolve_path(Some(Path::new("explicit.toml")), &lookup).unwrap();
        assert_eq!(resolved, Some(PathBuf::from("explicit.toml")));
        let resolved = resolve_path(None, &lookup).unwrap();
        assert_eq!(resolved, Some(PathBuf::from("from-env.toml")));
    }
}
