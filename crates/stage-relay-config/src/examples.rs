// crates/stage-relay-config/src/examples.rs
// ============================================================================
// Module: Config Examples
// Description: Canonical example configuration payload.
// Purpose: Deterministic example for docs and the `config example` command.
// Dependencies: std
// ============================================================================

//! ## Overview
//! The example mirrors the built-in defaults exactly, with the optional
//! revision store commented out. Parsing it yields
//! [`StageRelayConfig::default`](crate::StageRelayConfig).

/// Returns a canonical example `stage-relay.toml` configuration.
#[must_use]
pub fn config_toml_example() -> String {
    String::from(
        r#"[broker]
# Overridden by the BROKER_HOSTNAME environment variable when set.
host = "localhost"
port = 5672
vhost = "/"
username = "guest"
password = "guest"
exchange = "preprocessing"
queue = "preprocessing_task_queue"
namespace = "preprocessing"
completion_suffix = "done"

[broker.reconnect]
initial_delay_ms = 500
max_delay_ms = 30000

[logging]
format = "pretty"
# filter = "info,stage_relay_core=debug"

# Optional staleness ledger shared with the worker pools.
# [store]
# path = "stage-relay.db"
# journal_mode = "wal"
# sync_mode = "full"
# busy_timeout_ms = 5000

[[pools]]
name = "python"
stages = ["regrid", "routing", "heatflow", "ahmcoef", "pft"]

[[pools]]
name = "fortran"
stages = ["mosaix"]

[[pools]]
name = "panel"
stages = ["internal_oceans", "passage_problems", "subbasins"]

[[cascade]]
stage = "regrid"
invalidates = ["internal_oceans", "routing"]

[[cascade]]
stage = "internal_oceans"
invalidates = ["routing"]

[[cascade]]
stage = "routing"
invalidates = ["pft", "passage_problems", "subbasins", "heatflow", "ahmcoef"]

[[cascade]]
stage = "passage_problems"
invalidates = ["subbasins", "heatflow", "ahmcoef"]
"#,
    )
}
