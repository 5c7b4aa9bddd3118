// crates/stage-relay-cli/src/main_tests.rs
// ============================================================================
// Module: CLI Main Helpers Tests
// Description: Unit tests for argument parsing and output projection.
// Purpose: Pin the CLI surface and the dispatcher view it reports.
// Dependencies: stage-relay-cli main helpers
// ============================================================================

//! ## Overview
//! Exercises clap parsing, store resolution, classification, and the text
//! renderers without touching stdout.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;

use clap::Parser;
use stage_relay_config::StageRelayConfig;
use stage_relay_core::Artifact;
use stage_relay_core::DatasetId;
use stage_relay_core::InboundKind;
use stage_relay_core::RevisionStore;
use stage_relay_core::Stage;
use stage_relay_store_sqlite::SqliteRevisionStore;
use stage_relay_store_sqlite::SqliteStoreConfig;

use super::Classification;
use super::Cli;
use super::Commands;
use super::GraphCommand;
use super::OutputFormat;
use super::StoreCommand;
use super::StoreTarget;
use super::classify;
use super::load_topology;
use super::logging::resolve_filter;
use super::render_classification;
use super::render_revision;
use super::render_stage_list;
use super::revision_summary;
use super::route_summary;
use super::store_config_for;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Parses a command line, panicking on clap errors.
fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("stage-relay").chain(args.iter().copied())).unwrap()
}

/// Dataset 42.
fn dataset() -> DatasetId {
    DatasetId::from_raw(42).unwrap()
}

// ============================================================================
// SECTION: Parsing
// ============================================================================

#[test]
fn store_latest_parses_dataset_stage_and_overrides() {
    let cli = parse(&[
        "--config",
        "relay.toml",
        "store",
        "latest",
        "--dataset",
        "42",
        "--stage",
        "bathy",
        "--store-path",
        "ledger.db",
        "--format",
        "json",
    ]);
    assert_eq!(cli.config, Some(PathBuf::from("relay.toml")));
    let Commands::Store {
        command: StoreCommand::Latest(args),
    } = cli.command
    else {
        panic!("expected store latest");
    };
    assert_eq!(args.dataset, dataset());
    assert_eq!(args.stage, Stage::Bathy);
    assert_eq!(args.target.store_path, Some(PathBuf::from("ledger.db")));
    assert_eq!(args.output.format, OutputFormat::Json);
}

#[test]
fn zero_dataset_and_unknown_stage_are_rejected() {
    let zero = ["stage-relay", "store", "stages", "--dataset", "0"];
    assert!(Cli::try_parse_from(zero).is_err());
    let unknown = ["stage-relay", "graph", "cascade", "bathymetry"];
    assert!(Cli::try_parse_from(unknown).is_err());
}

#[test]
fn format_defaults_to_text() {
    let cli = parse(&["graph", "closure", "regrid"]);
    let Commands::Graph {
        command: GraphCommand::Closure(args),
    } = cli.command
    else {
        panic!("expected graph closure");
    };
    assert_eq!(args.stage, Stage::Regrid);
    assert_eq!(args.output.format, OutputFormat::Text);
}

// ============================================================================
// SECTION: Classification
// ============================================================================

#[test]
fn task_request_resolves_owning_pool() {
    let config = StageRelayConfig::default();
    let (scheme, topology) = load_topology(&config).unwrap();
    let route = route_summary(&scheme, &topology, Stage::Heatflow).unwrap();
    assert_eq!(route.pool, "python");
    assert_eq!(route.routing_key, "preprocessing.heatflow.python");
    assert!(route_summary(&scheme, &topology, Stage::Bathy).is_none());
}

#[test]
fn completion_lists_one_route_per_downstream_stage() {
    let config = StageRelayConfig::default();
    let (scheme, topology) = load_topology(&config).unwrap();
    let kind = scheme.classify("preprocessing.routing.done").unwrap();
    assert_eq!(kind, InboundKind::CompletionSignal(Stage::Routing));
    let Classification::Completion {
        stage,
        invalidations,
    } = classify(&scheme, &topology, kind)
    else {
        panic!("expected completion");
    };
    assert_eq!(stage, Stage::Routing);
    let keys: Vec<&str> = invalidations.iter().map(|route| route.routing_key.as_str()).collect();
    assert_eq!(keys, vec![
        "preprocessing.pft.python",
        "preprocessing.passage_problems.panel",
        "preprocessing.subbasins.panel",
        "preprocessing.heatflow.python",
        "preprocessing.ahmcoef.python",
    ]);
}

#[test]
fn unroutable_request_renders_diagnostic_line() {
    let config = StageRelayConfig::default();
    let (scheme, topology) = load_topology(&config).unwrap();
    let classification = classify(&scheme, &topology, InboundKind::TaskRequest(Stage::Soils));
    assert_eq!(classification, Classification::TaskRequest {
        stage: Stage::Soils,
        route: None,
    });
    assert_eq!(
        render_classification(&classification),
        "task request for soils: unroutable, acknowledged with a diagnostic"
    );
}

#[test]
fn leaf_completion_has_no_downstream_stages() {
    let config = StageRelayConfig::default();
    let (scheme, topology) = load_topology(&config).unwrap();
    let classification =
        classify(&scheme, &topology, InboundKind::CompletionSignal(Stage::Mosaix));
    assert_eq!(render_classification(&classification), "completion of mosaix: no downstream stages");
}

#[test]
fn classification_json_is_tagged_by_kind() {
    let config = StageRelayConfig::default();
    let (scheme, topology) = load_topology(&config).unwrap();
    let classification = classify(&scheme, &topology, InboundKind::TaskRequest(Stage::Mosaix));
    let value = serde_json::to_value(&classification).unwrap();
    assert_eq!(value["kind"], "task_request");
    assert_eq!(value["route"]["pool"], "fortran");
}

// ============================================================================
// SECTION: Store
// ============================================================================

#[test]
fn store_path_override_wins_over_config() {
    let mut config = StageRelayConfig::default();
    let target = StoreTarget {
        store_path: None,
    };
    assert!(store_config_for(&target, &config).is_err());

    config.store = Some(SqliteStoreConfig::at("configured.db"));
    assert_eq!(store_config_for(&target, &config).unwrap().path, PathBuf::from("configured.db"));

    let target = StoreTarget {
        store_path: Some(PathBuf::from("override.db")),
    };
    assert_eq!(store_config_for(&target, &config).unwrap().path, PathBuf::from("override.db"));
}

#[test]
fn revision_summary_reports_hash_size_and_staleness() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteRevisionStore::new(&SqliteStoreConfig::at(dir.path().join("ledger.db")))
        .unwrap();
    store.append(dataset(), Stage::Bathy, Artifact::from_bytes(b"depths".to_vec())).unwrap();
    store.mark_stale(dataset(), Stage::Bathy).unwrap();
    let summary = revision_summary(&store.latest(dataset(), Stage::Bathy).unwrap());
    assert_eq!(summary.dataset_id, 42);
    assert_eq!(summary.sequence, 1);
    assert_eq!(summary.size_bytes, 6);
    assert!(summary.stale);
    assert!(summary.content_hash.starts_with("sha256:"));
    let line = render_revision(&summary);
    assert!(line.starts_with("dataset 42 bathy #1 sha256:"));
    assert!(line.ends_with("6 bytes stale"));
}

#[test]
fn stage_list_rendering() {
    assert_eq!(render_stage_list(&[]), "(none)");
    assert_eq!(render_stage_list(&[Stage::Pft, Stage::TopoHighRes]), "pft, topo_high_res");
}

// ============================================================================
// SECTION: Logging
// ============================================================================

#[test]
fn log_filter_prefers_environment_then_config() {
    assert_eq!(resolve_filter(None, None).unwrap().to_string(), "info");
    assert_eq!(resolve_filter(None, Some("warn")).unwrap().to_string(), "warn");
    assert_eq!(resolve_filter(Some("debug"), Some("warn")).unwrap().to_string(), "debug");
    assert_eq!(resolve_filter(Some("  "), Some("warn")).unwrap().to_string(), "warn");
    assert!(resolve_filter(None, Some("stage_relay=notalevel")).is_err());
}
