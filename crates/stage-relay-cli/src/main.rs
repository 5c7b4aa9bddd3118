// crates/stage-relay-cli/src/main.rs
// ============================================================================
// Module: Stage Relay CLI Entry Point
// Description: Command dispatcher for the Stage Relay dispatcher binary.
// Purpose: Run the dispatcher and inspect topology and revision ledgers.
// Dependencies: clap, stage-relay-broker, stage-relay-config, stage-relay-core,
//               stage-relay-store-sqlite, serde, thiserror, tokio, tracing.
// ============================================================================

//! ## Overview
//! `stage-relay serve` connects the dispatcher to the configured broker and
//! consumes until interrupted. The remaining commands are offline: they load
//! the same configuration and report what the dispatcher would do with it,
//! or read a `SQLite` revision ledger.
//!
//! Command output goes to stdout; logs and errors go to stderr.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod logging;
#[cfg(test)]
mod main_tests;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use serde::Serialize;
use stage_relay_broker::AmqpConnector;
use stage_relay_broker::DispatchService;
use stage_relay_config::StageRelayConfig;
use stage_relay_config::config_toml_example;
use stage_relay_core::DatasetId;
use stage_relay_core::InboundKind;
use stage_relay_core::Revision;
use stage_relay_core::RevisionStore;
use stage_relay_core::RoutingKeyScheme;
use stage_relay_core::Stage;
use stage_relay_core::Topology;
use stage_relay_store_sqlite::SqliteRevisionStore;
use stage_relay_store_sqlite::SqliteStoreConfig;
use thiserror::Error;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Stage Relay command-line interface.
#[derive(Parser, Debug)]
#[command(name = "stage-relay", version, about = "Preprocessing task router and invalidation cascade")]
struct Cli {
    /// Configuration file (overrides `STAGE_RELAY_CONFIG`).
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dispatcher against the configured broker.
    Serve,
    /// Configuration utilities.
    Config {
        /// Selected config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Invalidation graph inspection.
    Graph {
        /// Selected graph subcommand.
        #[command(subcommand)]
        command: GraphCommand,
    },
    /// Show which worker pool a stage is routed to.
    Route(RouteCommand),
    /// Show how the dispatcher treats an inbound routing key.
    Classify(ClassifyCommand),
    /// Revision ledger inspection.
    Store {
        /// Selected store subcommand.
        #[command(subcommand)]
        command: StoreCommand,
    },
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Load and validate the configuration, then print a summary.
    Validate,
    /// Print an annotated example configuration.
    Example,
}

/// Graph subcommands.
#[derive(Subcommand, Debug)]
enum GraphCommand {
    /// Print every cascade declaration.
    Show(FormatArgs),
    /// Print the stages a completion of `stage` invalidates directly.
    Cascade(StageArgs),
    /// Print every stage a completion of `stage` eventually reaches.
    Closure(StageArgs),
}

/// Output format selector shared by inspection commands.
#[derive(Args, Debug)]
struct FormatArgs {
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

/// Arguments naming a single stage.
#[derive(Args, Debug)]
struct StageArgs {
    /// Stage wire name (for example `routing`).
    stage: Stage,
    /// Output format.
    #[command(flatten)]
    output: FormatArgs,
}

/// Arguments for `route`.
#[derive(Args, Debug)]
struct RouteCommand {
    /// Stage to route; prints the full table when omitted.
    stage: Option<Stage>,
    /// Output format.
    #[command(flatten)]
    output: FormatArgs,
}

/// Arguments for `classify`.
#[derive(Args, Debug)]
struct ClassifyCommand {
    /// Inbound routing key (for example `preprocessing.routing.done`).
    key: String,
    /// Output format.
    #[command(flatten)]
    output: FormatArgs,
}

/// Store subcommands.
#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// Print the latest revision of a stage.
    Latest(StoreKeyArgs),
    /// Print every revision of a stage, oldest first.
    History(StoreKeyArgs),
    /// Print the stages holding revisions for a dataset.
    Stages(StoreDatasetArgs),
    /// Delete every revision of a dataset.
    Delete(StoreDatasetArgs),
}

/// Store location override.
#[derive(Args, Debug)]
struct StoreTarget {
    /// `SQLite` database path (overrides `[store] path`).
    #[arg(long, value_name = "PATH")]
    store_path: Option<PathBuf>,
}

/// Arguments addressing one (dataset, stage) key.
#[derive(Args, Debug)]
struct StoreKeyArgs {
    /// Dataset identifier.
    #[arg(long)]
    dataset: DatasetId,
    /// Stage wire name.
    #[arg(long)]
    stage: Stage,
    /// Store location.
    #[command(flatten)]
    target: StoreTarget,
    /// Output format.
    #[command(flatten)]
    output: FormatArgs,
}

/// Arguments addressing one dataset.
#[derive(Args, Debug)]
struct StoreDatasetArgs {
    /// Dataset identifier.
    #[arg(long)]
    dataset: DatasetId,
    /// Store location.
    #[command(flatten)]
    target: StoreTarget,
    /// Output format.
    #[command(flatten)]
    output: FormatArgs,
}

/// Output formats for inspection commands.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

// ============================================================================
// SECTION: Output Types
// ============================================================================

/// Route of one stage.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct RouteSummary {
    /// Routed stage.
    stage: Stage,
    /// Owning worker pool.
    pool: String,
    /// Outbound routing key.
    routing_key: String,
}

/// Invalidation targets of one stage.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct CascadeSummary {
    /// Completed stage.
    stage: Stage,
    /// Stages invalidated.
    invalidates: Vec<Stage>,
}

/// Dispatcher treatment of an inbound routing key.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Classification {
    /// Forwarded to the owning pool.
    TaskRequest {
        /// Requested stage.
        stage: Stage,
        /// Resolved route, absent when the stage is unroutable.
        route: Option<RouteSummary>,
    },
    /// Fanned out as invalidations.
    Completion {
        /// Completed stage.
        stage: Stage,
        /// Routes of the invalidated stages, in cascade order.
        invalidations: Vec<RouteSummary>,
    },
}

/// Ledger view of one revision.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct RevisionSummary {
    /// Dataset identifier.
    dataset_id: u64,
    /// Producing stage.
    stage: Stage,
    /// Per-key sequence number.
    sequence: u64,
    /// Content hash, `algorithm:hex`.
    content_hash: String,
    /// Artifact size in bytes.
    size_bytes: usize,
    /// Append time in unix milliseconds when recorded as wall-clock time.
    appended_at_unix_ms: Option<i64>,
    /// Whether an upstream completion superseded this revision.
    stale: bool,
}

/// Stages present for a dataset.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct DatasetStages {
    /// Dataset identifier.
    dataset_id: u64,
    /// Stages holding at least one revision.
    stages: Vec<Stage>,
}

/// Result of deleting a dataset.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct DeleteSummary {
    /// Dataset identifier.
    dataset_id: u64,
    /// Revisions removed.
    removed: usize,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper carrying a printable message.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
async fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve => command_serve(config).await,
        Commands::Config {
            command,
        } => command_config(&config, &command),
        Commands::Graph {
            command,
        } => command_graph(&config, &command),
        Commands::Route(command) => command_route(&config, &command),
        Commands::Classify(command) => command_classify(&config, &command),
        Commands::Store {
            command,
        } => command_store(&config, &command),
    }
}

/// Loads and validates configuration.
fn load_config(path: Option<&Path>) -> CliResult<StageRelayConfig> {
    StageRelayConfig::load(path)
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))
}

/// Builds the routing key scheme and topology from configuration.
fn load_topology(config: &StageRelayConfig) -> CliResult<(RoutingKeyScheme, Topology)> {
    let scheme = config.routing_key_scheme().map_err(|err| CliError::new(err.to_string()))?;
    let topology = config.build_topology().map_err(|err| CliError::new(err.to_string()))?;
    Ok((scheme, topology))
}

// ============================================================================
// SECTION: Serve
// ============================================================================

/// Runs the dispatcher until interrupted.
async fn command_serve(config: StageRelayConfig) -> CliResult<ExitCode> {
    logging::init_logging(&config.logging).map_err(|err| CliError::new(err.to_string()))?;
    let connector = AmqpConnector::from_config(&config.broker)
        .map_err(|err| CliError::new(format!("failed to start dispatcher: {err}")))?;
    let mut service = DispatchService::from_config(&config, connector)
        .map_err(|err| CliError::new(format!("failed to start dispatcher: {err}")))?;
    info!(
        broker = %config.broker.display_target(),
        exchange = %config.broker.exchange,
        queue = %config.broker.queue,
        "stage relay dispatcher starting"
    );
    let report = service.run(shutdown_signal()).await;
    info!(
        connections = report.connections,
        failed_connects = report.failed_connects,
        processed = report.processed,
        aborted = report.aborted,
        "stage relay dispatcher stopped"
    );
    Ok(ExitCode::SUCCESS)
}

/// Resolves when the process receives an interrupt.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "interrupt handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// SECTION: Config
// ============================================================================

/// Dispatches config subcommands.
fn command_config(config: &StageRelayConfig, command: &ConfigCommand) -> CliResult<ExitCode> {
    match command {
        ConfigCommand::Validate => {
            let (_, topology) = load_topology(config)?;
            let routed = topology.routing().entries().count();
            let cascades = topology.graph().edges().count();
            write_output(&format!(
                "config ok: {} pools, {routed} routed stages, {cascades} cascade declarations, \
                 broker {}, queue {}",
                config.pools.len(),
                config.broker.display_target(),
                config.broker.queue
            ))?;
        }
        ConfigCommand::Example => {
            write_output(config_toml_example().trim_end())?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Graph
// ============================================================================

/// Dispatches graph subcommands.
fn command_graph(config: &StageRelayConfig, command: &GraphCommand) -> CliResult<ExitCode> {
    let (_, topology) = load_topology(config)?;
    let graph = topology.graph();
    match command {
        GraphCommand::Show(output) => {
            let edges: Vec<CascadeSummary> = graph
                .edges()
                .map(|(stage, invalidates)| CascadeSummary {
                    stage,
                    invalidates: invalidates.to_vec(),
                })
                .collect();
            match output.format {
                OutputFormat::Json => {
                    let map: BTreeMap<&str, &[Stage]> = edges
                        .iter()
                        .map(|edge| (edge.stage.as_str(), edge.invalidates.as_slice()))
                        .collect();
                    write_json(&map)?;
                }
                OutputFormat::Text => {
                    for edge in &edges {
                        write_output(&render_cascade(edge))?;
                    }
                }
            }
        }
        GraphCommand::Cascade(args) => {
            let summary = CascadeSummary {
                stage: args.stage,
                invalidates: graph.cascade_from(args.stage).to_vec(),
            };
            emit(&summary, args.output.format, render_cascade)?;
        }
        GraphCommand::Closure(args) => {
            let summary = CascadeSummary {
                stage: args.stage,
                invalidates: graph.downstream_closure(args.stage),
            };
            emit(&summary, args.output.format, render_cascade)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Renders a cascade line.
fn render_cascade(summary: &CascadeSummary) -> String {
    format!("{} -> {}", summary.stage, render_stage_list(&summary.invalidates))
}

/// Renders a comma-separated stage list.
fn render_stage_list(stages: &[Stage]) -> String {
    if stages.is_empty() {
        return "(none)".to_string();
    }
    stages.iter().map(|stage| stage.as_str()).collect::<Vec<_>>().join(", ")
}

// ============================================================================
// SECTION: Routing
// ============================================================================

/// Dispatches the route command.
fn command_route(config: &StageRelayConfig, command: &RouteCommand) -> CliResult<ExitCode> {
    let (scheme, topology) = load_topology(config)?;
    let Some(stage) = command.stage else {
        let table: Vec<RouteSummary> = topology
            .routing()
            .entries()
            .map(|(stage, pool)| RouteSummary {
                stage,
                pool: pool.to_string(),
                routing_key: scheme.worker_key(stage, pool),
            })
            .collect();
        match command.output.format {
            OutputFormat::Json => write_json(&table)?,
            OutputFormat::Text => {
                for route in &table {
                    write_output(&render_route(route))?;
                }
            }
        }
        return Ok(ExitCode::SUCCESS);
    };
    let route = route_summary(&scheme, &topology, stage)
        .ok_or_else(|| CliError::new(format!("stage {stage} is not routed to any pool")))?;
    emit(&route, command.output.format, render_route)?;
    Ok(ExitCode::SUCCESS)
}

/// Resolves the route of a stage.
fn route_summary(scheme: &RoutingKeyScheme, topology: &Topology, stage: Stage) -> Option<RouteSummary> {
    topology.routing().route(stage).ok().map(|pool| RouteSummary {
        stage,
        pool: pool.to_string(),
        routing_key: scheme.worker_key(stage, pool),
    })
}

/// Renders a route line.
fn render_route(route: &RouteSummary) -> String {
    format!("{} -> {} ({})", route.stage, route.pool, route.routing_key)
}

/// Dispatches the classify command.
fn command_classify(config: &StageRelayConfig, command: &ClassifyCommand) -> CliResult<ExitCode> {
    let (scheme, topology) = load_topology(config)?;
    let kind = scheme
        .classify(&command.key)
        .map_err(|err| CliError::new(format!("routing key '{}' rejected: {err}", command.key)))?;
    let classification = classify(&scheme, &topology, kind);
    emit(&classification, command.output.format, render_classification)?;
    Ok(ExitCode::SUCCESS)
}

/// Resolves what the dispatcher publishes for an inbound kind.
fn classify(scheme: &RoutingKeyScheme, topology: &Topology, kind: InboundKind) -> Classification {
    match kind {
        InboundKind::TaskRequest(stage) => Classification::TaskRequest {
            stage,
            route: route_summary(scheme, topology, stage),
        },
        InboundKind::CompletionSignal(stage) => Classification::Completion {
            stage,
            invalidations: topology
                .graph()
                .cascade_from(stage)
                .iter()
                .filter_map(|target| route_summary(scheme, topology, *target))
                .collect(),
        },
    }
}

/// Renders a classification as text.
fn render_classification(classification: &Classification) -> String {
    match classification {
        Classification::TaskRequest {
            stage,
            route: Some(route),
        } => format!("task request for {stage}: forward to {} ({})", route.pool, route.routing_key),
        Classification::TaskRequest {
            stage,
            route: None,
        } => format!("task request for {stage}: unroutable, acknowledged with a diagnostic"),
        Classification::Completion {
            stage,
            invalidations,
        } if invalidations.is_empty() => {
            format!("completion of {stage}: no downstream stages")
        }
        Classification::Completion {
            stage,
            invalidations,
        } => {
            let mut lines = vec![format!("completion of {stage}: invalidate")];
            lines.extend(invalidations.iter().map(|route| format!("  {}", render_route(route))));
            lines.join("\n")
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Dispatches store subcommands.
fn command_store(config: &StageRelayConfig, command: &StoreCommand) -> CliResult<ExitCode> {
    match command {
        StoreCommand::Latest(args) => {
            let store = open_store(&args.target, config)?;
            let revision = store
                .latest(args.dataset, args.stage)
                .map_err(|err| CliError::new(err.to_string()))?;
            emit(&revision_summary(&revision), args.output.format, render_revision)?;
        }
        StoreCommand::History(args) => {
            let store = open_store(&args.target, config)?;
            let history = store
                .history(args.dataset, args.stage)
                .map_err(|err| CliError::new(err.to_string()))?;
            let summaries: Vec<RevisionSummary> = history.iter().map(revision_summary).collect();
            match args.output.format {
                OutputFormat::Json => write_json(&summaries)?,
                OutputFormat::Text if summaries.is_empty() => {
                    write_output(&format!(
                        "no revisions for dataset {} stage {}",
                        args.dataset, args.stage
                    ))?;
                }
                OutputFormat::Text => {
                    for summary in &summaries {
                        write_output(&render_revision(summary))?;
                    }
                }
            }
        }
        StoreCommand::Stages(args) => {
            let store = open_store(&args.target, config)?;
            let stages = store
                .stages_present(args.dataset)
                .map_err(|err| CliError::new(err.to_string()))?;
            let summary = DatasetStages {
                dataset_id: args.dataset.get(),
                stages: stages.into_iter().collect(),
            };
            emit(&summary, args.output.format, |summary| {
                format!("dataset {}: {}", summary.dataset_id, render_stage_list(&summary.stages))
            })?;
        }
        StoreCommand::Delete(args) => {
            let store = open_store(&args.target, config)?;
            let removed = store
                .delete_dataset(args.dataset)
                .map_err(|err| CliError::new(err.to_string()))?;
            let summary = DeleteSummary {
                dataset_id: args.dataset.get(),
                removed,
            };
            emit(&summary, args.output.format, |summary| {
                format!("dataset {}: removed {} revisions", summary.dataset_id, summary.removed)
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Resolves the store location from the override or configuration.
fn store_config_for(target: &StoreTarget, config: &StageRelayConfig) -> CliResult<SqliteStoreConfig> {
    target
        .store_path
        .as_ref()
        .map(|path| SqliteStoreConfig::at(path.clone()))
        .or_else(|| config.store.clone())
        .ok_or_else(|| {
            CliError::new("no store configured: pass --store-path or set [store] path".to_string())
        })
}

/// Opens the `SQLite` revision store.
fn open_store(target: &StoreTarget, config: &StageRelayConfig) -> CliResult<SqliteRevisionStore> {
    let store_config = store_config_for(target, config)?;
    SqliteRevisionStore::new(&store_config).map_err(|err| {
        CliError::new(format!(
            "failed to open store {}: {err}",
            store_config.path.display()
        ))
    })
}

/// Projects a revision into its ledger view.
fn revision_summary(revision: &Revision) -> RevisionSummary {
    RevisionSummary {
        dataset_id: revision.dataset_id.get(),
        stage: revision.stage,
        sequence: revision.sequence,
        content_hash: revision.content_hash.to_string(),
        size_bytes: revision.artifact.len(),
        appended_at_unix_ms: revision.appended_at.as_unix_millis(),
        stale: revision.stale,
    }
}

/// Renders a revision line.
fn render_revision(summary: &RevisionSummary) -> String {
    let state = if summary.stale { "stale" } else { "fresh" };
    format!(
        "dataset {} {} #{} {} {} bytes {state}",
        summary.dataset_id, summary.stage, summary.sequence, summary.content_hash, summary.size_bytes
    )
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Emits a value as JSON or as rendered text.
fn emit<T: Serialize>(value: &T, format: OutputFormat, render: impl Fn(&T) -> String) -> CliResult<()> {
    match format {
        OutputFormat::Json => write_json(value),
        OutputFormat::Text => write_output(&render(value)),
    }
}

/// Writes a value as pretty JSON to stdout.
fn write_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::new(format!("failed to encode output: {err}")))?;
    write_output(&rendered)
}

/// Writes a line to stdout, mapping I/O failures.
fn write_output(message: &str) -> CliResult<()> {
    write_stdout_line(message).map_err(|err| CliError::new(output_error("stdout", &err)))
}

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Formats an output error message.
fn output_error(stream: &str, error: &std::io::Error) -> String {
    format!("failed to write {stream}: {error}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
