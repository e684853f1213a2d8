//! CLI entry point for the transit SRI engine.
//!
//! Provides subcommands for ingesting GTFS-RT vehicle position files into the
//! position buffer, running an analysis pass, and reporting stored results.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_sri::analyzers::analyzer::Pipeline;
use transit_sri::analyzers::buckets::Granularity;
use transit_sri::catalog::{PlannedTrips, RouteNames, StopCatalog};
use transit_sri::config::{PipelineConfig, SriConfigSet};
use transit_sri::output::print_json;
use transit_sri::parser::{parse_feed, positions_from_feed};
use transit_sri::query::{SriFilter, bunching_hotspots, network_sri, patterns_for_route, route_sri};
use transit_sri::stats::IngestStats;
use transit_sri::store::{FilePositionStore, JsonStateStore, PositionStore, StateStore};

#[derive(Parser)]
#[command(name = "transit_sri")]
#[command(about = "Service reliability scoring from vehicle positions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a GTFS-RT vehicle positions file and buffer its positions
    Ingest {
        /// Protobuf feed file, optionally gzip-compressed
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Position buffer CSV to append to
        #[arg(short, long, default_value = "positions.csv")]
        positions: PathBuf,

        /// Optional route_id,route_name alias CSV
        #[arg(short, long)]
        routes: Option<PathBuf>,
    },
    /// Run one analysis pass over unprocessed positions
    RunPass {
        #[arg(short, long, default_value = "positions.csv")]
        positions: PathBuf,

        /// Analytics state snapshot
        #[arg(short, long, default_value = "state.json")]
        state: PathBuf,

        /// Stop catalogue CSV
        #[arg(long)]
        stops: PathBuf,

        /// Pipeline config JSON; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// SRI config set JSON; the built-in weights apply when omitted
        #[arg(long)]
        sri_config: Option<PathBuf>,

        /// Planned trips per service and hour CSV
        #[arg(long)]
        planned: Option<PathBuf>,
    },
    /// Print stored SRI rows and patterns as JSON
    Report {
        #[arg(short, long, default_value = "state.json")]
        state: PathBuf,

        #[arg(short, long)]
        route: Option<String>,

        #[arg(short, long)]
        operator: Option<String>,

        /// hourly, daily, monthly or overall
        #[arg(short, long)]
        granularity: Option<Granularity>,

        /// Report network rows instead of route rows
        #[arg(long, default_value_t = false)]
        network: bool,

        /// Include pattern rows for the selected route
        #[arg(long, default_value_t = false)]
        patterns: bool,

        /// Show the worst bunching cells
        #[arg(long)]
        hotspots: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/transit_sri.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_sri.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            source,
            positions,
            routes,
        } => ingest(&source, &positions, routes.as_deref()).await?,
        Commands::RunPass {
            positions,
            state,
            stops,
            config,
            sri_config,
            planned,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::load(path)?,
                None => PipelineConfig::default(),
            };
            let sri_configs = match sri_config {
                Some(path) => SriConfigSet::load(path)?,
                None => SriConfigSet::default(),
            };
            let catalog = StopCatalog::load(&stops)?;
            let mut pipeline = Pipeline::new(&catalog, config, sri_configs);
            if let Some(path) = planned {
                pipeline = pipeline.with_planned_trips(PlannedTrips::load(path)?);
            }

            let report = pipeline
                .run_pass(
                    &FilePositionStore::new(positions),
                    &JsonStateStore::new(state),
                    Utc::now(),
                )
                .await?;
            print_json(&report)?;
        }
        Commands::Report {
            state,
            route,
            operator,
            granularity,
            network,
            patterns,
            hotspots,
        } => {
            let state = JsonStateStore::new(state).load().await?;

            if network {
                match network_sri(&state, granularity) {
                    Some(rows) => print_json(&rows)?,
                    None => warn!("No network SRI data"),
                }
                return Ok(());
            }

            let filter = SriFilter {
                route: route.clone(),
                operator,
                granularity,
                ..Default::default()
            };
            match route_sri(&state, &filter) {
                Some(rows) => print_json(&rows)?,
                None => warn!(route = ?filter.route, "No SRI data"),
            }

            if patterns {
                match patterns_for_route(&state, &filter) {
                    Some(found) => print_json(&found)?,
                    None => warn!(route = ?filter.route, "No pattern data"),
                }
            }

            if let Some(limit) = hotspots {
                match bunching_hotspots(&state, route.as_deref(), 1, limit) {
                    Some(rows) => print_json(&rows)?,
                    None => info!("No bunching recorded"),
                }
            }
        }
    }

    Ok(())
}

/// Reads one feed file, converts its vehicles to positions and appends them
/// to the buffer.
#[tracing::instrument(skip_all, fields(source = %source.display()))]
async fn ingest(source: &Path, positions: &Path, routes: Option<&Path>) -> Result<()> {
    let bytes = tokio::fs::read(source).await?;
    let feed = parse_feed(&bytes)?;

    let routes = match routes {
        Some(path) => RouteNames::load(path)?,
        None => RouteNames::default(),
    };

    let rows = positions_from_feed(&feed, &routes);
    let written = FilePositionStore::new(positions).append(&rows).await?;

    let mut stats = IngestStats::from_feed(&feed).with_source(&source.display().to_string());
    stats.positions_written = written;
    if stats.vehicles > 0 && stats.position_pct() < 50.0 {
        warn!(position_pct = stats.position_pct(), "Most vehicles lack a position");
    }
    info!(
        entities = stats.total_entities,
        vehicles = stats.vehicles,
        written,
        route_pct = stats.route_pct(),
        direction_pct = stats.direction_pct(),
        "Feed ingested"
    );
    print_json(&stats)?;
    Ok(())
}
