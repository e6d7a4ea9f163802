//! table-diff CLI - compare two tables across databases.

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use table_diff::{connect_to_uri, Config, Database, DatabaseConfig, DiffError, TableDiffer, TableRef};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "table-diff")]
#[command(about = "Find differing rows between two tables by recursive range bisection")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "diff.yaml")]
    config: PathBuf,

    /// Output JSON lines to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for in-flight ranges after SIGINT/SIGTERM
    #[arg(long, default_value = "30")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff source against target
    Diff {
        /// Override key column
        #[arg(long)]
        key_column: Option<String>,

        /// Override update column
        #[arg(long)]
        update_column: Option<String>,

        /// Override extra compared columns (comma-separated)
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,

        /// Override sub-ranges per split
        #[arg(long)]
        bisection_factor: Option<usize>,

        /// Override row count below which ranges are compared row by row
        #[arg(long)]
        bisection_threshold: Option<u64>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Compare ranges one at a time; output is in key order
        #[arg(long)]
        no_concurrency: bool,

        /// Stop after this many differences
        #[arg(long)]
        limit: Option<usize>,

        /// Print run statistics at the end
        #[arg(long)]
        stats: bool,
    },

    /// Row count and checksum of both tables
    Count,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), DiffError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Diff {
            key_column,
            update_column,
            columns,
            bisection_factor,
            bisection_threshold,
            workers,
            no_concurrency,
            limit,
            stats,
        } => {
            // Apply overrides
            if let Some(key) = key_column {
                config.diff.key_column = key;
            }
            if let Some(update) = update_column {
                config.diff.update_column = Some(update);
            }
            if let Some(columns) = columns {
                config.diff.extra_columns = columns;
            }
            if let Some(factor) = bisection_factor {
                config.diff.bisection_factor = factor;
            }
            if let Some(threshold) = bisection_threshold {
                config.diff.bisection_threshold = threshold;
            }
            if let Some(w) = workers {
                config.diff.max_workers = Some(w);
            }
            if no_concurrency {
                config.diff.concurrent = false;
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            let cancel_token = setup_signal_handler(cli.shutdown_timeout);
            let options = DiffOptions {
                json: cli.output_json,
                limit,
                stats,
                shutdown_timeout: Duration::from_secs(cli.shutdown_timeout),
            };
            run_diff(&config, &options, cancel_token).await?;
        }

        Commands::Count => {
            config.validate()?;
            let config = config.with_auto_tuning();
            let (source, target) = connect_both(&config).await?;

            let sides = [
                ("source", &config.source, &source),
                ("target", &config.target, &target),
            ];
            for (name, side, db) in sides {
                let segment = config.diff.segment(Arc::clone(db), &side.table)?;
                segment.describe().await?;
                let (count, checksum) = segment.count_and_checksum().await?;
                if cli.output_json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "side": name,
                            "db_type": db.db_type(),
                            "table": side.table,
                            "rows": count,
                            "checksum": checksum.to_string(),
                        })
                    );
                } else {
                    println!(
                        "{} ({}) {}: {} rows, checksum {}",
                        name,
                        db.db_type(),
                        side.table,
                        count,
                        checksum
                    );
                }
            }
            source.close().await;
            target.close().await;
        }

        Commands::HealthCheck => {
            let (source_ok, source_latency, source_error) = check_connection(&config.source).await;
            let (target_ok, target_latency, target_error) = check_connection(&config.target).await;
            let healthy = source_ok && target_ok;

            if cli.output_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "healthy": healthy,
                        "source_connected": source_ok,
                        "source_latency_ms": source_latency,
                        "source_error": source_error,
                        "target_connected": target_ok,
                        "target_latency_ms": target_latency,
                        "target_error": target_error,
                    }))?
                );
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source: {} ({}ms)",
                    if source_ok { "OK" } else { "FAILED" },
                    source_latency
                );
                if let Some(ref err) = source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target: {} ({}ms)",
                    if target_ok { "OK" } else { "FAILED" },
                    target_latency
                );
                if let Some(ref err) = target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !healthy {
                return Err(DiffError::connectivity("health-check", "Health check failed"));
            }
        }
    }

    Ok(())
}

/// Output settings for the diff subcommand.
struct DiffOptions {
    json: bool,
    limit: Option<usize>,
    stats: bool,
    shutdown_timeout: Duration,
}

async fn run_diff(config: &Config, options: &DiffOptions, cancel_token: CancellationToken) -> Result<(), DiffError> {
    let (source, target) = connect_both(config).await?;
    let a = config.diff.segment(Arc::clone(&source), &config.source.table)?;
    let b = config.diff.segment(Arc::clone(&target), &config.target.table)?;

    let differ = TableDiffer::new(config.diff.options())?;
    let mut stream = differ.diff_tables(a, b);

    // Signals cancel the diff; in-flight ranges get shutdown_timeout to drain
    let diff_token = stream.cancellation_token();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        signal_token.cancelled().await;
        diff_token.cancel();
    });
    let shutdown_timeout = options.shutdown_timeout;
    let deadline = async {
        cancel_token.cancelled().await;
        tokio::time::sleep(shutdown_timeout).await;
    };
    tokio::pin!(deadline);

    let mut emitted = 0usize;
    let mut result = Ok(());
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = &mut deadline => {
                warn!("Shutdown timeout reached, abandoning in-flight ranges");
                break;
            }
        };
        match item {
            Some(Ok(record)) => {
                if options.json {
                    println!("{}", serde_json::to_string(&record)?);
                } else {
                    println!("{}", record);
                }
                emitted += 1;
                if options.limit.map_or(false, |limit| emitted >= limit) {
                    info!("Reached limit of {} differences", emitted);
                    stream.cancel();
                    break;
                }
            }
            Some(Err(e)) => {
                result = Err(e);
                break;
            }
            None => break,
        }
    }

    let stats = stream.stats();
    drop(stream);
    source.close().await;
    target.close().await;

    if options.stats {
        if options.json {
            println!("{}", serde_json::json!({ "stats": stats }));
        } else {
            eprintln!("{}", stats);
        }
    }
    if result.is_ok() && cancel_token.is_cancelled() {
        return Err(DiffError::Cancelled);
    }
    result
}

async fn connect_both(config: &Config) -> Result<(Arc<dyn Database>, Arc<dyn Database>), DiffError> {
    let (source, target) = (TableRef::from(&config.source), TableRef::from(&config.target));
    tokio::try_join!(source.connect(), target.connect())
}

/// Connect with a single connection and report (connected, latency ms, error).
async fn check_connection(side: &DatabaseConfig) -> (bool, u64, Option<String>) {
    let started = Instant::now();
    match connect_to_uri(&side.uri, 1).await {
        Ok(db) => {
            let latency = started.elapsed().as_millis() as u64;
            db.close().await;
            (true, latency, None)
        }
        Err(e) => (false, started.elapsed().as_millis() as u64, Some(e.to_string())),
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr; stdout carries the differences
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!(
                        "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                        name, shutdown_timeout
                    );
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\nReceived Ctrl-C. Shutting down gracefully (timeout: {}s)...",
                shutdown_timeout
            );
            token.cancel();
        }
    });

    cancel_token
}
