//! area-etl CLI - legacy registry to PostgreSQL migration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use area_etl::{Config, EtlError, Orchestrator, RunStatus, TargetDb};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "area-etl")]
#[command(about = "Migrate the legacy healthcare registry into PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output the JSON run report to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration
    Run {
        /// Restrict the run to these database modules (comma separated:
        /// core,poa,cronos,auac,ppf,hr)
        #[arg(long, value_delimiter = ',')]
        modules: Vec<TargetDb>,

        /// Restrict the run to these catalog tables
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Override number of parallel table workers
        #[arg(long)]
        workers: Option<usize>,

        /// Dry run: execute the full pipeline against in-memory sinks
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the dependency-ordered load plan without migrating
    Plan {
        /// Restrict the plan to these database modules
        #[arg(long, value_delimiter = ',')]
        modules: Vec<TargetDb>,

        /// Restrict the plan to these catalog tables
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },

    /// Test source, target, and registry store connectivity
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, EtlError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(EtlError::Config)?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            modules,
            tables,
            workers,
            dry_run,
        } => {
            if !modules.is_empty() {
                config.run.modules = modules;
            }
            if !tables.is_empty() {
                config.run.tables = tables;
            }
            if let Some(w) = workers {
                config.run.workers = Some(w);
            }

            let cancel_token = setup_signal_handler().await?;
            let orchestrator = Orchestrator::new(config, dry_run).await?;
            let report = orchestrator.run(cancel_token).await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                let headline = match (dry_run, report.status) {
                    (true, _) => "Dry run completed",
                    (_, RunStatus::Cancelled) => "Migration cancelled",
                    (_, RunStatus::Failed) => "Migration failed",
                    _ => "Migration completed",
                };
                println!("\n{}", headline);
                println!("  Run ID: {}", report.run_id);
                println!("  Duration: {:.2}s", report.duration_seconds);
                println!("  Tables: {}", report.tables.len());
                println!("  Rows loaded: {}", report.rows_loaded);
                println!("  Rows quarantined: {}", report.rows_quarantined);
                if !report.failed_tables.is_empty() {
                    println!("  Failed tables: {:?}", report.failed_tables);
                }
                if !report.warnings.is_empty() {
                    println!("  Warnings: {}", report.warnings.len());
                    for warning in &report.warnings {
                        println!("    - {}", warning);
                    }
                }
            }

            Ok(match report.status {
                RunStatus::Completed | RunStatus::CompletedWithQuarantine => ExitCode::SUCCESS,
                RunStatus::Cancelled => ExitCode::from(130),
                RunStatus::Failed => ExitCode::FAILURE,
            })
        }

        Commands::Plan { modules, tables } => {
            if !modules.is_empty() {
                config.run.modules = modules;
            }
            if !tables.is_empty() {
                config.run.tables = tables;
            }

            // Dry-run wiring: the plan never touches a database.
            let orchestrator = Orchestrator::new(config, true).await?;
            let order = orchestrator.plan()?;
            let scope = orchestrator.scope();

            println!("Load plan: {} tables in {} waves", order.len(), order.waves.len());
            for (i, wave) in order.waves.iter().enumerate() {
                println!("\nWave {}:", i + 1);
                for name in wave {
                    let db = scope
                        .db_of(name)
                        .map(|db| db.to_string())
                        .unwrap_or_default();
                    println!("  {} ({})", name, db);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config, false).await?;
            orchestrator.health_check().await?;
            println!("All connections healthy");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// SIGINT (Ctrl-C) and SIGTERM both request a graceful stop: in-flight
/// tables finish, nothing new starts.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, EtlError> {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();

    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Finishing in-flight tables...");
        token_int.cancel();
    });

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Finishing in-flight tables...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, EtlError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to setup Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Finishing in-flight tables...");
        token.cancel();
    });

    Ok(cancel_token)
}
