//! mssql-upgrade CLI - transactional SQL Server upgrade scripts.

use clap::{Parser, Subcommand};
use mssql_upgrade::{Config, Migrator, ScriptConfig, ScriptPlan, UpgradeError};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-upgrade")]
#[command(about = "Apply SQL Server upgrade scripts in a single transaction")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
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
    /// Apply scripts in the given order, each in its own transaction
    Apply {
        /// Script files to apply
        #[arg(required = true)]
        scripts: Vec<PathBuf>,

        /// Dry run: split the scripts and show the batches without connecting
        #[arg(long)]
        dry_run: bool,
    },

    /// Show how a script is split into batches (no database needed)
    Split {
        /// Script file to split
        script: PathBuf,
    },

    /// Test the database connection
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

async fn run() -> Result<(), UpgradeError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(UpgradeError::Config)?;

    // Splitting only needs the script settings, so a missing file is fine.
    if let Commands::Split { ref script } = cli.command {
        let script_config = if cli.config.exists() {
            Config::load(&cli.config)?.script
        } else {
            ScriptConfig::default()
        };
        let content = mssql_upgrade::migrator::read_script(script)?;
        let plan = ScriptPlan::build(
            &script_config.splitter(),
            &script.display().to_string(),
            &content,
        )?;
        print_plan(&plan, cli.output_json)?;
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler().await?;
    let migrator = Migrator::new(config).with_cancel(cancel_token);

    match cli.command {
        Commands::Split { .. } => unreachable!(), // Handled above
        Commands::Apply { scripts, dry_run } => {
            if dry_run {
                for path in &scripts {
                    let content = mssql_upgrade::migrator::read_script(path)?;
                    let plan = migrator.plan(&path.display().to_string(), &content)?;
                    print_plan(&plan, cli.output_json)?;
                }
                return Ok(());
            }

            for (i, path) in scripts.iter().enumerate() {
                let result = migrator.apply_file(path).await.map_err(|e| {
                    let remaining = scripts.len() - i - 1;
                    if remaining > 0 {
                        warn!("Stopping: {} script(s) not applied", remaining);
                    }
                    e
                })?;

                if cli.output_json {
                    println!("{}", result.to_json()?);
                } else {
                    println!("\nScript committed: {}", result.script);
                    println!("  Run ID: {}", result.run_id);
                    println!("  Duration: {:.2}s", result.duration_seconds);
                    println!(
                        "  Batches: {} executed, {} skipped ({} total)",
                        result.batches_executed, result.batches_skipped, result.batches_total
                    );
                }
            }
        }

        Commands::HealthCheck => {
            let result = migrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Target (SQL Server {}): {} ({}ms)",
                    result.target,
                    if result.connected { "OK" } else { "FAILED" },
                    result.latency_ms
                );
                if let Some(ref err) = result.error {
                    println!("    Error: {}", err);
                }
            }

            if !result.connected {
                return Err(UpgradeError::connection(
                    result.error.unwrap_or_default(),
                    format!("health check against {}", result.target),
                ));
            }
        }
    }

    Ok(())
}

fn print_plan(plan: &ScriptPlan, json: bool) -> Result<(), UpgradeError> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }

    println!(
        "{}: {} batches ({} to execute)",
        plan.script,
        plan.batches.len(),
        plan.executable()
    );
    for batch in &plan.batches {
        let note = if batch.blank { ", blank" } else { "" };
        println!("-- batch {} (line {}{})", batch.position, batch.line, note);
        if !batch.blank {
            println!("{}", batch.text);
        }
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr; stdout carries results.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM. The first one cancels the token
/// and the running script is rolled back; a second one exits immediately.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, UpgradeError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            if token.is_cancelled() {
                force_exit(name);
            }
            eprintln!("\nReceived {}. Rolling back...", name);
            token.cancel();
        }
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, UpgradeError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if token.is_cancelled() {
                force_exit("Ctrl-C");
            }
            eprintln!("\nReceived Ctrl-C. Rolling back...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}

/// Exit without waiting for the rollback. An open transaction is rolled back
/// by the server once the connection closes.
fn force_exit(signal_name: &str) -> ! {
    eprintln!(
        "\nReceived {} again. Exiting without waiting for rollback.",
        signal_name
    );
    std::process::exit(i32::from(mssql_upgrade::error::EXIT_CANCELLED));
}
