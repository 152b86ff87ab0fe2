//! Cadence - freshness scheduler and staged orchestration CLI
//!
//! Keeps configured data sources fresh in the background and runs requests
//! through stages of worker units.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, validation, orchestrator fault, etc.)
//!   2 - Run completed with zero confidence

use anyhow::{bail, Context, Result};
use cadence::cli::{Args, Command, OutputFormat};
use cadence::config::{Config, DEFAULT_CONFIG_FILE};
use cadence::{report, Engine, WorkRequest};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if matches!(args.command, Command::InitConfig) {
        return handle_init_config();
    }

    init_logging(&args);

    info!("Cadence v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match execute(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .cadence.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", DEFAULT_CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to declare sources, workers and routes.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
///
/// `RUST_LOG` takes precedence over `--verbose` / `--quiet`.
fn init_logging(args: &Args) {
    let level = args.log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Dispatch a subcommand. Returns the process exit code.
async fn execute(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let engine = Engine::from_config(&config)?;

    match args.command.clone() {
        Command::Serve => serve(&engine, &config).await,
        Command::Status => status(&engine, &args).await,
        Command::Refresh { source } => refresh(&engine, &source, &args).await,
        Command::Run {
            query,
            category,
            params,
            output,
        } => {
            let mut request = WorkRequest::new(query);
            request.category = category;
            request.params.extend(params);
            run(&engine, request, args.format, output, args.quiet).await
        }
        Command::InitConfig => {
            handle_init_config()?;
            Ok(0)
        }
    }
}

/// Keep sources fresh until Ctrl-C, logging status periodically.
async fn serve(engine: &Engine, config: &Config) -> Result<i32> {
    engine.start();
    println!(
        "🔄 Refreshing {} sources. Press Ctrl-C to stop.",
        engine.status().total_sources
    );

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.general.status_log_secs));
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = ticker.tick() => {
                let status = engine.status();
                info!(
                    sources = status.total_sources,
                    active_loops = status.active_loops,
                    stale = status.stale_count(),
                    "Scheduler status"
                );
                for source in status.sources.iter().filter(|s| s.is_stale) {
                    warn!(source = %source.name, has_data = source.has_data, "Source is stale");
                }
            }
        }
    }

    println!("\n⏹  Stopping refresh loops...");
    engine.stop().await;
    println!("✅ Stopped.");
    Ok(0)
}

/// Warm every source once and print freshness status.
async fn status(engine: &Engine, args: &Args) -> Result<i32> {
    warm_cache(engine, args.quiet).await;

    let status = engine.status();
    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&serde_json::json!({
            "scheduler": status,
            "health": engine.health(),
        }))?,
        OutputFormat::Markdown => format!(
            "{}\n{}",
            report::generate_status_markdown(&status),
            report::generate_health_markdown(&engine.health())
        ),
    };
    println!("{}", output);
    Ok(0)
}

/// Force-refresh a single source.
async fn refresh(engine: &Engine, source: &str, args: &Args) -> Result<i32> {
    let fetched_at = engine
        .force_refresh(source)
        .await
        .with_context(|| format!("Refresh of '{}' failed", source))?;

    match args.format {
        OutputFormat::Json => {
            let data = engine.fresh_data(&[source]);
            println!("{}", report::generate_json_report(&data)?);
        }
        OutputFormat::Markdown => {
            println!(
                "✅ Refreshed '{}' at {}",
                source,
                fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(status) = engine.source_status(source) {
                println!(
                    "   has data: {} | stale: {}",
                    status.has_data, status.is_stale
                );
            }
        }
    }
    Ok(0)
}

/// Run one request and render its outcome.
async fn run(
    engine: &Engine,
    request: WorkRequest,
    format: OutputFormat,
    output: Option<PathBuf>,
    quiet: bool,
) -> Result<i32> {
    warm_cache(engine, quiet).await;

    if !quiet {
        eprintln!("🔬 Running request {}...", request.request_id);
    }

    let outcome = match engine.run(request).await {
        Ok(outcome) => outcome,
        Err(e) => bail!("Run failed (confidence {:.1}): {}", e.confidence(), e),
    };

    let rendered = match format {
        OutputFormat::Json => report::generate_json_report(&outcome)?,
        OutputFormat::Markdown => report::generate_markdown_report(&outcome),
    };

    match output {
        Some(path) => {
            report::write_report(&rendered, &path)?;
            if !quiet {
                eprintln!("✅ Report saved to: {}", path.display());
            }
        }
        None => println!("{}", rendered),
    }

    if !quiet {
        eprintln!(
            "\n📊 Confidence: {:.0}% | {} succeeded | {} failed | {:.2}s",
            outcome.confidence * 100.0,
            outcome.succeeded,
            outcome.failed,
            outcome.total_elapsed.as_secs_f64()
        );
    }

    if outcome.confidence <= 0.0 {
        eprintln!("\n⛔ Run produced zero confidence. Failing (exit code 2).");
        return Ok(2);
    }

    Ok(0)
}

/// Fetch every source once, showing a progress bar.
async fn warm_cache(engine: &Engine, quiet: bool) {
    let total = engine.status().total_sources as u64;
    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total)
    };
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    progress.set_message("warming sources");

    for (source, outcome) in engine.refresh_all().await {
        progress.inc(1);
        if let Err(e) = outcome {
            warn!(source = %source, "Initial fetch failed: {}", e);
        }
    }

    progress.finish_and_clear();
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default()? {
        Some(config) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        None => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}
