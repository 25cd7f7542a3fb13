//! CLI entry point for the sd-watch tool.
//!
//! Watches a Consul catalog and prints one line per service update until
//! interrupted.
//!
//! # Usage
//!
//! ```bash
//! sd-watch [OPTIONS]
//!
//! # Watch services tagged `prod` on the local agent
//! sd-watch --consul-address 127.0.0.1:8500 --tag prod
//!
//! # Settings from a file, updates as JSON lines
//! sd-watch --config registry.json --format json
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use sd_core::{Config, RegistryConfig, ServiceUpdate};
use sd_watcher::RegistryWatcher;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Streams service changes from a Consul catalog.
///
/// Every service carrying one of the watched tags is reported when it
/// appears (NEW), whenever its instances change (CHANGED), and when it
/// leaves the catalog (DELETED).
#[derive(Parser)]
#[command(name = "sd-watch", version, about, long_about = None)]
struct Cli {
    /// JSON file with a `registry` section.
    ///
    /// Flags given on the command line override values from the file.
    #[arg(short, long, env = "SD_WATCH_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Consul agent address. Only the first one is used.
    #[arg(short = 'a', long, env = "SD_CONSUL_ADDRESS", value_delimiter = ',')]
    consul_address: Vec<String>,

    /// Tag that makes a service worth watching. Repeatable.
    #[arg(short, long, env = "SD_WATCH_TAGS", value_delimiter = ',')]
    tag: Vec<String>,

    /// Datacenter to query instead of the agent's own.
    #[arg(long, env = "SD_CONSUL_DATACENTER")]
    datacenter: Option<String>,

    /// ACL token sent with every request.
    #[arg(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable verbose logging (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,
}

/// Update output format.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// One human-readable line per update.
    Text,
    /// One JSON object per line.
    Json,
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `info` level by default.
/// Noisy crates like `hyper` and `reqwest` are filtered to `warn` level.
/// Logs go to stderr so stdout carries only updates.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},hyper=warn,hyper_util=warn,reqwest=warn"))
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(use_ansi)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// Builds the [`RegistryConfig`] from the optional file and CLI arguments.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the result is invalid.
fn build_config(cli: &Cli) -> color_eyre::Result<RegistryConfig> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .map_err(|e| color_eyre::eyre::eyre!("Failed to load {path}: {e}"))?
            .registry,
        None => RegistryConfig::default(),
    };

    if !cli.consul_address.is_empty() {
        config.addresses.clone_from(&cli.consul_address);
    }
    if !cli.tag.is_empty() {
        config.tags_to_watch.clone_from(&cli.tag);
    }
    if cli.datacenter.is_some() {
        config.datacenter.clone_from(&cli.datacenter);
    }
    if cli.token.is_some() {
        config.token.clone_from(&cli.token);
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// COMMAND IMPLEMENTATION
// =============================================================================

/// Prints updates until the stream ends or a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the watcher cannot start, stdout cannot be written,
/// or shutdown fails.
async fn run_watch(config: RegistryConfig, format: OutputFormat) -> color_eyre::Result<()> {
    info!(
        address = config.primary_address().unwrap_or_default(),
        tags = ?config.tags_to_watch,
        "Starting watcher"
    );

    let mut watcher = RegistryWatcher::new(&config).await?;
    let shutdown = watcher.shutdown_token();

    #[cfg(unix)]
    let mut sigterm = {
        use tokio::signal::unix::{SignalKind, signal};
        signal(SignalKind::terminate())?
    };

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            update = watcher.recv() => match update {
                Some(update) => print_update(&update, format)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                shutdown.cancel();
                break;
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down");
                shutdown.cancel();
                break;
            }
        }
    }

    watcher.shutdown().await?;
    info!("Watcher stopped");
    Ok(())
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

/// Writes one update to stdout.
fn print_update(update: &ServiceUpdate, format: OutputFormat) -> color_eyre::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    write_update(&mut handle, update, format)?;
    handle.flush()?;
    Ok(())
}

/// Renders one update as a single line.
fn write_update<W: Write>(
    out: &mut W,
    update: &ServiceUpdate,
    format: OutputFormat,
) -> color_eyre::Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, update)?;
            writeln!(out)?;
        }
        OutputFormat::Text => {
            write!(
                out,
                "{:<8} {} [{}]",
                update.kind.label(),
                update.service_name,
                update.tag
            )?;
            if !update.instances.is_empty() {
                // Keys are the reachable service endpoints, not the node addresses.
                let endpoints: Vec<&str> = update.instances.keys().map(String::as_str).collect();
                write!(out, " {}", endpoints.join(", "))?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose, cli.no_color);

    // 4. Merge file and flag settings, then watch
    let config = build_config(&cli)?;
    run_watch(config, cli.format).await
}
