//! CLI entry point for the pathwatch tool.
//!
//! This binary watches a single path for changes and prints one line per
//! change event, either human-readable or as NDJSON.
//!
//! # Usage
//!
//! ```bash
//! pathwatch [OPTIONS] <PATH>
//!
//! # Watch one file
//! pathwatch /etc/hosts
//!
//! # Watch a tree recursively, emitting NDJSON
//! pathwatch --recursive --json ./src
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pathwatch::{WatchStream, recursive_watch_available};
use pathwatch_core::TaskRunner;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Watch a file or directory and report every change.
///
/// Prints one line per change event until interrupted. A line with
/// `error: true` (or an `[error]` marker in text mode) is terminal: the
/// platform backend died and the process exits non-zero.
#[derive(Parser)]
#[command(name = "pathwatch", version, about, long_about = None)]
struct Cli {
    /// Path to watch. Relative paths resolve against the current directory.
    path: PathBuf,

    /// Watch the whole subtree beneath the path, not just the path itself.
    #[arg(short, long, env = "PATHWATCH_RECURSIVE")]
    recursive: bool,

    /// Emit newline-delimited JSON instead of human-readable lines.
    #[arg(long, env = "PATHWATCH_JSON")]
    json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `warn` level by default so log
/// lines never interleave with event output in normal operation.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "warn" };
        EnvFilter::new(format!("{level},mio=warn"))
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_ansi(use_ansi))
        .with(filter)
        .init();
}

// =============================================================================
// WATCH LOOP
// =============================================================================

/// Streams change events to stdout until the watch ends or a shutdown
/// signal arrives. Returns `false` if the watch ended with a backend error.
async fn run_watch(cli: &Cli) -> color_eyre::Result<bool> {
    let runner = TaskRunner::new("cli")?;
    let mut stream = WatchStream::watch(&runner, &cli.path, cli.recursive)?;

    info!(path = %cli.path.display(), recursive = cli.recursive, "watching");

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(not(unix))]
    let mut sigterm = std::future::pending::<()>();

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = &mut sigterm;

        tokio::select! {
            event = stream.recv() => {
                let Some(event) = event else {
                    // Stream closed after a terminal event; nothing follows.
                    return Ok(true);
                };
                let is_error = event.error;
                print_event(cli.json, &event)?;
                if is_error {
                    return Ok(false);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(true);
            }
            _ = terminate => {
                info!("received SIGTERM, shutting down");
                return Ok(true);
            }
        }
    }
}

fn print_event(json: bool, event: &pathwatch::ChangeEvent) -> color_eyre::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    if json {
        let line = serde_json::to_string(event)?;
        writeln!(handle, "{line}")?;
    } else if event.error {
        writeln!(handle, "[error] {}", event.path.display())?;
    } else {
        writeln!(handle, "changed: {}", event.path.display())?;
    }
    handle.flush()?;
    Ok(())
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose, cli.no_color);

    // 4. Reject configurations this platform cannot serve
    if cli.recursive && !recursive_watch_available() {
        return Err(color_eyre::eyre::eyre!(
            "recursive watching is not supported on this platform"
        ));
    }

    // 5. Run until the watch ends or a signal arrives
    let clean = run_watch(&cli).await?;
    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
