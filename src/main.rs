//! dynres - per-application display resolution switching daemon.
//!
//! Switches the display mode when a configured application gains focus,
//! reverts after a grace period, and optionally confines the cursor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use dynres::backend::Backends;
use dynres::backend::X11Session;
use dynres::config::ConfigStore;
use dynres::config::default_config_path;
use dynres::display::DisplayBackend;
use dynres::display::query_current_with_retry;
use dynres::domain::ResolutionMode;
use dynres::engine::Engine;
use dynres::engine::app_version;
use dynres::events::MOUSE_LOCK_CHANGED;
use dynres::events::RESOLUTION_CHANGED;
use dynres::focus::FocusMonitor;
use dynres::focus::MonitorOptions;
use dynres::focus::transitions;
use dynres::processes::ProcessTable;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Per-application display resolution switching.
///
/// Switches the display mode when a configured application gains focus and
/// reverts when it loses focus.
#[derive(Parser, Debug)]
#[command(name = "dynres")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log display and cursor changes instead of performing them.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Focus poll interval in milliseconds.
    #[arg(long, default_value = "250", global = true)]
    poll_interval_ms: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default).
    Run {
        /// Print status events to stdout as JSON lines.
        #[arg(long)]
        print_events: bool,
    },
    /// List supported display modes.
    Modes,
    /// Print the current display mode.
    Current,
    /// Switch the display to a mode, e.g. 1920x1080@144.
    Set { mode: ResolutionMode },
    /// List running processes, largest memory first.
    Processes {
        /// Number of processes to show.
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print the version.
    Version,
    /// Print the config file path.
    ConfigPath,
    /// Print focus transitions, then exit.
    WatchFocus {
        /// Number of transitions to capture.
        #[arg(long, default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => default_config_path().context("Could not determine the config directory")?,
    };
    let processes = Arc::new(ProcessTable::new());

    match args.command.unwrap_or(Command::Run {
        print_events: false,
    }) {
        Command::Version => println!("dynres {}", app_version()),
        Command::ConfigPath => println!("{}", config_path.display()),
        Command::Processes { limit } => {
            for process in processes.snapshot().into_iter().take(limit) {
                println!(
                    "{:>8}  {:>10} KiB  {}",
                    process.pid,
                    process.memory / 1024,
                    process.name
                );
            }
        }
        Command::Modes => {
            let display = connect(args.dry_run, processes)?.display;
            for mode in display.supported_modes()? {
                println!("{mode}");
            }
        }
        Command::Current => {
            let display = connect(args.dry_run, processes)?.display;
            match query_current_with_retry(display.as_ref()) {
                Some(mode) => println!("{mode}"),
                None => anyhow::bail!("Could not determine the current display mode"),
            }
        }
        Command::Set { mode } => {
            let display = connect(args.dry_run, processes)?.display;
            display
                .apply_mode(mode)
                .with_context(|| format!("Failed to switch to {mode}"))?;
            println!("{mode}");
        }
        Command::WatchFocus { count } => {
            run_watch_focus(count, poll_options(args.poll_interval_ms), processes).await?;
        }
        Command::Run { print_events } => {
            info!("dynres v{} starting", app_version());
            let backends = connect(args.dry_run, Arc::clone(&processes))?;
            let store = ConfigStore::open(config_path);
            info!("Configuration loaded (dry_run={})", args.dry_run);

            let options = poll_options(args.poll_interval_ms);
            let engine = Engine::start(store, backends, processes, options).await;
            run_daemon(engine, print_events).await?;
        }
    }

    Ok(())
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("dynres={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

fn poll_options(interval_ms: u64) -> MonitorOptions {
    MonitorOptions {
        interval: Duration::from_millis(interval_ms.max(1)),
        ..MonitorOptions::default()
    }
}

/// Open the backends, explaining the environment when X11 is unreachable.
fn connect(dry_run: bool, processes: Arc<ProcessTable>) -> Result<Backends> {
    let backends = if dry_run {
        Backends::dry_run(processes)
    } else {
        Backends::x11(processes)
    };

    backends
        .inspect_err(|_| {
            error!("X11 display not available.");
            for diag in X11Session::diagnostics() {
                error!("  {}", diag);
            }
        })
        .context("Failed to open display backends")
}

/// Print focus transitions until `count` have been seen.
async fn run_watch_focus(
    count: usize,
    options: MonitorOptions,
    processes: Arc<ProcessTable>,
) -> Result<()> {
    info!("Watching focus, capturing {} transitions", count);

    let session = X11Session::connect().context("Failed to connect to X11")?;
    let cancel = CancellationToken::new();
    let monitor = FocusMonitor::new(Box::new(session.focus_probe(processes)), options);
    let (rx, handle) = monitor.spawn(cancel.clone());
    let mut focus = Box::pin(transitions(rx));

    let mut captured = 0;
    while captured < count {
        match tokio::time::timeout(Duration::from_secs(30), focus.next()).await {
            Ok(Some(state)) => {
                captured += 1;
                println!("[{captured}] {state}");
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Timeout waiting for focus changes");
                break;
            }
        }
    }

    cancel.cancel();
    if let Err(e) = handle.await {
        warn!("Focus monitor task failed: {}", e);
    }
    info!("Captured {} focus transitions", captured);
    Ok(())
}

#[derive(Serialize)]
struct EventLine<'a, T> {
    event: &'a str,
    payload: T,
}

fn print_event<T: Serialize>(event: &str, payload: T) {
    match serde_json::to_string(&EventLine { event, payload }) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Could not serialize {} event: {}", event, e),
    }
}

/// Run until Ctrl-C. `SIGUSR1` forces a pending revert.
async fn run_daemon(engine: Engine, print_events: bool) -> Result<()> {
    let mut resolution = engine.subscribe_resolution();
    let mut mouse_lock = engine.subscribe_mouse_lock();
    let mut usr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    info!("Daemon started, waiting for focus changes...");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Ctrl-C handler failed: {}", e);
                }
                break;
            }
            _ = usr1.recv() => {
                info!("SIGUSR1 received, forcing revert");
                if let Err(e) = engine.force_revert().await {
                    warn!("Force revert failed: {}", e);
                }
            }
            event = resolution.recv() => match event {
                Ok(event) => {
                    info!("{}: {:?}", RESOLUTION_CHANGED, event);
                    if print_events {
                        print_event(RESOLUTION_CHANGED, event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} {} events", n, RESOLUTION_CHANGED);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = mouse_lock.recv() => match event {
                Ok(event) => {
                    info!("{}: {:?}", MOUSE_LOCK_CHANGED, event);
                    if print_events {
                        print_event(MOUSE_LOCK_CHANGED, event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} {} events", n, MOUSE_LOCK_CHANGED);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown().await;
    Ok(())
}
