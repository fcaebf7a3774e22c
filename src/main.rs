//! xair-remote - OSC remote control for X-Air style digital mixers
//!
//! Finds the mixer on the LAN, keeps its feedback subscription alive and
//! offers a small REPL to move faders and mutes.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod monitor;

use crate::cli::ReplCommand;
use crate::monitor::Monitor;
use xair_remote::config::{AppConfig, ConfigWatcher};
use xair_remote::discovery::{self, Discovery};
use xair_remote::osc::Strip;
use xair_remote::session::{MixerEvent, SessionController};

/// Step interval of a REPL sweep gesture
const SWEEP_STEP: Duration = Duration::from_millis(5);

/// xair-remote - control a digital mixer over OSC
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write logs to this file
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Mixer IP address (skips discovery)
    #[arg(long, env = "MIXER_HOST")]
    host: Option<String>,

    /// Mixer control port
    #[arg(long)]
    port: Option<u16>,

    /// Network range to scan, e.g. 192.168.1.0/24
    #[arg(long)]
    cidr: Option<String>,

    /// Discover the mixer, print its address and exit
    #[arg(long)]
    discover: bool,

    /// Print every inbound event
    #[arg(long)]
    monitor: bool,

    /// List local networks discovery would scan
    #[arg(long)]
    list_interfaces: bool,
}

impl Args {
    /// Command-line values win over the file
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.mixer.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.mixer.port = port;
        }
        if let Some(cidr) = &self.cidr {
            config.mixer.cidr = Some(cidr.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _log_guard = init_logging(&args.log_level, args.log_file.as_deref())?;

    info!("Starting xair-remote v{}...", env!("CARGO_PKG_VERSION"));

    let (config_watcher, mut config) = load_config(&args).await?;

    if args.list_interfaces {
        let networks = discovery::local_networks().context("Failed to enumerate interfaces")?;
        monitor::print_interfaces(&networks, config.discovery.max_hosts);
        return Ok(());
    }

    if args.discover {
        let discovery = Discovery::new(
            config.mixer.port,
            Duration::from_millis(config.discovery.timeout_ms),
        )
        .with_max_hosts(config.discovery.max_hosts);
        let found = if config.discovery.broadcast_first {
            match discovery.broadcast().await {
                Ok(found) => found,
                Err(e) => {
                    debug!("Broadcast probe failed: {}", e);
                    discovery.discover(config.scan_range()?).await?
                }
            }
        } else {
            discovery.discover(config.scan_range()?).await?
        };
        println!("{}", found.ip());
        return Ok(());
    }

    let session = Arc::new(SessionController::new(config.session_config()));
    let events = session
        .take_event_receiver()
        .context("Session event receiver already taken")?;

    session.open().context("Failed to open OSC socket")?;
    let target = resolve_target(&session, &config)
        .await
        .context("No mixer found; pass --host or set mixer.host")?;
    info!("Mixer target: {}", target);
    session.go_live()?;

    let (repl_tx, repl_rx) = mpsc::channel::<ReplCommand>(32);
    let _repl = cli::spawn_repl(repl_tx)?;

    let shutdown = shutdown_signal();
    run_app(
        Arc::clone(&session),
        events,
        repl_rx,
        config_watcher,
        &args,
        &mut config,
        args.monitor,
        shutdown,
    )
    .await?;

    session.close();
    info!("xair-remote shutdown complete");
    Ok(())
}

/// Load the file (with hot reload) if it exists, defaults otherwise
async fn load_config(args: &Args) -> Result<(Option<ConfigWatcher>, AppConfig)> {
    let (watcher, mut config) = if Path::new(&args.config).exists() {
        let (watcher, config) = ConfigWatcher::new(args.config.clone()).await?;
        info!("Configuration loaded from {} with hot-reload enabled", args.config);
        (Some(watcher), config)
    } else {
        info!("No config file at {}, using defaults", args.config);
        (None, AppConfig::default())
    };

    args.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok((watcher, config))
}

/// Manual host if configured, otherwise broadcast and/or range discovery
async fn resolve_target(session: &SessionController, config: &AppConfig) -> Result<SocketAddr> {
    if let Some(target) = config.mixer_target()? {
        session.set_target(target);
        return Ok(target);
    }

    if config.discovery.broadcast_first {
        match session.discover_broadcast().await {
            Ok(found) => return Ok(found),
            Err(e) => debug!("Broadcast probe found nothing: {}", e),
        }
    }
    Ok(session.discover(config.scan_range()?).await?)
}

#[allow(clippy::too_many_arguments)]
async fn run_app(
    session: Arc<SessionController>,
    mut events: mpsc::Receiver<MixerEvent>,
    mut repl_rx: mpsc::Receiver<ReplCommand>,
    mut config_watcher: Option<ConfigWatcher>,
    args: &Args,
    config: &mut AppConfig,
    monitor_enabled: bool,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let mut monitor = Monitor::new();
    if monitor_enabled {
        monitor.print_header();
    }
    println!("{}", cli::HELP);

    let mut meter_updates = session.meter_updates();
    let mut retarget_task: Option<tokio::task::JoinHandle<()>> = None;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if monitor_enabled {
                    monitor.print_event(&event);
                }
            }

            Ok(()) = meter_updates.changed(), if monitor_enabled => {
                monitor.print_meter_line(&session.meters());
            }

            Some(cmd) = repl_rx.recv() => {
                if cmd == ReplCommand::Quit {
                    info!("Quit requested");
                    break;
                }
                if let Err(e) = handle_command(&session, cmd) {
                    warn!("Command failed: {:#}", e);
                }
            }

            Some(mut new_config) = next_config(&mut config_watcher) => {
                info!("📝 Configuration file changed, reloading...");
                args.apply_overrides(&mut new_config);
                if let Err(e) = new_config.validate() {
                    warn!("⚠️  Ignoring invalid config: {:#}", e);
                    continue;
                }
                if config.endpoint_changed(&new_config) {
                    if let Some(task) = retarget_task.take() {
                        task.abort();
                    }
                    retarget_task = Some(spawn_retarget(Arc::clone(&session), new_config.clone()));
                } else {
                    info!("Endpoint unchanged; other settings apply after restart");
                }
                *config = new_config;
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    if let Some(task) = retarget_task {
        task.abort();
    }
    Ok(())
}

async fn next_config(watcher: &mut Option<ConfigWatcher>) -> Option<AppConfig> {
    match watcher {
        Some(watcher) => watcher.next_config().await,
        None => std::future::pending().await,
    }
}

/// Retarget in the background; discovery may take the full timeout per
/// interface
fn spawn_retarget(session: Arc<SessionController>, config: AppConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match retarget(&session, &config).await {
            Ok(target) => info!("✅ Retargeted to {}", target),
            Err(e) => warn!("⚠️  Retarget failed (keeping {:?}): {:#}", session.target(), e),
        }
    })
}

/// Point the live session at the endpoint of a reloaded config and resync
async fn retarget(session: &SessionController, config: &AppConfig) -> Result<SocketAddr> {
    let target = resolve_target(session, config).await?;
    session.query_info()?;
    session.sync_all()?;
    Ok(target)
}

fn handle_command(session: &Arc<SessionController>, cmd: ReplCommand) -> Result<()> {
    match cmd {
        ReplCommand::Fader { strip, value } => session.set_fader(strip, value)?,
        ReplCommand::Mute { strip, muted } => {
            if !session.set_mute(strip, muted)? {
                println!("{} already {}", strip, if muted { "muted" } else { "on" });
            }
        }
        ReplCommand::Sweep {
            strip,
            from,
            to,
            duration,
        } => spawn_sweep(Arc::clone(session), strip, from, to, duration),
        ReplCommand::Sync => session.sync_all()?,
        ReplCommand::Info => {
            if let Some(info) = session.info() {
                println!("{}", info);
            }
            session.query_info()?;
        }
        ReplCommand::Meters => monitor::print_meters(&session.meters()),
        ReplCommand::State => {
            let (sent, received, dropped) = session.stats().summary();
            println!(
                "session {} target {} | sent {} received {} dropped {}",
                session.state(),
                session
                    .target()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                sent,
                received,
                dropped
            );
            monitor::print_state(&session.mixer_state());
        }
        ReplCommand::Reconnect => {
            let session = Arc::clone(session);
            tokio::spawn(async move {
                if let Err(e) = session.reconnect().await {
                    warn!("Reconnect failed: {:#}", e);
                }
            });
        }
        ReplCommand::Help => println!("{}", cli::HELP),
        ReplCommand::Quit => {}
    }
    Ok(())
}

/// Drive a fader gesture through the throttle, then release it
fn spawn_sweep(session: Arc<SessionController>, strip: Strip, from: f32, to: f32, duration: Duration) {
    tokio::spawn(async move {
        let steps = (duration.as_millis() / SWEEP_STEP.as_millis()).max(1) as u32;
        let mut ticker = tokio::time::interval(SWEEP_STEP);
        for step in 0..=steps {
            ticker.tick().await;
            let value = from + (to - from) * step as f32 / steps as f32;
            if !session.fader_intent(strip, value) {
                warn!("{} is not a tracked strip", strip);
                return;
            }
        }
        let last = session.fader_release(strip);
        debug!("Sweep on {} finished, final send {:?}", strip, last);
    });
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use xair_remote::SessionConfig;

    #[tokio::test]
    async fn test_retarget_runs_in_background() {
        let session = Arc::new(SessionController::new(SessionConfig {
            local_port: 0,
            discovery_timeout: Duration::from_millis(300),
            ..SessionConfig::default()
        }));
        session.open().unwrap();

        let mut config = AppConfig::default();
        config.mixer.host = None;
        config.mixer.cidr = Some("127.0.0.9/32".to_string());
        config.discovery.broadcast_first = false;

        let started = std::time::Instant::now();
        let task = spawn_retarget(Arc::clone(&session), config);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!task.is_finished());

        // Nothing answers: the scan times out and the target stays unset
        task.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(280));
        assert_eq!(session.target(), None);
    }
}
