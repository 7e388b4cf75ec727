//! `fleetd` command line.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! fleetd start
//!
//! # Start the daemon (background/daemonized)
//! fleetd start -d
//!
//! # Stop the daemon
//! fleetd stop
//!
//! # Show daemon and per-device reachability
//! fleetd status
//!
//! # Replicate a new device to every instance on the broker
//! fleetd --bus mqtt --mqtt-host broker.local \
//!     publish add --name D1 --host 10.0.0.5 --port 9000 --commands "STATUS, RESET"
//!
//! # Enable debug logging
//! RUST_LOG=fleetd=debug fleetd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (listeners closed, probes stopped)

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fleet_core::{parse_command_list, Device, DeviceName};
use fleet_protocol::{EventKind, ReplicationEvent};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{BusKind, DaemonConfig};
use crate::daemon::FleetDaemon;
use crate::monitor;
use crate::replication::{EventBus, MqttBus};
use crate::snapshot::SnapshotStore;

/// Device fleet daemon - per-device TCP listeners with bus replication
#[derive(Parser, Debug)]
#[command(name = "fleetd", version, about)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Settings layered over the config file.
#[derive(Args, Debug)]
struct Overrides {
    /// TOML config file
    #[arg(long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Device snapshot file
    #[arg(long, global = true, env = "FLEET_SNAPSHOT")]
    snapshot: Option<PathBuf>,

    /// Replication bus
    #[arg(long, global = true, env = "FLEET_BUS")]
    bus: Option<BusKind>,

    /// MQTT broker host
    #[arg(long, global = true, env = "FLEET_MQTT_HOST")]
    mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long, global = true, env = "FLEET_MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// Replication topic
    #[arg(long, global = true, env = "FLEET_TOPIC")]
    topic: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status and device reachability
    Status {
        /// Print the device listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Publish a replication event on the MQTT bus
    Publish(PublishArgs),
}

#[derive(Args, Debug)]
struct PublishArgs {
    /// Mutation to replicate
    #[arg(value_enum)]
    kind: PublishKind,

    /// Device name
    #[arg(long)]
    name: String,

    /// Device IP or hostname (delete: defaults to the snapshot record)
    #[arg(long)]
    host: Option<String>,

    /// Device port (delete: defaults to the snapshot record)
    #[arg(long)]
    port: Option<u16>,

    /// Comma-separated command list
    #[arg(long, default_value = "")]
    commands: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PublishKind {
    Add,
    Edit,
    Delete,
}

impl From<PublishKind> for EventKind {
    fn from(kind: PublishKind) -> Self {
        match kind {
            PublishKind::Add => EventKind::Add,
            PublishKind::Edit => EventKind::Edit,
            PublishKind::Delete => EventKind::Delete,
        }
    }
}

impl Overrides {
    /// Loads the config file (if any) and applies flag/env overrides.
    fn resolve(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(snapshot) = &self.snapshot {
            config.snapshot_path = snapshot.clone();
        }
        if let Some(kind) = self.bus {
            config.bus.kind = kind;
        }
        if let Some(host) = &self.mqtt_host {
            config.bus.host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            config.bus.port = port;
        }
        if let Some(topic) = &self.topic {
            config.bus.topic = topic.clone();
        }

        // The daemon changes directory to / when it forks.
        config.snapshot_path = absolute(&config.snapshot_path)?;

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    Ok(cwd.join(path))
}

// ============================================================================
// PID file
// ============================================================================

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("fleet")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("fleetd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("fleetd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the PID of a live daemon, clearing a stale PID file.
fn running_daemon() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

fn signal_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

// ============================================================================
// Entry point
// ============================================================================

/// Parses arguments and runs the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            let config = cli.overrides.resolve()?;

            if let Some(pid) = running_daemon() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'fleetd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                // Fork before the tokio runtime exists
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => stop(),
        Command::Status { json } => {
            let config = cli.overrides.resolve()?;
            status(config, json)
        }
        Command::Publish(args) => {
            let config = cli.overrides.resolve()?;
            publish(config, args)
        }
    }
}

fn stop() -> Result<()> {
    let Some(pid) = running_daemon() else {
        println!("Daemon is not running.");
        return Ok(());
    };

    println!("Stopping daemon (PID {pid})...");
    signal_daemon(pid)?;

    for _ in 0..50 {
        if !is_process_running(pid) {
            println!("Daemon stopped.");
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    eprintln!("Daemon did not stop within 5 seconds.");
    process::exit(1);
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fleetd=info".parse()?)
                .add_directive("fleet_core=info".parse()?)
                .add_directive("fleet_protocol=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    init_tracing()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        snapshot = %config.snapshot_path.display(),
        bus = ?config.bus.kind,
        "Fleet daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let daemon = FleetDaemon::start(&config)
        .await
        .context("Failed to start fleet daemon")?;

    let devices = daemon.registry().list().await;
    let ports = daemon.registry().active_ports().await;
    info!(devices = devices.len(), listeners = ports.len(), "Fleet ready");

    daemon.run_until(cancel_token).await;
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// Prints daemon liveness and the reachability of every persisted device.
#[tokio::main]
async fn status(config: DaemonConfig, json: bool) -> Result<()> {
    init_tracing()?;

    let devices = SnapshotStore::new(config.snapshot_path.clone())
        .load()
        .await
        .context("Failed to load device snapshot")?;
    let report = monitor::status_report(devices, config.reachability_timeout()).await;

    if json {
        let document = serde_json::to_string_pretty(&report).context("Failed to encode status")?;
        println!("{document}");
        return Ok(());
    }

    match running_daemon() {
        Some(pid) => println!("Daemon is running (PID {pid})"),
        None => println!("Daemon is not running."),
    }
    println!("Snapshot: {}", config.snapshot_path.display());

    if report.is_empty() {
        println!("No devices registered.");
    }
    for row in &report {
        println!("{}\t{}", row.name, row.status);
    }
    Ok(())
}

/// Publishes one replication event and disconnects.
#[tokio::main]
async fn publish(config: DaemonConfig, args: PublishArgs) -> Result<()> {
    init_tracing()?;

    if config.bus.kind != BusKind::Mqtt {
        bail!("publish needs the mqtt bus (pass --bus mqtt or set [bus] kind = \"mqtt\")");
    }

    let kind = EventKind::from(args.kind);
    let device = publish_device(&config, kind, args).await?;
    let event = ReplicationEvent::new(kind, device);

    let settings = config.bus.mqtt();
    let mut builder = MqttBus::builder()
        .host(settings.host)
        .port(settings.port)
        .topic(settings.topic)
        .keep_alive(settings.keep_alive)
        .connection_timeout(settings.connection_timeout);
    if let Some((username, password)) = settings.credentials {
        builder = builder.credentials(username, password);
    }
    let bus = builder.build().await.context("Failed to connect to MQTT broker")?;

    let result = bus.publish(&event).await;
    bus.disconnect().await;
    result.context("Failed to publish replication event")?;

    println!("Published {} for {}", event.kind, event.device.name);
    Ok(())
}

/// Builds the event's device record, filling a delete from the snapshot.
async fn publish_device(config: &DaemonConfig, kind: EventKind, args: PublishArgs) -> Result<Device> {
    let commands = parse_command_list(&args.commands);

    let (host, port) = match (args.host, args.port, kind) {
        (Some(host), Some(port), _) => (host, port),
        (host, port, EventKind::Delete) => {
            let name = DeviceName::new(args.name.as_str());
            let known = SnapshotStore::new(config.snapshot_path.clone())
                .load()
                .await
                .context("Failed to load device snapshot")?
                .into_iter()
                .find(|d| d.name == name);
            match known {
                Some(d) => (host.unwrap_or(d.host), port.unwrap_or(d.port)),
                None => bail!("Unknown device {name}; pass --host and --port"),
            }
        }
        _ => bail!("--host and --port are required for {kind}"),
    };

    Device::new(args.name, host, port, commands)
        .validated()
        .context("Invalid device")
}
