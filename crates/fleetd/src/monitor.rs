//! Reachability monitoring for fleet devices.
//!
//! Two independent mechanisms:
//! - A background liveness probe per device (ICMP echo through the system
//!   `ping` binary), owned by the device's registry entry and cancelled when
//!   the device is removed.
//! - An on-demand TCP reachability check used by status queries.
//!
//! # Panic-Free Guarantees
//!
//! All code follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Probe failures are logged, never propagated as fatal errors

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{ConnectivityState, Device, DeviceName, DeviceStatus};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between liveness probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed for a single ICMP echo.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed for the on-demand TCP reachability check.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from liveness probes. Always recoverable.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("host {host} did not answer the echo request")]
    Unreachable { host: String },

    #[error("probe of {host} timed out")]
    Timeout { host: String },

    #[error("failed to run ping: {0}")]
    Spawn(String),
}

// ============================================================================
// Liveness Probe
// ============================================================================

/// Sends a network-layer reachability probe to a host.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, host: &str) -> Result<(), ProbeError>;
}

/// Pinger backed by the system `ping` binary.
///
/// Raw ICMP sockets need elevated privileges; the setuid/capability-enabled
/// system binary does not.
#[derive(Debug, Clone)]
pub struct SystemPing {
    timeout: Duration,
}

impl SystemPing {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Arguments for one echo request; `--` ends option parsing before the host.
    fn args(&self, host: &str) -> Vec<String> {
        let wait_secs = self.timeout.as_secs().max(1).to_string();
        ["-c", "1", "-W", wait_secs.as_str(), "--", host]
            .into_iter()
            .map(ToString::to_string)
            .collect()
    }
}

impl Default for SystemPing {
    fn default() -> Self {
        Self::new(PING_TIMEOUT)
    }
}

#[async_trait]
impl Pinger for SystemPing {
    async fn ping(&self, host: &str) -> Result<(), ProbeError> {
        let mut command = Command::new("ping");
        command
            .args(self.args(host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // Grace period on top of ping's own deadline for process startup.
        let deadline = self.timeout + Duration::from_secs(1);
        let status = match timeout(deadline, command.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(ProbeError::Spawn(e.to_string())),
            Err(_) => {
                return Err(ProbeError::Timeout {
                    host: host.to_string(),
                })
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(ProbeError::Unreachable {
                host: host.to_string(),
            })
        }
    }
}

/// Spawns the liveness probe loop for a device.
///
/// The loop waits `interval` between attempts and runs until `cancel_token`
/// is triggered. Failures are logged at warn level.
pub fn spawn_probe_task(
    device: &Device,
    pinger: Arc<dyn Pinger>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    let name = device.name.clone();
    let host = device.host.clone();

    tokio::spawn(async move {
        debug!(device = %name, host = %host, "Liveness probe started");

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = sleep(interval) => {}
            }

            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                result = pinger.ping(&host) => {
                    if let Err(e) = result {
                        warn!(device = %name, host = %host, error = %e, "Ping failed");
                    }
                }
            }
        }

        debug!(device = %name, "Liveness probe stopped");
    })
}

// ============================================================================
// On-Demand Reachability
// ============================================================================

/// Returns true iff a TCP connection to `(host, port)` succeeds within `limit`.
///
/// The stream is dropped (closed) on every path.
pub async fn check_reachability(host: &str, port: u16, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "Reachability check failed");
            false
        }
        Err(_) => {
            debug!(host, port, "Reachability check timed out");
            false
        }
    }
}

/// Checks a device with the default timeout.
pub async fn check(device: &Device) -> bool {
    check_reachability(&device.host, device.port, REACHABILITY_TIMEOUT).await
}

/// Classifies every device as connected or disconnected.
///
/// Checks run concurrently; the result keeps the input order.
pub async fn status_report(devices: Vec<Device>, limit: Duration) -> Vec<DeviceStatus> {
    let mut checks = JoinSet::new();
    for (index, device) in devices.into_iter().enumerate() {
        checks.spawn(async move {
            let reachable = check_reachability(&device.host, device.port, limit).await;
            (index, device.name, ConnectivityState::from_reachable(reachable))
        });
    }

    let mut rows: Vec<(usize, DeviceName, ConnectivityState)> = Vec::with_capacity(checks.len());
    while let Some(result) = checks.join_next().await {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => warn!(error = %e, "Reachability check task failed"),
        }
    }
    rows.sort_by_key(|(index, _, _)| *index);

    let report: Vec<DeviceStatus> = rows
        .into_iter()
        .map(|(_, name, status)| DeviceStatus { name, status })
        .collect();

    info!(
        devices = report.len(),
        connected = report.iter().filter(|r| r.status.is_connected()).count(),
        "Status report complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    struct CountingPinger {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Pinger for CountingPinger {
        async fn ping(&self, host: &str) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProbeError::Unreachable {
                    host: host.to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_ping_args_end_options_before_host() {
        let ping = SystemPing::new(Duration::from_millis(200));
        assert_eq!(ping.args("-f"), ["-c", "1", "-W", "1", "--", "-f"]);
        assert_eq!(SystemPing::new(Duration::from_secs(3)).args("10.0.0.5")[3], "3");
    }

    #[tokio::test]
    async fn test_check_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(check_reachability("127.0.0.1", port, REACHABILITY_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_check_fails_on_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        assert!(!check_reachability("127.0.0.1", port, REACHABILITY_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_check_fails_on_unresolvable_host() {
        assert!(!check_reachability("no-such-host.invalid", 80, REACHABILITY_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_status_report_keeps_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let closed_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let devices = vec![
            Device::new("closed", "127.0.0.1", closed_port, ["A"]),
            Device::new("open", "127.0.0.1", open_port, ["A"]),
        ];
        let report = status_report(devices, REACHABILITY_TIMEOUT).await;

        assert_eq!(report.len(), 2);
        assert_eq!(report[0].name.as_str(), "closed");
        assert_eq!(report[0].status, ConnectivityState::Disconnected);
        assert_eq!(report[1].name.as_str(), "open");
        assert_eq!(report[1].status, ConnectivityState::Connected);
    }

    #[tokio::test]
    async fn test_probe_loop_survives_failures_and_stops_on_cancel() {
        let pinger = Arc::new(CountingPinger {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let device = Device::new("D1", "127.0.0.1", 9000, ["STATUS"]);
        let cancel = CancellationToken::new();

        let task = spawn_probe_task(
            &device,
            pinger.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        sleep(Duration::from_millis(100)).await;
        assert!(pinger.calls.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("probe task should stop")
            .unwrap();

        let after_stop = pinger.calls.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(pinger.calls.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_constants() {
        assert_eq!(PROBE_INTERVAL, Duration::from_secs(5));
        assert_eq!(REACHABILITY_TIMEOUT, Duration::from_secs(1));
    }
}
