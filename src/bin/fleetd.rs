//! Fleet Daemon - per-device TCP listeners with bus replication
//!
//! See `fleetd --help` and the `cli` module for usage.

fn main() -> anyhow::Result<()> {
    fleetd::cli::run()
}
