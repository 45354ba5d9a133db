use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::constants::{
    CONTROL_LISTEN, DISCOVERY_GROUP, DISCOVERY_PORT, DISCOVERY_WINDOW_MS, HEALTH_INTERVAL_SECS,
    PROBE_TIMEOUT_MS, RPC_TIMEOUT_MS, STATUS_INTERVAL_SECS,
};
use crate::service::ServiceOptions;

/// Body-tracking service configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory for settings.json and status.json
    #[arg(long, value_name = "DIR")]
    pub work_dir: String,

    /// Listen on host:port for control commands from the outer application.
    #[arg(long, value_name = "ADDR", default_value = CONTROL_LISTEN)]
    pub control_listen: SocketAddr,

    /// Discovery multicast group (a unicast address works for single-node setups)
    #[arg(long, value_name = "IP", default_value_t = IpAddr::V4(DISCOVERY_GROUP))]
    pub discovery_group: IpAddr,

    /// Discovery UDP port
    #[arg(long, default_value_t = DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// How long one discovery round collects answers (ms)
    #[arg(long, default_value_t = DISCOVERY_WINDOW_MS)]
    pub discovery_window_ms: u64,

    /// Reachability probe timeout (ms)
    #[arg(long, default_value_t = PROBE_TIMEOUT_MS)]
    pub probe_timeout_ms: u64,

    /// Control RPC round-trip timeout (ms)
    #[arg(long, default_value_t = RPC_TIMEOUT_MS)]
    pub rpc_timeout_ms: u64,

    /// Seconds between data-source health probes, -1 to disable
    #[arg(long, default_value_t = HEALTH_INTERVAL_SECS, allow_negative_numbers = true)]
    pub health_interval: i64,

    /// Status logging / status.json interval in seconds, -1 to disable
    #[arg(long, default_value_t = STATUS_INTERVAL_SECS, allow_negative_numbers = true)]
    pub status_interval: i64,

    /// Run one discovery round right after startup
    #[arg(long, default_value_t = false)]
    pub discover_on_start: bool,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            discovery_target: SocketAddr::new(self.discovery_group, self.discovery_port),
            discovery_window: Duration::from_millis(self.discovery_window_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            health_interval_secs: self.health_interval,
            status_interval_secs: self.status_interval,
            work_dir: Some(PathBuf::from(&self.work_dir)),
        }
    }

    /// Upper bound for one control command: discovery windows and fan-outs included
    pub fn command_timeout(&self) -> Duration {
        let rpc = Duration::from_millis(self.probe_timeout_ms + self.rpc_timeout_ms);
        Duration::from_millis(self.discovery_window_ms) + rpc * 2
    }

    pub fn is_loopback_control(&self) -> bool {
        match self.control_listen.ip() {
            IpAddr::V4(ip) => ip == Ipv4Addr::LOCALHOST,
            IpAddr::V6(ip) => ip.is_loopback(),
        }
    }
}
