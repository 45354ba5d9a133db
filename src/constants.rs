// Shared protocol constants for discovery, control RPC and the service loop

use std::net::Ipv4Addr;

/// Multicast group data sources listen on for discovery probes
pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// UDP port data sources listen on for discovery probes
pub const DISCOVERY_PORT: u16 = 45000;

/// Service name carried in discovery probes
pub const DISCOVERY_SERVICE: &str = "body-tracking";

/// Default discovery collection window (ms)
pub const DISCOVERY_WINDOW_MS: u64 = 2000;

/// Multicast TTL for probes (stay on the local network)
pub const DISCOVERY_TTL: u32 = 1;

/// Largest discovery datagram we accept
pub const MAX_DATAGRAM: usize = 4096;

/// Default reachability probe timeout (ms)
pub const PROBE_TIMEOUT_MS: u64 = 500;

/// Default control RPC round-trip timeout (ms)
pub const RPC_TIMEOUT_MS: u64 = 5000;

/// Default control surface listen address
pub const CONTROL_LISTEN: &str = "127.0.0.1:9100";

/// Default interval between health re-probes (s)
pub const HEALTH_INTERVAL_SECS: i64 = 10;

/// Default interval between status log lines / status.json writes (s)
pub const STATUS_INTERVAL_SECS: i64 = 15;

/// Event bus capacity before slow subscribers start lagging
pub const EVENT_CAPACITY: usize = 256;

/// Settings file name inside the work directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Status snapshot file name inside the work directory
pub const STATUS_FILE: &str = "status.json";

/// Separator between per-node failures in an aggregated error
pub const ERROR_SEPARATOR: &str = "; ";
