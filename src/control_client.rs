// Data-source control client
// Reachability pre-check, then one correlated RPC bounded by a timeout

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::net::messages::{Command, CommandData, CommandType};
use crate::net::probe::Reachability;
use crate::net::rpc::RpcTransport;

/// Issues remote commands to individual data sources
pub struct DataSourceControlClient {
    probe: Arc<dyn Reachability>,
    transport: Arc<dyn RpcTransport>,
    probe_timeout: Duration,
    rpc_timeout: Duration,
}

impl DataSourceControlClient {
    pub fn new(
        probe: Arc<dyn Reachability>,
        transport: Arc<dyn RpcTransport>,
        probe_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        DataSourceControlClient {
            probe,
            transport,
            probe_timeout,
            rpc_timeout,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Bare reachability check
    pub async fn is_reachable(&self, addr: SocketAddr) -> bool {
        self.probe.probe(addr, self.probe_timeout).await
    }

    /// Probe, then send `command` and wait for its result.
    ///
    /// An absent node fails with `Unreachable` without any RPC attempt.
    /// Transport failures and timeouts are logged here and returned.
    pub async fn send(&self, addr: SocketAddr, command: Command) -> Result<serde_json::Value> {
        if !self.probe.probe(addr, self.probe_timeout).await {
            debug!("{} skipped: {} unreachable", command.command_type, addr);
            return Err(Error::Unreachable(addr.to_string()));
        }

        let command_type = command.command_type;
        let request_id = command.request_id.clone();
        match tokio::time::timeout(self.rpc_timeout, self.transport.call(addr, command)).await {
            Err(_) => {
                warn!("{} to {} timed out ({})", command_type, addr, request_id);
                Err(Error::Timeout(self.rpc_timeout.as_millis() as u64))
            }
            Ok(Err(e)) => {
                warn!("{} to {} failed: {}", command_type, addr, e);
                Err(e)
            }
            Ok(Ok(result)) => result.data.map_err(|e| match e {
                Error::Remote(_) => e,
                other => Error::Remote(other.to_string()),
            }),
        }
    }

    async fn send_type(&self, addr: SocketAddr, command_type: CommandType, data: CommandData) -> Result<serde_json::Value> {
        let mut command = Command::new(command_type);
        command.data = data;
        self.send(addr, command).await
    }

    pub async fn enable_auto_discovery(&self, addr: SocketAddr) -> Result<serde_json::Value> {
        self.send_type(addr, CommandType::EnableAutoDiscovery, CommandData::new()).await
    }

    pub async fn start_tracking(&self, config: CommandData, addr: SocketAddr) -> Result<serde_json::Value> {
        self.send_type(addr, CommandType::StartTracking, config).await
    }

    pub async fn stop_tracking(&self, addr: SocketAddr) -> Result<serde_json::Value> {
        self.send_type(addr, CommandType::StopTracking, CommandData::new()).await
    }

    pub async fn get_status(&self, addr: SocketAddr) -> Result<serde_json::Value> {
        self.send_type(addr, CommandType::ServiceStatus, CommandData::new()).await
    }

    pub async fn start_calibration(&self, addr: SocketAddr, params: CommandData) -> Result<serde_json::Value> {
        self.send_type(addr, CommandType::StartCalibration, params).await
    }

    pub async fn stop_calibration(&self, addr: SocketAddr, params: CommandData) -> Result<serde_json::Value> {
        self.send_type(addr, CommandType::StopCalibration, params).await
    }
}
