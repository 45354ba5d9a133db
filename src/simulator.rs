// Simulated data source
// In-process sensor node: answers discovery probes over UDP and control commands over TCP

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::MAX_DATAGRAM;
use crate::error::Error;
use crate::net::connection::Connection;
use crate::net::messages::{Announcement, Command, CommandOutcome, CommandResult, CommandType, DiscoveryMessage};
use crate::registry::DataSourceRecord;

/// Behaviour switches and observations shared with the node's tasks
struct NodeState {
    id: String,
    control_addr: SocketAddr,
    data_port: u16,
    tracking: AtomicBool,
    answer_discovery: AtomicBool,
    failures: Mutex<HashMap<CommandType, String>>,
    silenced: Mutex<HashSet<CommandType>>,
    received: Mutex<Vec<Command>>,
    matrices: Mutex<Vec<[f64; 16]>>,
    measured_height: Mutex<Option<f64>>,
}

/// A fake data-source node bound to local sockets
pub struct SimulatedDataSource {
    state: Arc<NodeState>,
    discovery_addr: SocketAddr,
    token: CancellationToken,
}

const IDENTITY: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

impl SimulatedDataSource {
    /// Node on loopback with ephemeral control and discovery ports
    pub async fn spawn(id: &str) -> io::Result<Self> {
        Self::bind(id, (Ipv4Addr::LOCALHOST, 0).into(), (Ipv4Addr::LOCALHOST, 0).into()).await
    }

    /// Node with explicit sockets. A multicast `discovery` address is joined
    /// as a group on all interfaces.
    pub async fn bind(id: &str, control: SocketAddr, discovery: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(control).await?;
        let control_addr = listener.local_addr()?;

        let socket = match discovery.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery.port())).await?;
                socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
                socket
            }
            _ => UdpSocket::bind(discovery).await?,
        };
        let discovery_addr = socket.local_addr()?;

        let state = Arc::new(NodeState {
            id: id.to_string(),
            control_addr,
            data_port: control_addr.port().wrapping_add(1),
            tracking: AtomicBool::new(false),
            answer_discovery: AtomicBool::new(true),
            failures: Mutex::new(HashMap::new()),
            silenced: Mutex::new(HashSet::new()),
            received: Mutex::new(Vec::new()),
            matrices: Mutex::new(vec![IDENTITY]),
            measured_height: Mutex::new(None),
        });
        let token = CancellationToken::new();

        tokio::spawn(answer_discovery(socket, Arc::clone(&state), token.clone()));
        tokio::spawn(serve_control(listener, Arc::clone(&state), token.clone()));
        info!("Simulated data source {} on {} (discovery {})", id, control_addr, discovery_addr);

        Ok(SimulatedDataSource { state, discovery_addr, token })
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.state.control_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    /// Registry record pointing at this node
    pub fn record(&self) -> DataSourceRecord {
        let ip = self.state.control_addr.ip().to_string();
        DataSourceRecord::new(self.id(), ip.clone(), self.state.control_addr.port(), ip, self.state.data_port)
    }

    pub fn is_tracking(&self) -> bool {
        self.state.tracking.load(Ordering::SeqCst)
    }

    /// Answer `command_type` with a remote failure
    pub fn fail_on(&self, command_type: CommandType, reason: &str) {
        self.state.failures.lock().insert(command_type, reason.to_string());
    }

    /// Read `command_type` but never answer it
    pub fn silence(&self, command_type: CommandType) {
        self.state.silenced.lock().insert(command_type);
    }

    pub fn answer_discovery(&self, answer: bool) {
        self.state.answer_discovery.store(answer, Ordering::SeqCst);
    }

    /// Matrices returned by StopCalibration, oldest first
    pub fn set_matrices(&self, matrices: Vec<[f64; 16]>) {
        *self.state.matrices.lock() = matrices;
    }

    pub fn set_measured_height(&self, height: Option<f64>) {
        *self.state.measured_height.lock() = height;
    }

    /// Command types received so far, in order
    pub fn received(&self) -> Vec<CommandType> {
        self.state.received.lock().iter().map(|c| c.command_type).collect()
    }

    pub fn last_command(&self, command_type: CommandType) -> Option<Command> {
        self.state.received.lock().iter().rev().find(|c| c.command_type == command_type).cloned()
    }

    /// Close both sockets
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for SimulatedDataSource {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn answer_discovery(socket: UdpSocket, state: Arc<NodeState>, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (size, peer) = tokio::select! {
            _ = token.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(r) => r,
                Err(e) => {
                    debug!("{} discovery receive error: {}", state.id, e);
                    continue;
                }
            },
        };

        let nonce = match serde_json::from_slice::<DiscoveryMessage>(&buf[..size]) {
            Ok(DiscoveryMessage::Discover { nonce, .. }) => nonce,
            _ => continue,
        };
        if !state.answer_discovery.load(Ordering::SeqCst) {
            continue;
        }

        let reply = DiscoveryMessage::Announce {
            nonce,
            info: Announcement {
                id: state.id.clone(),
                control_api_endpoint: state.control_addr.ip().to_string(),
                control_api_port: state.control_addr.port(),
                data_streamer_endpoint: state.control_addr.ip().to_string(),
                data_streamer_port: state.data_port,
            },
        };
        match serde_json::to_vec(&reply) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, peer).await {
                    warn!("{} could not answer discovery from {}: {}", state.id, peer, e);
                }
            }
            Err(e) => warn!("{} could not encode announcement: {}", state.id, e),
        }
    }
}

async fn serve_control(listener: TcpListener, state: Arc<NodeState>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    let token = token.clone();
                    tokio::spawn(async move {
                        let conn = Connection::new(stream, peer);
                        tokio::select! {
                            _ = token.cancelled() => {}
                            res = handle_connection(conn, &state) => {
                                if let Err(e) = res {
                                    debug!("{} control connection from {} ended: {}", state.id, peer, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!("{} accept error: {}", state.id, e),
            },
        }
    }
}

/// Reachability probes connect and hang up; those end here with Ok
async fn handle_connection(mut conn: Connection, state: &NodeState) -> io::Result<()> {
    while let Some(command) = conn.read_json::<Command>().await? {
        state.received.lock().push(command.clone());
        let silenced = state.silenced.lock().contains(&command.command_type);
        if silenced {
            continue;
        }
        let outcome = execute(&command, state);
        conn.write_json(&CommandResult::new(command.request_id, outcome)).await?;
    }
    Ok(())
}

fn execute(command: &Command, state: &NodeState) -> CommandOutcome {
    if let Some(reason) = state.failures.lock().get(&command.command_type) {
        return Err(Error::Remote(reason.clone()));
    }

    let tracking = &state.tracking;
    match command.command_type {
        CommandType::StartTracking => tracking.store(true, Ordering::SeqCst),
        CommandType::StopTracking | CommandType::SystemReboot => tracking.store(false, Ordering::SeqCst),
        CommandType::StopCalibration => {
            let matrices = state.matrices.lock().clone();
            let mut reply = serde_json::json!({ "matrices": matrices });
            if let Some(height) = *state.measured_height.lock() {
                reply["measuredUserHeight"] = height.into();
            }
            return Ok(reply);
        }
        _ => {}
    }

    Ok(serde_json::json!({
        "id": state.id,
        "tracking": tracking.load(Ordering::SeqCst),
    }))
}
