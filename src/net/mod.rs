// Network layer module
// Line-delimited JSON over TCP, discovery datagrams, reachability probing

pub mod connection;
pub mod listener;
pub mod messages;
pub mod probe;
pub mod rpc;

pub use connection::Connection;
pub use listener::ControlServer;
pub use messages::{Command, CommandData, CommandOutcome, CommandResult, CommandType};
pub use probe::{Reachability, TcpProbe};
pub use rpc::{RpcTransport, TcpRpcTransport};
