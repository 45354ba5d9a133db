// Control RPC transport
// One Command out, the CommandResult with the same request id back

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::debug;

use super::connection::Connection;
use super::messages::{Command, CommandOutcome, CommandResult};
use crate::error::{Error, Result};

/// Request/response transport to a data source's control API
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send `command` to `addr` and wait for its correlated result.
    /// Timeouts are the caller's concern.
    async fn call(&self, addr: SocketAddr, command: Command) -> Result<CommandResult<CommandOutcome>>;
}

/// Line-delimited JSON over a fresh TCP connection per call
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpRpcTransport;

#[async_trait]
impl RpcTransport for TcpRpcTransport {
    async fn call(&self, addr: SocketAddr, command: Command) -> Result<CommandResult<CommandOutcome>> {
        let mut conn = Connection::connect(addr).await?;
        conn.write_json(&command).await?;

        loop {
            let result: CommandResult<CommandOutcome> = match conn.read_json().await {
                Ok(Some(r)) => r,
                Ok(None) => {
                    return Err(Error::Transport(format!(
                        "{} closed the connection before answering {}",
                        addr, command.request_id
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(Error::Protocol(format!("bad reply from {}: {}", addr, e)))
                }
                Err(e) => return Err(e.into()),
            };

            if result.request_id == command.request_id {
                return Ok(result);
            }
            debug!(
                "Skipping reply {} from {} while waiting for {}",
                result.request_id, addr, command.request_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::messages::CommandType;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_call_skips_uncorrelated_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);
            let cmd: Command = conn.read_json().await.unwrap().unwrap();
            let stale: CommandResult<CommandOutcome> = CommandResult::new("someone-else", Ok(serde_json::Value::Null));
            conn.write_json(&stale).await.unwrap();
            let reply: CommandResult<CommandOutcome> =
                CommandResult::new(cmd.request_id, Ok(serde_json::json!({ "tracking": false })));
            conn.write_json(&reply).await.unwrap();
        });

        let cmd = Command::new(CommandType::ServiceStatus);
        let id = cmd.request_id.clone();
        let result = TcpRpcTransport.call(addr, cmd).await.unwrap();
        assert_eq!(result.request_id, id);
        assert_eq!(result.data.unwrap()["tracking"], false);
    }

    #[tokio::test]
    async fn test_call_reports_early_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);
            let _cmd: Option<Command> = conn.read_json().await.unwrap();
            // drop without answering
        });

        let err = TcpRpcTransport.call(addr, Command::new(CommandType::StopTracking)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
