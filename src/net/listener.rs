// TCP listener for the tracking-service control surface
// Each connection sends Commands and gets CommandResults back, in order

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::messages::{Command, CommandOutcome, CommandResult};
use crate::command_processor::CommandProcessor;
use crate::error::Error;

/// Control server feeding the command processor
pub struct ControlServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ControlServer {
    /// Bind `addr` and start accepting control connections
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to
    /// * `processor` - Queue every received command is submitted to
    /// * `result_timeout` - How long a connection waits for one result
    pub async fn start(
        addr: SocketAddr,
        processor: Arc<CommandProcessor>,
        result_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let processor = Arc::clone(&processor);
                                tokio::spawn(async move {
                                    let connection = Connection::new(stream, peer_addr);
                                    if let Err(e) = serve(connection, processor, result_timeout).await {
                                        debug!("Control client {} disconnected: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => warn!("Accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        });

        info!("Control surface listening on {} (TCP)", local_addr);
        Ok(ControlServer {
            addr: local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the address the server is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

/// Read commands until EOF; malformed lines get an error result and close the connection
async fn serve(mut connection: Connection, processor: Arc<CommandProcessor>, result_timeout: Duration) -> io::Result<()> {
    let peer = connection.peer_addr();
    loop {
        let command = match connection.read_json::<Command>().await {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("Malformed command from {}: {}", peer, e);
                let reply: CommandResult<CommandOutcome> =
                    CommandResult::new(String::new(), Err(Error::Protocol(e.to_string())));
                connection.write_json(&reply).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        debug!("{} from {} ({})", command.command_type, peer, command.request_id);
        let result = processor.submit(command, result_timeout).await;
        connection.write_json(&result).await?;
    }
}
