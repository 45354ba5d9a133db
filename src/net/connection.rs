// TCP connection handler
// Line-delimited JSON framing shared by the control surface and node RPC

use std::io;
use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

/// A single TCP connection carrying one JSON document per line
pub struct Connection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Create a new connection from a TCP stream
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        Connection {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            peer_addr,
        }
    }

    /// Connect to a remote endpoint
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, addr))
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read the next non-blank line and decode it. `Ok(None)` on EOF.
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        }
    }

    /// Write a serializable value as one JSON line
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        let json_str = serde_json::to_string(value)?;
        self.writer.write_all(json_str.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_json_lines_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);
            let value: serde_json::Value = conn.read_json().await.unwrap().unwrap();
            conn.write_json(&serde_json::json!({ "echo": value })).await.unwrap();
        });

        let mut client = Connection::connect(addr).await.unwrap();
        assert_eq!(client.peer_addr(), addr);
        client.write_json(&serde_json::json!({ "n": 1 })).await.unwrap();
        let reply: serde_json::Value = client.read_json().await.unwrap().unwrap();
        assert_eq!(reply["echo"]["n"], 1);

        server.await.unwrap();
        // server dropped its end
        let eof: Option<serde_json::Value> = client.read_json().await.unwrap();
        assert!(eof.is_none());
    }
}
