// Reachability probe
// Bounded TCP connect against a node's control endpoint

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Classified result of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Connected (and closed again)
    Reachable,
    /// Timed out or refused: the node simply is not there
    Absent,
    /// Some other socket failure worth logging
    Anomaly(String),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable)
    }
}

/// Sort a connect error into expected absence vs anomaly
pub fn classify(err: &io::Error) -> ProbeOutcome {
    match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut => ProbeOutcome::Absent,
        _ => ProbeOutcome::Anomaly(err.to_string()),
    }
}

/// Anything that can tell whether a control endpoint is listening
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Detailed outcome of a single attempt bounded by `timeout`
    async fn probe_detailed(&self, addr: SocketAddr, timeout: Duration) -> ProbeOutcome;

    /// True if the endpoint accepted a connection. Anomalies are logged here
    /// and reported as false; absence is silent.
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool {
        match self.probe_detailed(addr, timeout).await {
            ProbeOutcome::Reachable => true,
            ProbeOutcome::Absent => false,
            ProbeOutcome::Anomaly(reason) => {
                warn!("Probe of {} failed unexpectedly: {}", addr, reason);
                false
            }
        }
    }
}

/// Probe using a plain TCP connect
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl Reachability for TcpProbe {
    async fn probe_detailed(&self, addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                ProbeOutcome::Reachable
            }
            Ok(Err(e)) => {
                let outcome = classify(&e);
                if outcome == ProbeOutcome::Absent {
                    debug!("Probe of {}: {}", addr, e);
                }
                outcome
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", addr, timeout);
                ProbeOutcome::Absent
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    #[test]
    fn test_classify() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify(&refused), ProbeOutcome::Absent);
        assert_eq!(classify(&timed_out), ProbeOutcome::Absent);
        assert!(matches!(classify(&other), ProbeOutcome::Anomaly(_)));
    }

    #[tokio::test]
    async fn test_probe_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(TcpProbe.probe(addr, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_false_and_bounded() {
        // Grab a free port, then close it
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let reachable = TcpProbe.probe(addr, timeout).await;
        assert!(!reachable);
        assert!(start.elapsed() < timeout + Duration::from_millis(500));
    }
}
