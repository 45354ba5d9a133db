// Discovery service
// Multicast probe, collect announcements for a bounded window, upsert into the registry

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{DISCOVERY_SERVICE, DISCOVERY_TTL, MAX_DATAGRAM};
use crate::error::{Error, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::net::messages::{Announcement, DiscoveryMessage};
use crate::registry::{DataSourceRecord, Registry};

/// Whether a discovery window is open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    Idle,
    Discovering,
}

/// Summary of a completed window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    /// Distinct ids that answered, in order of first answer
    pub found: Vec<String>,
    /// Every valid announcement, duplicates included
    pub responses: usize,
}

/// UDP discovery of data sources
pub struct DiscoveryService {
    registry: Arc<Registry>,
    events: EventBus,
    /// Multicast group (or, for loopback setups, a unicast responder)
    target: SocketAddr,
    service: String,
    active: Mutex<Option<CancellationToken>>,
}

/// Per-window bookkeeping
struct Window {
    nonce: u32,
    seen: HashSet<String>,
    report: DiscoveryReport,
}

impl DiscoveryService {
    pub fn new(registry: Arc<Registry>, events: EventBus, target: SocketAddr) -> Self {
        DiscoveryService {
            registry,
            events,
            target,
            service: DISCOVERY_SERVICE.to_string(),
            active: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> DiscoveryPhase {
        if self.active.lock().is_some() {
            DiscoveryPhase::Discovering
        } else {
            DiscoveryPhase::Idle
        }
    }

    /// Run one window on a background task.
    ///
    /// The task yields `Ok(None)` when the window was cancelled by
    /// [`stop_discovery`](Self::stop_discovery).
    pub fn start_discovery(self: &Arc<Self>, window: Duration) -> Result<JoinHandle<Result<Option<DiscoveryReport>>>> {
        let token = self.claim()?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let result = this.run_window(window, &token).await;
            this.release();
            result
        }))
    }

    /// Run one window on the current task
    pub async fn discover(&self, window: Duration) -> Result<Option<DiscoveryReport>> {
        let token = self.claim()?;
        let result = self.run_window(window, &token).await;
        self.release();
        result
    }

    /// Cancel the open window, if any. Safe to call at any time.
    pub fn stop_discovery(&self) {
        if let Some(token) = self.active.lock().as_ref() {
            info!("Stopping discovery");
            token.cancel();
        }
    }

    fn claim(&self) -> Result<CancellationToken> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(Error::InvalidState {
                command: "StartDiscovery".to_string(),
                state: "Discovering".to_string(),
            });
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Ok(token)
    }

    fn release(&self) {
        self.active.lock().take();
    }

    async fn run_window(&self, window: Duration, token: &CancellationToken) -> Result<Option<DiscoveryReport>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        if let IpAddr::V4(group) = self.target.ip() {
            if group.is_multicast() {
                socket.set_multicast_ttl_v4(DISCOVERY_TTL)?;
                socket.set_multicast_loop_v4(true)?;
            }
        }

        let nonce: u32 = rand::thread_rng().gen();
        let probe = serde_json::to_vec(&DiscoveryMessage::Discover {
            service: self.service.clone(),
            nonce,
        })?;
        socket.send_to(&probe, self.target).await?;
        info!("Discovery probe sent to {} (window {:?})", self.target, window);

        let deadline = tokio::time::Instant::now() + window;
        let mut state = Window {
            nonce,
            seen: HashSet::new(),
            report: DiscoveryReport::default(),
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Discovery cancelled after {} responses", state.report.responses);
                    return Ok(None);
                }
                _ = tokio::time::sleep_until(deadline) => break,
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((size, peer)) => self.handle_datagram(&buf[..size], peer, &mut state),
                        Err(e) => {
                            // e.g. ICMP port unreachable surfacing on the socket; keep listening
                            warn!("Discovery receive error: {}", e);
                        }
                    }
                }
            }
        }

        info!(
            "Discovery completed: {} data sources ({} responses)",
            state.report.found.len(),
            state.report.responses
        );
        self.events.publish(ServiceEvent::DiscoveryCompleted {
            found: state.report.found.clone(),
        });
        Ok(Some(state.report))
    }

    fn handle_datagram(&self, data: &[u8], peer: SocketAddr, state: &mut Window) {
        let info = match serde_json::from_slice::<DiscoveryMessage>(data) {
            Ok(DiscoveryMessage::Announce { nonce, info }) if nonce == state.nonce => info,
            Ok(DiscoveryMessage::Announce { nonce, .. }) => {
                debug!("Ignoring stale announcement (nonce {}) from {}", nonce, peer);
                return;
            }
            Ok(DiscoveryMessage::Discover { .. }) => return,
            Err(e) => {
                debug!("Bad discovery datagram from {}: {}", peer, e);
                return;
            }
        };
        state.report.responses += 1;

        let now = Utc::now();
        if !state.seen.insert(info.id.to_lowercase()) {
            // Duplicate within this window: refresh only
            self.registry.touch(&info.id, now);
            return;
        }

        let record = record_from_announcement(info, peer, now);
        match self.registry.upsert(record.clone()) {
            Ok(outcome) => {
                debug!("Data source {} at {} ({:?})", record.id, peer, outcome);
                state.report.found.push(record.id.clone());
                let stored = self.registry.get(&record.id).unwrap_or(record);
                self.events.publish(ServiceEvent::DataSourceFound { record: stored });
            }
            Err(e) => warn!("Could not register data source {}: {}", record.id, e),
        }
    }
}

/// Blank endpoints fall back to the address the answer came from
fn record_from_announcement(info: Announcement, peer: SocketAddr, now: chrono::DateTime<Utc>) -> DataSourceRecord {
    let or_peer = |endpoint: String| {
        if endpoint.trim().is_empty() {
            peer.ip().to_string()
        } else {
            endpoint
        }
    };
    let mut record = DataSourceRecord::new(
        info.id,
        or_peer(info.control_api_endpoint),
        info.control_api_port,
        or_peer(info.data_streamer_endpoint),
        info.data_streamer_port,
    );
    record.first_seen = Some(now);
    record.last_seen = Some(now);
    record.is_reachable = true;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn announce(nonce: u32, id: &str) -> Vec<u8> {
        serde_json::to_vec(&DiscoveryMessage::Announce {
            nonce,
            info: Announcement {
                id: id.to_string(),
                control_api_endpoint: String::new(),
                control_api_port: 9000,
                data_streamer_endpoint: "127.0.0.1".to_string(),
                data_streamer_port: 9001,
            },
        })
        .unwrap()
    }

    /// Answers the first probe with the given ids (duplicates allowed) plus one stale answer
    async fn responder(ids: Vec<&'static str>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let nonce = match serde_json::from_slice::<DiscoveryMessage>(&buf[..n]).unwrap() {
                DiscoveryMessage::Discover { nonce, .. } => nonce,
                _ => panic!("Expected Discover"),
            };
            socket.send_to(&announce(nonce.wrapping_add(1), "stale"), peer).await.unwrap();
            for id in ids {
                socket.send_to(&announce(nonce, id), peer).await.unwrap();
            }
            // keep the socket open past the window
            tokio::time::sleep(Duration::from_secs(2)).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_duplicates_fire_found_once() {
        let target = responder(vec!["node-a", "NODE-A", "node-b", "node-a"]).await;
        let registry = Arc::new(Registry::new());
        let events = EventBus::new(32);
        let mut rx = events.subscribe();
        let discovery = DiscoveryService::new(registry.clone(), events, target);

        let report = discovery.discover(Duration::from_millis(300)).await.unwrap().unwrap();
        assert_eq!(report.found, vec!["node-a".to_string(), "node-b".to_string()]);
        assert_eq!(report.responses, 4);
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains("stale"));

        // blank control endpoint replaced by the responder address
        let a = registry.get("node-a").unwrap();
        assert_eq!(a.control_endpoint, "127.0.0.1");
        assert!(a.is_reachable);

        let mut found = 0;
        let mut completed = 0;
        loop {
            match rx.try_recv() {
                Ok(ServiceEvent::DataSourceFound { .. }) => found += 1,
                Ok(ServiceEvent::DiscoveryCompleted { .. }) => completed += 1,
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("{:?}", e),
            }
        }
        assert_eq!(found, 2);
        assert_eq!(completed, 1);
        assert_eq!(discovery.phase(), DiscoveryPhase::Idle);
    }

    #[tokio::test]
    async fn test_silent_window_completes_once() {
        // bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();
        let registry = Arc::new(Registry::new());
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let discovery = DiscoveryService::new(registry.clone(), events, target);

        let report = discovery.discover(Duration::from_millis(200)).await.unwrap().unwrap();
        assert!(report.found.is_empty());
        assert!(registry.is_empty());
        assert!(matches!(rx.try_recv(), Ok(ServiceEvent::DiscoveryCompleted { ref found }) if found.is_empty()));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        drop(silent);
    }

    #[tokio::test]
    async fn test_stop_discovery_drops_window() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let discovery = Arc::new(DiscoveryService::new(Arc::new(Registry::new()), events, target));

        let handle = discovery.start_discovery(Duration::from_secs(30)).unwrap();
        assert_eq!(discovery.phase(), DiscoveryPhase::Discovering);
        // a second window cannot open while one is running
        assert!(matches!(discovery.start_discovery(Duration::from_secs(1)), Err(Error::InvalidState { .. })));

        tokio::time::sleep(Duration::from_millis(50)).await;
        discovery.stop_discovery();
        discovery.stop_discovery();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
        assert!(outcome.is_none());
        assert_eq!(discovery.phase(), DiscoveryPhase::Idle);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        drop(silent);
    }
}
