// Network reconfigurator
// Fan a command out to every known data source, fan the acknowledgments back in

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::constants::ERROR_SEPARATOR;
use crate::control_client::DataSourceControlClient;
use crate::error::Error;
use crate::events::{EventBus, ServiceEvent};
use crate::net::messages::{Command, CommandData, CommandType};
use crate::registry::Registry;

/// Completion callback: (aggregated error or None, node ids in completion order)
pub type OnComplete = Box<dyn FnOnce(Option<String>, Vec<String>) + Send>;

struct Progress {
    completed: usize,
    names: Vec<String>,
    errors: Option<String>,
    on_complete: Option<OnComplete>,
}

/// Fan-in barrier for one reconfiguration round.
///
/// `on_complete` runs exactly once, after exactly `total_targets` calls to
/// [`record_completion`](Self::record_completion), whatever their order or
/// thread. There is no timeout: a target that never reports holds the barrier.
pub struct ReconfigurationOperation {
    total_targets: usize,
    progress: Mutex<Progress>,
}

impl ReconfigurationOperation {
    /// Open a barrier for `total_targets` acknowledgments. With zero targets
    /// the callback runs immediately.
    pub fn begin(total_targets: usize, on_complete: OnComplete) -> Arc<Self> {
        let op = Arc::new(ReconfigurationOperation {
            total_targets,
            progress: Mutex::new(Progress {
                completed: 0,
                names: Vec::with_capacity(total_targets),
                errors: None,
                on_complete: Some(on_complete),
            }),
        });
        if total_targets == 0 {
            let callback = op.progress.lock().on_complete.take();
            if let Some(callback) = callback {
                callback(None, Vec::new());
            }
        }
        op
    }

    /// Record one target's acknowledgment (success when `error` is None)
    pub fn record_completion(&self, node_id: &str, error: Option<&str>) {
        let mut progress = self.progress.lock();
        if progress.completed >= self.total_targets {
            warn!("Extra completion from {} ignored ({} of {} already in)", node_id, progress.completed, self.total_targets);
            return;
        }

        progress.names.push(node_id.to_string());
        progress.completed += 1;
        if let Some(error) = error {
            let entry = format!("{}: {}", node_id, error);
            match progress.errors.as_mut() {
                Some(acc) => {
                    acc.push_str(ERROR_SEPARATOR);
                    acc.push_str(&entry);
                }
                None => progress.errors = Some(entry),
            }
        }

        if progress.completed == self.total_targets {
            if let Some(callback) = progress.on_complete.take() {
                let errors = progress.errors.clone();
                let names = progress.names.clone();
                callback(errors, names);
            }
        }
    }

    pub fn total_targets(&self) -> usize {
        self.total_targets
    }

    pub fn completed_count(&self) -> usize {
        self.progress.lock().completed
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.total_targets
    }
}

/// Outcome of a full fan-out round
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconfigurationReport {
    pub total_targets: usize,
    /// Node ids in completion order
    pub completed: Vec<String>,
    /// Ids that acknowledged successfully
    pub succeeded: Vec<String>,
    /// Aggregated per-node failures
    pub error: Option<String>,
}

impl ReconfigurationReport {
    pub fn all_failed(&self) -> bool {
        self.total_targets > 0 && self.succeeded.is_empty()
    }

    /// Aggregated error, if anything failed
    pub fn into_result(self) -> Result<Self, Error> {
        match &self.error {
            Some(e) if self.all_failed() => Err(Error::Aggregated(e.clone())),
            _ => Ok(self),
        }
    }
}

/// Broadcasts a command to every registered data source
pub struct NetworkReconfigurator {
    registry: Arc<Registry>,
    client: Arc<DataSourceControlClient>,
    events: EventBus,
}

impl NetworkReconfigurator {
    pub fn new(registry: Arc<Registry>, client: Arc<DataSourceControlClient>, events: EventBus) -> Self {
        NetworkReconfigurator { registry, client, events }
    }

    /// Send `command_type` with `data` to every known node concurrently and
    /// wait until each one has acknowledged or failed.
    pub async fn broadcast(&self, command_type: CommandType, data: CommandData) -> ReconfigurationReport {
        let targets = self.registry.all();
        let label = command_type.to_string();
        info!("Reconfiguring {} data sources: {}", targets.len(), label);

        let (done_tx, done_rx) = oneshot::channel();
        let op = ReconfigurationOperation::begin(
            targets.len(),
            Box::new(move |error, names| {
                let _ = done_tx.send((error, names));
            }),
        );

        let succeeded = Arc::new(Mutex::new(Vec::new()));
        for record in targets.iter().cloned() {
            let op = Arc::clone(&op);
            let client = Arc::clone(&self.client);
            let succeeded = Arc::clone(&succeeded);
            let mut command = Command::new(command_type);
            command.data = data.clone();
            let kind = command_type;
            tokio::spawn(async move {
                let outcome = match record.control_addr().await {
                    Ok(addr) => client.send(addr, command).await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(_) => {
                        succeeded.lock().push(record.id.clone());
                        op.record_completion(&record.id, None);
                    }
                    Err(e) => {
                        debug!("{} on {} failed: {}", kind, record.id, e);
                        op.record_completion(&record.id, Some(&e.to_string()));
                    }
                }
            });
        }

        // Every send is bounded by the probe and RPC timeouts, so all targets report
        let (error, completed) = done_rx.await.unwrap_or_else(|_| {
            (Some("reconfiguration aborted before completion".to_string()), Vec::new())
        });
        let succeeded = succeeded.lock().clone();

        match &error {
            Some(e) => warn!("{} finished with failures: {}", label, e),
            None => info!("{} acknowledged by all {} data sources", label, completed.len()),
        }
        self.events.publish(ServiceEvent::ReconfigurationCompleted {
            label,
            completed: completed.clone(),
            error: error.clone(),
        });

        ReconfigurationReport {
            total_targets: targets.len(),
            completed,
            succeeded,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Captured = Arc<Mutex<Vec<(Option<String>, Vec<String>)>>>;

    fn capture() -> (Captured, OnComplete) {
        let calls: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        (calls, Box::new(move |e, names| sink.lock().push((e, names))))
    }

    #[test]
    fn test_three_nodes_one_failure() {
        let (calls, cb) = capture();
        let op = ReconfigurationOperation::begin(3, cb);

        op.record_completion("B", None);
        op.record_completion("A", Some("disk full"));
        assert!(calls.lock().is_empty());
        op.record_completion("C", None);

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        let (error, names) = &calls[0];
        assert!(error.as_deref().unwrap().contains("A: disk full"));
        assert_eq!(names, &vec!["B".to_string(), "A".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_all_success_reports_none() {
        let (calls, cb) = capture();
        let op = ReconfigurationOperation::begin(2, cb);
        op.record_completion("x", None);
        op.record_completion("y", None);
        assert!(op.is_complete());
        assert_eq!(calls.lock()[0].0, None);
    }

    #[test]
    fn test_errors_concatenate() {
        let (calls, cb) = capture();
        let op = ReconfigurationOperation::begin(2, cb);
        op.record_completion("x", Some("refused"));
        op.record_completion("y", Some("timeout"));
        assert_eq!(calls.lock()[0].0.as_deref(), Some("x: refused; y: timeout"));
    }

    #[test]
    fn test_zero_targets_completes_immediately() {
        let (calls, cb) = capture();
        let op = ReconfigurationOperation::begin(0, cb);
        assert!(op.is_complete());
        assert_eq!(calls.lock().len(), 1);
        op.record_completion("late", None);
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(op.completed_count(), 0);
    }

    #[test]
    fn test_every_order_fires_once_after_last() {
        // all permutations of four ids
        fn permutations(items: Vec<&'static str>) -> Vec<Vec<&'static str>> {
            if items.len() <= 1 {
                return vec![items];
            }
            let mut out = Vec::new();
            for i in 0..items.len() {
                let mut rest = items.clone();
                let head = rest.remove(i);
                for mut tail in permutations(rest) {
                    tail.insert(0, head);
                    out.push(tail);
                }
            }
            out
        }

        let orders = permutations(vec!["a", "b", "c", "d"]);
        assert_eq!(orders.len(), 24);
        for order in orders {
            let fired = Arc::new(AtomicUsize::new(0));
            let f = Arc::clone(&fired);
            let op = ReconfigurationOperation::begin(4, Box::new(move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            }));
            for (i, id) in order.iter().enumerate() {
                assert_eq!(fired.load(Ordering::SeqCst), 0, "fired early at {}", i);
                op.record_completion(id, None);
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            op.record_completion("extra", None);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_concurrent_completions_fire_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let op = ReconfigurationOperation::begin(64, Box::new(move |_, names| {
            assert_eq!(names.len(), 64);
            f.fetch_add(1, Ordering::SeqCst);
        }));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let op = Arc::clone(&op);
                std::thread::spawn(move || op.record_completion(&format!("n{}", i), None))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(op.completed_count(), 64);
    }

    #[test]
    fn test_report_result() {
        let partial = ReconfigurationReport {
            total_targets: 2,
            completed: vec!["a".into(), "b".into()],
            succeeded: vec!["a".into()],
            error: Some("b: refused".into()),
        };
        assert!(partial.clone().into_result().is_ok());

        let total = ReconfigurationReport { succeeded: vec![], ..partial };
        assert_eq!(total.into_result().unwrap_err(), Error::Aggregated("b: refused".into()));
    }
    #[tokio::test]
    async fn test_broadcast_reports_each_node() {
        use crate::net::probe::TcpProbe;
        use crate::net::rpc::TcpRpcTransport;
        use crate::simulator::SimulatedDataSource;
        use std::time::Duration;

        let good = SimulatedDataSource::spawn("good").await.unwrap();
        let bad = SimulatedDataSource::spawn("bad").await.unwrap();
        bad.fail_on(CommandType::SystemReboot, "busy");

        let registry = Arc::new(Registry::new());
        registry.upsert(good.record()).unwrap();
        registry.upsert(bad.record()).unwrap();
        let client = Arc::new(DataSourceControlClient::new(
            Arc::new(TcpProbe),
            Arc::new(TcpRpcTransport),
            Duration::from_millis(500),
            Duration::from_secs(1),
        ));
        let events = EventBus::new(16);
        let mut rx = events.subscribe();

        let reconfigurator = NetworkReconfigurator::new(registry, client, events);
        let report = reconfigurator.broadcast(CommandType::SystemReboot, CommandData::new()).await;

        assert_eq!(report.total_targets, 2);
        assert_eq!(report.completed.len(), 2);
        assert_eq!(report.succeeded, vec!["good".to_string()]);
        assert!(report.error.as_deref().unwrap().contains("bad: "));
        assert!(report.error.as_deref().unwrap().contains("busy"));
        assert!(matches!(rx.recv().await.unwrap(), ServiceEvent::ReconfigurationCompleted { .. }));
    }
}

