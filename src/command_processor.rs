// Command processor
// Single worker draining a FIFO of locally submitted commands

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::net::messages::{Command, CommandOutcome, CommandResult};

/// Executes one command against the service state
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &Command) -> CommandOutcome;
}

/// Worker handles, present while the processor is running
struct Worker {
    tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared with the worker task
#[derive(Default)]
struct Shared {
    /// Queued or executing request ids
    outstanding: Mutex<HashSet<String>>,
    /// Produced and not yet consumed
    results: Mutex<HashMap<String, CommandResult<CommandOutcome>>>,
    /// Still executing but already answered with a timeout; their results are discarded
    abandoned: Mutex<HashSet<String>>,
    produced: Notify,
}

/// FIFO command queue with exactly-once result delivery.
///
/// Commands execute one at a time in submission order. Each produces one
/// `CommandResult`, handed out once by [`take_result`](Self::take_result).
pub struct CommandProcessor {
    executor: Arc<dyn CommandExecutor>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl CommandProcessor {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        CommandProcessor {
            executor,
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Spawn the worker. No-op when already running.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let token = CancellationToken::new();
        let executor = Arc::clone(&self.executor);
        let shared = Arc::clone(&self.shared);
        let cancel = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(command) => command,
                        None => break,
                    },
                };

                debug!("Executing {} ({})", command.command_type, command.request_id);
                let outcome = executor.execute(&command).await;
                if let Err(e) = &outcome {
                    debug!("{} failed: {}", command.command_type, e);
                }

                let result = CommandResult::new(command.request_id.clone(), outcome);
                {
                    let mut outstanding = shared.outstanding.lock();
                    outstanding.remove(&command.request_id);
                    if shared.abandoned.lock().remove(&command.request_id) {
                        debug!("Discarding late result for {}", command.request_id);
                    } else {
                        shared.results.lock().insert(command.request_id.clone(), result);
                    }
                }
                shared.produced.notify_waiters();
            }

            // Whatever is still queued is dropped without a result
            rx.close();
            let mut dropped = 0;
            while let Ok(command) = rx.try_recv() {
                shared.outstanding.lock().remove(&command.request_id);
                shared.abandoned.lock().remove(&command.request_id);
                dropped += 1;
            }
            if dropped > 0 {
                info!("Command processor stopped, {} pending commands dropped", dropped);
            }
            shared.produced.notify_waiters();
        });

        info!("Command processor started");
        *worker = Some(Worker { tx, token, handle });
    }

    /// Stop accepting work. The command in flight finishes; queued ones are dropped.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.token.cancel();
            drop(worker.tx);
            if let Err(e) = worker.handle.await {
                warn!("Command worker ended abnormally: {}", e);
            }
        }
    }

    /// Append a command to the queue; returns its request id
    pub fn enqueue_command(&self, command: Command) -> Result<String> {
        let worker = self.worker.lock();
        let worker = worker.as_ref().ok_or(Error::Stopped)?;

        let request_id = command.request_id.clone();
        {
            let mut outstanding = self.shared.outstanding.lock();
            if outstanding.contains(&request_id) || self.shared.results.lock().contains_key(&request_id) {
                return Err(Error::InvalidParameter(format!("request {} is already outstanding", request_id)));
            }
            outstanding.insert(request_id.clone());
        }

        if worker.tx.send(command).is_err() {
            self.shared.outstanding.lock().remove(&request_id);
            return Err(Error::Stopped);
        }
        Ok(request_id)
    }

    /// Consume the result for `request_id`. Returns it (marked read) once, then None.
    pub fn take_result(&self, request_id: &str) -> Option<CommandResult<CommandOutcome>> {
        let mut result = self.shared.results.lock().remove(request_id)?;
        result.read = true;
        Some(result)
    }

    /// Wait up to `timeout` for the result of `request_id` and consume it.
    ///
    /// A timeout counts as the delivery: the result produced afterwards is
    /// discarded and never handed out.
    pub async fn wait_result(&self, request_id: &str, timeout: Duration) -> Result<CommandResult<CommandOutcome>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a result produced in between is not missed
            let produced = self.shared.produced.notified();

            if let Some(result) = self.take_result(request_id) {
                return Ok(result);
            }
            if !self.shared.outstanding.lock().contains(request_id) {
                // Either produced just now, or never queued / consumed / dropped by stop()
                return self.take_result(request_id).ok_or(Error::Stopped);
            }

            if tokio::time::timeout_at(deadline, produced).await.is_err() {
                return self.abandon(request_id, timeout);
            }
        }
    }

    fn abandon(&self, request_id: &str, timeout: Duration) -> Result<CommandResult<CommandOutcome>> {
        let outstanding = self.shared.outstanding.lock();
        if outstanding.contains(request_id) {
            self.shared.abandoned.lock().insert(request_id.to_string());
            return Err(Error::Timeout(timeout.as_millis() as u64));
        }
        drop(outstanding);
        // Landed right at the deadline
        self.take_result(request_id).ok_or(Error::Timeout(timeout.as_millis() as u64))
    }

    /// Enqueue and wait; always yields a result envelope for the command
    pub async fn submit(&self, command: Command, timeout: Duration) -> CommandResult<CommandOutcome> {
        let request_id = command.request_id.clone();
        match self.enqueue_command(command) {
            Ok(_) => match self.wait_result(&request_id, timeout).await {
                Ok(result) => result,
                Err(e) => CommandResult::new(request_id, Err(e)),
            },
            Err(e) => CommandResult::new(request_id, Err(e)),
        }
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::messages::CommandType;
    use tokio::sync::Semaphore;

    /// Records execution order; optionally waits for a permit before each command
    struct Recorder {
        order: Mutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl CommandExecutor for Recorder {
        async fn execute(&self, command: &Command) -> CommandOutcome {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let label: String = command.get("label").unwrap_or_default();
            self.order.lock().push(label.clone());
            if label == "bad" {
                return Err(Error::InvalidState { command: "StartTracking".into(), state: "Running".into() });
            }
            Ok(serde_json::json!({ "label": label }))
        }
    }

    fn recorder(gate: Option<Arc<Semaphore>>) -> Arc<Recorder> {
        Arc::new(Recorder { order: Mutex::new(Vec::new()), gate })
    }

    fn labelled(label: &str) -> Command {
        Command::new(CommandType::ServiceStatus).with("label", label)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let exec = recorder(None);
        let processor = CommandProcessor::new(exec.clone());
        processor.start();

        let ids: Vec<String> = (0..10)
            .map(|i| processor.enqueue_command(labelled(&i.to_string())).unwrap())
            .collect();
        for id in &ids {
            processor.wait_result(id, Duration::from_secs(2)).await.unwrap();
        }

        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(*exec.order.lock(), expected);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_result_delivered_exactly_once() {
        let processor = CommandProcessor::new(recorder(None));
        processor.start();

        let cmd = labelled("a");
        let id = cmd.request_id.clone();
        let result = processor.submit(cmd, Duration::from_secs(2)).await;
        assert_eq!(result.request_id, id);
        assert!(result.read);
        assert_eq!(result.data.unwrap()["label"], "a");

        assert!(processor.take_result(&id).is_none());
        assert_eq!(processor.wait_result(&id, Duration::from_millis(50)).await.unwrap_err(), Error::Stopped);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_failure_still_yields_result() {
        let processor = CommandProcessor::new(recorder(None));
        processor.start();
        let result = processor.submit(labelled("bad"), Duration::from_secs(2)).await;
        assert!(matches!(result.data, Err(Error::InvalidState { .. })));
        // the queue keeps going
        let next = processor.submit(labelled("ok"), Duration::from_secs(2)).await;
        assert!(next.data.is_ok());
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = CommandProcessor::new(recorder(Some(gate.clone())));
        processor.start();

        let cmd = labelled("a");
        processor.enqueue_command(cmd.clone()).unwrap();
        assert!(matches!(processor.enqueue_command(cmd.clone()), Err(Error::InvalidParameter(_))));

        gate.add_permits(1);
        processor.wait_result(&cmd.request_id, Duration::from_secs(2)).await.unwrap();
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drops_pending() {
        let gate = Arc::new(Semaphore::new(0));
        let exec = recorder(Some(gate.clone()));
        let processor = Arc::new(CommandProcessor::new(exec.clone()));
        processor.start();

        let first = processor.enqueue_command(labelled("first")).unwrap();
        let second = processor.enqueue_command(labelled("second")).unwrap();
        // let the worker pick up the first command
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopper = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.add_permits(2);
        stopper.await.unwrap();

        // in-flight command finished, queued one never ran
        assert_eq!(*exec.order.lock(), vec!["first".to_string()]);
        assert!(processor.take_result(&first).is_some());
        assert!(processor.take_result(&second).is_none());
        assert_eq!(processor.wait_result(&second, Duration::from_millis(50)).await.unwrap_err(), Error::Stopped);
        assert!(matches!(processor.enqueue_command(labelled("late")), Err(Error::Stopped)));
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = CommandProcessor::new(recorder(Some(gate)));
        processor.start();
        let id = processor.enqueue_command(labelled("slow")).unwrap();
        let err = processor.wait_result(&id, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, Error::Timeout(50));
    }

    #[tokio::test]
    async fn test_late_result_after_timeout_is_discarded() {
        let gate = Arc::new(Semaphore::new(0));
        let exec = recorder(Some(gate.clone()));
        let processor = CommandProcessor::new(exec.clone());
        processor.start();

        let cmd = labelled("slow");
        let id = cmd.request_id.clone();
        let first = processor.submit(cmd, Duration::from_millis(50)).await;
        assert_eq!(first.data.unwrap_err(), Error::Timeout(50));

        // let the executor finish, then make sure the queue still moves
        gate.add_permits(2);
        let next = processor.submit(labelled("next"), Duration::from_secs(2)).await;
        assert!(next.data.is_ok());
        assert_eq!(*exec.order.lock(), vec!["slow".to_string(), "next".to_string()]);

        assert!(processor.take_result(&id).is_none());
        assert!(processor.shared.results.lock().is_empty());
        assert!(processor.shared.abandoned.lock().is_empty());
        processor.stop().await;
    }
}
