// Service notifications
// Broadcast fan-out to any number of subscribers; publishing never blocks

use serde::Serialize;
use tokio::sync::broadcast;

use crate::calibration::CalibrationStep;
use crate::registry::DataSourceRecord;
use crate::service::ServiceState;

/// Notifications raised by the tracking service and its components
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServiceEvent {
    StateChanged {
        from: ServiceState,
        to: ServiceState,
    },
    WarningChanged {
        warning: Option<String>,
    },
    DataSourceFound {
        record: DataSourceRecord,
    },
    /// Raised once per discovery window that ran to completion
    DiscoveryCompleted {
        found: Vec<String>,
    },
    DataSourceStatusChanged {
        id: String,
        reachable: bool,
    },
    CalibrationStepCompleted {
        step: CalibrationStep,
    },
    ReconfigurationCompleted {
        label: String,
        completed: Vec<String>,
        error: Option<String>,
    },
}

/// Cloneable handle to the notification channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; no subscribers is not an error
    pub fn publish(&self, event: ServiceEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::constants::EVENT_CAPACITY)
    }
}
