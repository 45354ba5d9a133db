// Tracking service
// Owns the service state machine and routes control commands to the components

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::calibration::{out_of_sequence, CalibrationOrchestrator, CalibrationParameters, CalibrationStep};
use crate::command_processor::CommandExecutor;
use crate::constants::{
    DISCOVERY_GROUP, DISCOVERY_PORT, DISCOVERY_WINDOW_MS, HEALTH_INTERVAL_SECS, PROBE_TIMEOUT_MS,
    RPC_TIMEOUT_MS, STATUS_FILE, STATUS_INTERVAL_SECS,
};
use crate::control_client::DataSourceControlClient;
use crate::discovery::DiscoveryService;
use crate::error::{Error, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::net::messages::{Command, CommandData, CommandOutcome, CommandType};
use crate::net::probe::{Reachability, TcpProbe};
use crate::net::rpc::{RpcTransport, TcpRpcTransport};
use crate::reconfigure::{NetworkReconfigurator, ReconfigurationReport};
use crate::registry::{DataSourceRecord, Registry};
use crate::settings::{self, PersistedDataSource, SettingsStore, KEY_CALIBRATION, KEY_DATA_SOURCES, KEY_MASTER, KEY_SCENE};

/// Service-wide state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    Unknown,
    AutoDiscovery,
    Idle,
    Calibration,
    Running,
    Starting,
    Stopping,
    Error,
    DiagnosticMode,
    /// Only ever reported by [`TrackingService::visible_state`]; never a transition target
    Warning,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// Warning overlay sources
const WARN_HEALTH: &str = "health";
const WARN_TRACKING: &str = "tracking";
const WARN_RECONFIGURE: &str = "reconfiguration";
const WARN_FAULT: &str = "fault";

/// Tunables for one service instance
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Where discovery probes go (multicast group, or a unicast responder)
    pub discovery_target: SocketAddr,
    pub discovery_window: Duration,
    pub probe_timeout: Duration,
    pub rpc_timeout: Duration,
    /// Seconds between health re-probes, <= 0 disables
    pub health_interval_secs: i64,
    /// Seconds between status lines / status.json writes, <= 0 disables
    pub status_interval_secs: i64,
    /// Directory for status.json; None disables the snapshot
    pub work_dir: Option<PathBuf>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            discovery_target: SocketAddr::from((DISCOVERY_GROUP, DISCOVERY_PORT)),
            discovery_window: Duration::from_millis(DISCOVERY_WINDOW_MS),
            probe_timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            rpc_timeout: Duration::from_millis(RPC_TIMEOUT_MS),
            health_interval_secs: HEALTH_INTERVAL_SECS,
            status_interval_secs: STATUS_INTERVAL_SECS,
            work_dir: None,
        }
    }
}

/// Reply to ServiceStatus, also written to status.json
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub visible_state: ServiceState,
    pub warning: Option<String>,
    pub data_sources: Vec<DataSourceRecord>,
    pub calibration_step: Option<CalibrationStep>,
    pub updated_at: DateTime<Utc>,
}

struct StateCell {
    state: ServiceState,
    /// Active warnings by source
    warnings: BTreeMap<&'static str, String>,
}

impl StateCell {
    fn warning(&self) -> Option<String> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(self.warnings.values().cloned().collect::<Vec<_>>().join("; "))
        }
    }
}

/// The coordinating body-tracking service
pub struct TrackingService {
    options: ServiceOptions,
    registry: Arc<Registry>,
    events: EventBus,
    settings: Arc<dyn SettingsStore>,
    client: Arc<DataSourceControlClient>,
    discovery: Arc<DiscoveryService>,
    calibration: CalibrationOrchestrator,
    reconfigurator: NetworkReconfigurator,
    cell: Mutex<StateCell>,
    shutdown: CancellationToken,
}

impl TrackingService {
    /// Service talking to real nodes over TCP
    pub fn new(options: ServiceOptions, settings: Arc<dyn SettingsStore>) -> Self {
        Self::with_transport(options, settings, Arc::new(TcpProbe), Arc::new(TcpRpcTransport))
    }

    /// Service with injected reachability and RPC implementations
    pub fn with_transport(
        options: ServiceOptions,
        settings: Arc<dyn SettingsStore>,
        probe: Arc<dyn Reachability>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let events = EventBus::default();
        let client = Arc::new(DataSourceControlClient::new(
            probe,
            transport,
            options.probe_timeout,
            options.rpc_timeout,
        ));
        let discovery = Arc::new(DiscoveryService::new(
            Arc::clone(&registry),
            events.clone(),
            options.discovery_target,
        ));
        let calibration = CalibrationOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&client),
            Arc::clone(&settings),
            events.clone(),
        );
        let reconfigurator = NetworkReconfigurator::new(Arc::clone(&registry), Arc::clone(&client), events.clone());

        TrackingService {
            options,
            registry,
            events,
            settings,
            client,
            discovery,
            calibration,
            reconfigurator,
            cell: Mutex::new(StateCell {
                state: ServiceState::Unknown,
                warnings: BTreeMap::new(),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> ServiceState {
        self.cell.lock().state
    }

    pub fn warning(&self) -> Option<String> {
        self.cell.lock().warning()
    }

    /// State as a UI shows it: Idle or Running with an active warning reads as Warning
    pub fn visible_state(&self) -> ServiceState {
        let cell = self.cell.lock();
        match cell.state {
            ServiceState::Idle | ServiceState::Running if !cell.warnings.is_empty() => ServiceState::Warning,
            state => state,
        }
    }

    /// Load persisted data sources and enter Idle
    pub fn start(&self) -> Result<()> {
        let state = self.state();
        if state != ServiceState::Unknown {
            return Err(Error::InvalidState {
                command: "Start".to_string(),
                state: state.to_string(),
            });
        }
        if let Err(e) = self.load_settings() {
            self.fail(&format!("could not load settings: {}", e));
            return Err(e);
        }
        self.try_transition("Start", &[ServiceState::Unknown], ServiceState::Idle)?;
        info!("Tracking service ready with {} known data sources", self.registry.len());
        Ok(())
    }

    /// Explicit recovery from Error. A calibration cut short by the fault is discarded.
    pub async fn restart(&self) -> Result<()> {
        let state = self.state();
        if state != ServiceState::Error {
            return Err(Error::InvalidState {
                command: "Restart".to_string(),
                state: state.to_string(),
            });
        }
        if self.calibration.complete().await {
            info!("Discarded calibration session interrupted by the fault");
        }
        self.try_transition("Restart", &[ServiceState::Error], ServiceState::Idle)?;
        self.set_warning(WARN_FAULT, None);
        info!("Tracking service restarted");
        Ok(())
    }

    /// Unrecoverable fault: enter Error until restart
    pub fn fail(&self, reason: &str) {
        error!("Tracking service fault: {}", reason);
        self.set_warning(WARN_FAULT, Some(reason.to_string()));
        self.set_state(ServiceState::Error);
    }

    /// Stop discovery and the background loop
    pub fn shutdown(&self) {
        info!("Tracking service shutting down");
        self.discovery.stop_discovery();
        self.shutdown.cancel();
    }

    pub async fn status(&self) -> ServiceStatus {
        let calibration_step = self.calibration.current_step().await;
        let (state, warning) = {
            let cell = self.cell.lock();
            (cell.state, cell.warning())
        };
        ServiceStatus {
            state,
            visible_state: self.visible_state(),
            warning,
            data_sources: self.registry.all().to_vec(),
            calibration_step,
            updated_at: Utc::now(),
        }
    }

    /// Background health probes and status snapshots until `token` or shutdown()
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let every = |secs: i64| (secs > 0).then(|| Duration::from_secs(secs as u64));
        let health_every = every(self.options.health_interval_secs);
        let status_every = every(self.options.status_interval_secs);
        let mut next_health = health_every.map(|d| tokio::time::Instant::now() + d);
        let mut next_status = status_every.map(|d| tokio::time::Instant::now() + d);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = tokio::time::Instant::now();
                    if let (Some(next), Some(period)) = (next_health.as_mut(), health_every) {
                        if now >= *next {
                            *next += period;
                            self.check_health().await;
                        }
                    }
                    if let (Some(next), Some(period)) = (next_status.as_mut(), status_every) {
                        if now >= *next {
                            *next += period;
                            self.log_status();
                            self.write_status().await;
                        }
                    }
                }
            }
        }
        debug!("Service loop stopped");
    }

    /// Re-probe every known data source, flag flips, maintain the health warning
    pub async fn check_health(&self) {
        let mut probes = JoinSet::new();
        for record in self.registry.all().iter().cloned() {
            let client = Arc::clone(&self.client);
            probes.spawn(async move {
                let reachable = match record.control_addr().await {
                    Ok(addr) => client.is_reachable(addr).await,
                    Err(_) => false,
                };
                (record.id, reachable)
            });
        }

        let now = Utc::now();
        let mut unreachable = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (id, reachable) = match joined {
                Ok(r) => r,
                Err(e) => {
                    warn!("Health probe task failed: {}", e);
                    continue;
                }
            };
            if !reachable {
                unreachable.push(id.clone());
            }
            match self.registry.mark_reachable(&id, reachable, now) {
                Some(previous) if previous != reachable => {
                    info!("Data source {} is now {}", id, if reachable { "reachable" } else { "unreachable" });
                    self.events.publish(ServiceEvent::DataSourceStatusChanged { id, reachable });
                }
                _ => {}
            }
        }

        unreachable.sort();
        let warning = match unreachable.len() {
            0 => None,
            1 => Some(format!("data source {} unreachable", unreachable[0])),
            _ => Some(format!("data sources {} unreachable", unreachable.join(", "))),
        };
        self.set_warning(WARN_HEALTH, warning);
    }

    fn log_status(&self) {
        let records = self.registry.all();
        let reachable = records.iter().filter(|r| r.is_reachable).count();
        let master = records.iter().find(|r| r.is_master).map(|r| r.id.as_str()).unwrap_or("-");
        info!(
            "Status: {} ({} data sources, {} reachable, master {}){}",
            self.state(),
            records.len(),
            reachable,
            master,
            self.warning().map(|w| format!(" warning: {}", w)).unwrap_or_default()
        );
    }

    async fn write_status(&self) {
        let Some(dir) = self.options.work_dir.as_ref() else {
            return;
        };
        let path = dir.join(STATUS_FILE);
        let status = self.status().await;
        match serde_json::to_vec_pretty(&status) {
            Ok(bytes) => {
                if let Err(e) = settings::write_atomic(&path, &bytes) {
                    warn!("Could not write {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Could not encode status: {}", e),
        }
    }

    // ---- state cell ----

    /// Atomically move to `to` if the current state is one of `allowed`
    fn try_transition(&self, command: &str, allowed: &[ServiceState], to: ServiceState) -> Result<ServiceState> {
        let from = {
            let mut cell = self.cell.lock();
            if !allowed.contains(&cell.state) {
                return Err(Error::InvalidState {
                    command: command.to_string(),
                    state: cell.state.to_string(),
                });
            }
            std::mem::replace(&mut cell.state, to)
        };
        self.state_changed(from, to);
        Ok(from)
    }

    fn ensure_state(&self, command: CommandType, allowed: &[ServiceState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                command: command.to_string(),
                state: state.to_string(),
            })
        }
    }

    /// Finish an operation: `from` -> `to`, unless a fault took the state elsewhere meanwhile
    fn settle(&self, command: CommandType, from: ServiceState, to: ServiceState) -> Result<()> {
        self.try_transition(&command.to_string(), &[from], to).map(|_| ()).map_err(|e| {
            warn!("{} finished after the state moved on: {}", command, e);
            e
        })
    }

    fn set_state(&self, to: ServiceState) {
        let from = std::mem::replace(&mut self.cell.lock().state, to);
        self.state_changed(from, to);
    }

    fn state_changed(&self, from: ServiceState, to: ServiceState) {
        if from != to {
            info!("State {} -> {}", from, to);
            self.events.publish(ServiceEvent::StateChanged { from, to });
        }
    }

    fn set_warning(&self, source: &'static str, warning: Option<String>) {
        let (before, after) = {
            let mut cell = self.cell.lock();
            let before = cell.warning();
            match warning {
                Some(w) => cell.warnings.insert(source, w),
                None => cell.warnings.remove(source),
            };
            (before, cell.warning())
        };
        if before != after {
            match &after {
                Some(w) => warn!("Warning: {}", w),
                None => info!("Warning cleared"),
            }
            self.events.publish(ServiceEvent::WarningChanged { warning: after });
        }
    }

    // ---- settings ----

    fn load_settings(&self) -> Result<()> {
        let store = self.settings.as_ref();
        let persisted: Vec<PersistedDataSource> = settings::get_typed(store, KEY_DATA_SOURCES)?.unwrap_or_default();
        for entry in persisted {
            self.registry.upsert(entry.into())?;
        }
        if let Some(master) = settings::get_typed::<String>(store, KEY_MASTER)? {
            if let Err(e) = self.registry.set_master(&master) {
                warn!("Persisted master ignored: {}", e);
            }
        }
        Ok(())
    }

    fn save_data_sources(&self) -> Result<()> {
        let store = self.settings.as_ref();
        let records = self.registry.all();
        let persisted: Vec<PersistedDataSource> = records.iter().map(PersistedDataSource::from).collect();
        settings::set_typed(store, KEY_DATA_SOURCES, &persisted)?;
        match records.iter().find(|r| r.is_master) {
            Some(master) => settings::set_typed(store, KEY_MASTER, &master.id)?,
            None => store.remove(KEY_MASTER),
        }
        store.flush()
    }

    // ---- operations ----

    /// Ask known nodes to announce themselves, then run one discovery window
    pub async fn enable_auto_discovery(&self) -> Result<serde_json::Value> {
        self.try_transition("EnableAutoDiscovery", &[ServiceState::Idle], ServiceState::AutoDiscovery)?;

        if !self.registry.is_empty() {
            let report = self
                .reconfigurator
                .broadcast(CommandType::EnableAutoDiscovery, CommandData::new())
                .await;
            if let Some(e) = report.error {
                debug!("Some known data sources did not enable discovery: {}", e);
            }
        }

        let outcome = self.discovery.discover(self.options.discovery_window).await;
        self.settle(CommandType::EnableAutoDiscovery, ServiceState::AutoDiscovery, ServiceState::Idle)?;

        let found = match outcome? {
            Some(report) => report.found,
            None => Vec::new(),
        };
        if let Err(e) = self.save_data_sources() {
            warn!("Could not persist discovered data sources: {}", e);
        }
        Ok(serde_json::json!({ "found": found, "known": self.registry.len() }))
    }

    pub async fn start_tracking(&self, config: CommandData) -> Result<serde_json::Value> {
        self.try_transition("StartTracking", &[ServiceState::Idle], ServiceState::Starting)?;
        if self.registry.is_empty() {
            self.settle(CommandType::StartTracking, ServiceState::Starting, ServiceState::Idle)?;
            return Err(Error::UnknownSource("no data sources known".to_string()));
        }

        let mut data = config;
        if let Some(master) = self.registry.master() {
            data.entry("masterDataSource".to_string()).or_insert_with(|| master.id.into());
        }
        if let Some(calibration) = self.settings.get(KEY_CALIBRATION) {
            data.entry("calibration".to_string()).or_insert(calibration);
        }

        let report = self.reconfigurator.broadcast(CommandType::StartTracking, data).await;
        if report.all_failed() {
            let error = report.error.clone().unwrap_or_default();
            self.set_warning(WARN_TRACKING, Some(format!("tracking failed to start: {}", error)));
            self.settle(CommandType::StartTracking, ServiceState::Starting, ServiceState::Idle)?;
            return Err(Error::Aggregated(error));
        }

        self.set_warning(
            WARN_TRACKING,
            report.error.as_ref().map(|e| format!("tracking started with failures: {}", e)),
        );
        self.settle(CommandType::StartTracking, ServiceState::Starting, ServiceState::Running)?;
        report_value(&report)
    }

    pub async fn stop_tracking(&self) -> Result<serde_json::Value> {
        self.try_transition("StopTracking", &[ServiceState::Running], ServiceState::Stopping)?;
        let report = self.reconfigurator.broadcast(CommandType::StopTracking, CommandData::new()).await;
        self.set_warning(
            WARN_TRACKING,
            report.error.as_ref().map(|e| format!("tracking stopped with failures: {}", e)),
        );
        self.settle(CommandType::StopTracking, ServiceState::Stopping, ServiceState::Idle)?;
        report_value(&report)
    }

    pub async fn start_diagnostic_mode(&self) -> Result<serde_json::Value> {
        let from = self.try_transition(
            "StartDiagnosticMode",
            &[ServiceState::Idle, ServiceState::Running],
            ServiceState::DiagnosticMode,
        )?;
        if from == ServiceState::Running {
            let report = self.reconfigurator.broadcast(CommandType::StopTracking, CommandData::new()).await;
            if let Some(e) = report.error {
                warn!("Not every data source stopped tracking: {}", e);
            }
            self.set_warning(WARN_TRACKING, None);
        }

        let mut queries = JoinSet::new();
        for record in self.registry.all().iter().cloned() {
            let client = Arc::clone(&self.client);
            queries.spawn(async move {
                let outcome = match record.control_addr().await {
                    Ok(addr) => client.get_status(addr).await,
                    Err(e) => Err(e),
                };
                (record.id, outcome)
            });
        }

        let mut report = serde_json::Map::new();
        while let Some(joined) = queries.join_next().await {
            let Ok((id, outcome)) = joined else {
                continue;
            };
            let entry = match outcome {
                Ok(status) => serde_json::json!({ "reachable": true, "status": status }),
                Err(e) => serde_json::json!({ "reachable": !e.is_expected_absence(), "error": e.to_string() }),
            };
            report.insert(id, entry);
        }
        Ok(serde_json::json!({ "dataSources": report }))
    }

    pub fn stop_diagnostic_mode(&self) -> Result<serde_json::Value> {
        self.try_transition("StopDiagnosticMode", &[ServiceState::DiagnosticMode], ServiceState::Idle)?;
        Ok(serde_json::Value::Null)
    }

    /// Start enters Calibration from Idle once the session is open; other steps need Calibration
    pub async fn execute_calibration_step(&self, params: CalibrationParameters) -> Result<serde_json::Value> {
        if params.step == CalibrationStep::Start {
            if self.state() == ServiceState::Calibration {
                let current = self.calibration.current_step().await;
                return Err(out_of_sequence(params.step, current.and_then(CalibrationStep::next)));
            }
            self.ensure_state(CommandType::ExecuteCalibrationStep, &[ServiceState::Idle])?;

            // Validation happens before any state change
            let reply = self.calibration.execute_step(params).await?;
            if let Err(e) =
                self.try_transition("ExecuteCalibrationStep", &[ServiceState::Idle], ServiceState::Calibration)
            {
                self.calibration.complete().await;
                return Err(e);
            }
            return Ok(reply);
        }

        if self.state() != ServiceState::Calibration {
            return Err(Error::InvalidSequence {
                requested: params.step.to_string(),
                expected: CalibrationStep::Start.to_string(),
            });
        }
        self.calibration.execute_step(params).await
    }

    pub async fn complete_calibration(&self) -> Result<serde_json::Value> {
        match self.state() {
            ServiceState::Calibration => {
                self.settle(CommandType::CompleteCalibration, ServiceState::Calibration, ServiceState::Idle)?;
                self.calibration.complete().await;
                Ok(serde_json::json!({ "completed": true }))
            }
            // Nothing running; a leftover session, if any, is dropped
            ServiceState::Idle => {
                let dropped = self.calibration.complete().await;
                Ok(serde_json::json!({ "completed": dropped }))
            }
            state => Err(Error::InvalidState {
                command: CommandType::CompleteCalibration.to_string(),
                state: state.to_string(),
            }),
        }
    }

    pub async fn set_master_data_source(&self, id: &str) -> Result<serde_json::Value> {
        self.ensure_state(CommandType::SetMasterDataSource, &[ServiceState::Idle])?;
        self.registry.set_master(id)?;
        self.save_data_sources()?;
        info!("Master data source is now {}", id);

        let mut data = CommandData::new();
        data.insert("masterDataSource".to_string(), id.into());
        self.reconfigure(CommandType::ApplyConfiguration, data).await
    }

    pub async fn set_scene_descriptor(&self, descriptor: serde_json::Value) -> Result<serde_json::Value> {
        self.ensure_state(CommandType::SetSceneDescriptor, &[ServiceState::Idle])?;
        self.settings.set(KEY_SCENE, descriptor.clone());
        self.settings.flush()?;

        let mut data = CommandData::new();
        data.insert("sceneDescriptor".to_string(), descriptor);
        self.reconfigure(CommandType::ApplyConfiguration, data).await
    }

    pub async fn system_reboot(&self) -> Result<serde_json::Value> {
        self.ensure_state(CommandType::SystemReboot, &[ServiceState::Idle])?;
        self.reconfigure(CommandType::SystemReboot, CommandData::new()).await
    }

    pub fn forget_data_sources(&self) -> Result<serde_json::Value> {
        self.ensure_state(CommandType::ForgetDataSources, &[ServiceState::Idle])?;
        let forgotten = self.registry.len();
        self.registry.clear();
        self.settings.remove(KEY_DATA_SOURCES);
        self.settings.remove(KEY_MASTER);
        self.settings.flush()?;
        self.set_warning(WARN_HEALTH, None);
        info!("Forgot {} data sources", forgotten);
        Ok(serde_json::json!({ "forgotten": forgotten }))
    }

    /// Fan out to every node; partial failure becomes a warning, not an error
    async fn reconfigure(&self, command_type: CommandType, data: CommandData) -> Result<serde_json::Value> {
        let report = self.reconfigurator.broadcast(command_type, data).await;
        self.set_warning(
            WARN_RECONFIGURE,
            report.error.as_ref().map(|e| format!("{} incomplete: {}", command_type, e)),
        );
        report_value(&report)
    }
}

fn report_value(report: &ReconfigurationReport) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(report)?)
}

#[async_trait]
impl CommandExecutor for TrackingService {
    async fn execute(&self, command: &Command) -> CommandOutcome {
        // Error accepts nothing but status queries until restart()
        if self.state() == ServiceState::Error && command.command_type != CommandType::ServiceStatus {
            return Err(Error::InvalidState {
                command: command.command_type.to_string(),
                state: ServiceState::Error.to_string(),
            });
        }

        match command.command_type {
            CommandType::ServiceStatus => Ok(serde_json::to_value(self.status().await)?),
            CommandType::EnableAutoDiscovery => self.enable_auto_discovery().await,
            CommandType::StartTracking => self.start_tracking(command.data.clone()).await,
            CommandType::StopTracking => self.stop_tracking().await,
            CommandType::ExecuteCalibrationStep => {
                let params = CalibrationParameters::from_command(command)?;
                self.execute_calibration_step(params).await
            }
            CommandType::CompleteCalibration => self.complete_calibration().await,
            CommandType::SetMasterDataSource => {
                let id: String = command.get("id")?;
                self.set_master_data_source(&id).await
            }
            CommandType::StartDiagnosticMode => self.start_diagnostic_mode().await,
            CommandType::StopDiagnosticMode => self.stop_diagnostic_mode(),
            CommandType::SystemReboot => self.system_reboot().await,
            CommandType::SetSceneDescriptor => {
                let descriptor: serde_json::Value = command.get("descriptor")?;
                self.set_scene_descriptor(descriptor).await
            }
            CommandType::ForgetDataSources => self.forget_data_sources(),
            CommandType::StartCalibration | CommandType::StopCalibration | CommandType::ApplyConfiguration => {
                Err(Error::InvalidParameter(format!(
                    "{} is addressed to data sources, not the tracking service",
                    command.command_type
                )))
            }
        }
    }
}
