// Calibration orchestrator
// Linear multi-step protocol aligning every data source to the master's frame

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nalgebra::{Matrix4, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::control_client::DataSourceControlClient;
use crate::error::{Error, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::net::messages::{Command, CommandData};
use crate::registry::Registry;
use crate::settings::{self, SettingsStore, KEY_CALIBRATION};

/// Calibration protocol steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CalibrationStep {
    Start,
    StartCalibrateDataSourceWithMaster,
    StopCalibrateDataSourceWithMaster,
    StartCalibrateMaster,
    StopCalibrateMaster,
    End,
}

impl CalibrationStep {
    /// The only step allowed after this one
    pub fn next(self) -> Option<CalibrationStep> {
        use CalibrationStep::*;
        match self {
            Start => Some(StartCalibrateDataSourceWithMaster),
            StartCalibrateDataSourceWithMaster => Some(StopCalibrateDataSourceWithMaster),
            StopCalibrateDataSourceWithMaster => Some(StartCalibrateMaster),
            StartCalibrateMaster => Some(StopCalibrateMaster),
            StopCalibrateMaster => Some(End),
            End => None,
        }
    }
}

impl fmt::Display for CalibrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Parameters of one ExecuteCalibrationStep command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationParameters {
    pub step: CalibrationStep,
    /// Slave data source
    #[serde(default)]
    pub data_source1_id: Option<String>,
    /// Master data source (defaults to the registry master)
    #[serde(default)]
    pub data_source2_id: Option<String>,
    /// Metres
    #[serde(default)]
    pub calibrating_user_height: Option<f64>,
    /// Degrees
    #[serde(default)]
    pub additional_master_y_rotation: Option<f64>,
    #[serde(default)]
    pub use_centroids: Option<bool>,
    #[serde(default)]
    pub last_but_nth_valid_matrix: Option<usize>,
}

impl CalibrationParameters {
    pub fn new(step: CalibrationStep) -> Self {
        CalibrationParameters {
            step,
            data_source1_id: None,
            data_source2_id: None,
            calibrating_user_height: None,
            additional_master_y_rotation: None,
            use_centroids: None,
            last_but_nth_valid_matrix: None,
        }
    }

    pub fn from_command(command: &Command) -> Result<Self> {
        let data = serde_json::Value::Object(command.data.clone().into_iter().collect());
        serde_json::from_value(data).map_err(|e| Error::InvalidParameter(format!("calibration parameters: {}", e)))
    }

    /// Values present in `later` replace the current ones
    fn merge(&mut self, later: &CalibrationParameters) {
        self.step = later.step;
        if later.calibrating_user_height.is_some() {
            self.calibrating_user_height = later.calibrating_user_height;
        }
        if later.additional_master_y_rotation.is_some() {
            self.additional_master_y_rotation = later.additional_master_y_rotation;
        }
        if later.use_centroids.is_some() {
            self.use_centroids = later.use_centroids;
        }
        if later.last_but_nth_valid_matrix.is_some() {
            self.last_but_nth_valid_matrix = later.last_but_nth_valid_matrix;
        }
    }

    fn lag(&self) -> usize {
        self.last_but_nth_valid_matrix.unwrap_or(0)
    }
}

/// Committed result of a calibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationData {
    pub master_id: String,
    /// Row-major 4x4 transform per data source id
    pub transforms: BTreeMap<String, [f64; 16]>,
    pub calibrated_at: DateTime<Utc>,
}

/// The single in-progress calibration
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    last_completed: CalibrationStep,
    slave_id: String,
    master_id: String,
    params: CalibrationParameters,
    slave_to_master: Option<Matrix4<f64>>,
    master_transform: Option<Matrix4<f64>>,
}

impl CalibrationSession {
    pub fn last_completed(&self) -> CalibrationStep {
        self.last_completed
    }

    pub fn is_complete(&self) -> bool {
        self.last_completed == CalibrationStep::End
    }

    pub fn slave_id(&self) -> &str {
        &self.slave_id
    }

    pub fn master_id(&self) -> &str {
        &self.master_id
    }
}

/// Drives a calibration session one step per call
pub struct CalibrationOrchestrator {
    registry: Arc<Registry>,
    client: Arc<DataSourceControlClient>,
    settings: Arc<dyn SettingsStore>,
    events: EventBus,
    session: Mutex<Option<CalibrationSession>>,
}

impl CalibrationOrchestrator {
    pub fn new(
        registry: Arc<Registry>,
        client: Arc<DataSourceControlClient>,
        settings: Arc<dyn SettingsStore>,
        events: EventBus,
    ) -> Self {
        CalibrationOrchestrator {
            registry,
            client,
            settings,
            events,
            session: Mutex::new(None),
        }
    }

    /// Last step that completed in the current session
    pub async fn current_step(&self) -> Option<CalibrationStep> {
        self.session.lock().await.as_ref().map(|s| s.last_completed)
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Run one step. On failure the session is left exactly as it was.
    pub async fn execute_step(&self, params: CalibrationParameters) -> Result<serde_json::Value> {
        let mut guard = self.session.lock().await;
        let step = params.step;

        if step == CalibrationStep::Start {
            if let Some(session) = guard.as_ref().filter(|s| !s.is_complete()) {
                return Err(out_of_sequence(step, session.last_completed.next()));
            }
            let session = self.begin(params).await?;
            info!("Calibration started: {} against master {}", session.slave_id, session.master_id);
            *guard = Some(session);
        } else {
            let session = guard.as_mut().ok_or_else(|| out_of_sequence(step, Some(CalibrationStep::Start)))?;
            let expected = session.last_completed.next();
            if expected != Some(step) {
                return Err(out_of_sequence(step, expected));
            }

            // Work on a copy so a failed step leaves nothing behind
            let mut next = session.clone();
            next.params.merge(&params);
            self.run_step(&mut next).await?;
            next.last_completed = step;
            *session = next;
            info!("Calibration step {} completed", step);
        }

        self.events.publish(ServiceEvent::CalibrationStepCompleted { step });
        let next = step.next();
        Ok(serde_json::json!({ "step": step, "nextStep": next }))
    }

    /// Close the session. Returns false when there was none.
    pub async fn complete(&self) -> bool {
        match self.session.lock().await.take() {
            Some(session) if !session.is_complete() => {
                warn!("Calibration abandoned after {}", session.last_completed);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    async fn begin(&self, params: CalibrationParameters) -> Result<CalibrationSession> {
        let slave_id = params
            .data_source1_id
            .clone()
            .ok_or_else(|| Error::InvalidParameter("Start requires 'dataSource1Id'".to_string()))?;
        let master_id = match &params.data_source2_id {
            Some(id) => id.clone(),
            None => self
                .registry
                .master()
                .map(|r| r.id)
                .ok_or_else(|| Error::UnknownSource("no master data source configured".to_string()))?,
        };

        let slave = self.registry.get(&slave_id).ok_or_else(|| Error::UnknownSource(slave_id.clone()))?;
        let master = self.registry.get(&master_id).ok_or_else(|| Error::UnknownSource(master_id.clone()))?;
        if slave.id.eq_ignore_ascii_case(&master.id) {
            return Err(Error::InvalidParameter(format!("{} cannot calibrate against itself", slave.id)));
        }
        for record in [&slave, &master] {
            if !self.client.is_reachable(record.control_addr().await?).await {
                return Err(Error::UnknownSource(format!("{} is not reachable", record.id)));
            }
        }

        Ok(CalibrationSession {
            last_completed: CalibrationStep::Start,
            slave_id: slave.id,
            master_id: master.id,
            params,
            slave_to_master: None,
            master_transform: None,
        })
    }

    async fn run_step(&self, session: &mut CalibrationSession) -> Result<()> {
        match session.params.step {
            CalibrationStep::Start => Ok(()),
            CalibrationStep::StartCalibrateDataSourceWithMaster => {
                let addr = self.addr_of(&session.slave_id).await?;
                let mut data = sampling_options(&session.params, "slave");
                data.insert("masterId".into(), session.master_id.clone().into());
                self.client.start_calibration(addr, data).await?;
                Ok(())
            }
            CalibrationStep::StopCalibrateDataSourceWithMaster => {
                let addr = self.addr_of(&session.slave_id).await?;
                let mut data = sampling_options(&session.params, "slave");
                data.insert("masterId".into(), session.master_id.clone().into());
                let reply = self.client.stop_calibration(addr, data).await?;
                let transform = pick_matrix(&reply, session.params.lag())?;
                debug!("{} to master transform: {:?}", session.slave_id, to_row_major(&transform));
                session.slave_to_master = Some(transform);
                Ok(())
            }
            CalibrationStep::StartCalibrateMaster => {
                let addr = self.addr_of(&session.master_id).await?;
                self.client.start_calibration(addr, sampling_options(&session.params, "master")).await?;
                Ok(())
            }
            CalibrationStep::StopCalibrateMaster => {
                let addr = self.addr_of(&session.master_id).await?;
                let reply = self.client.stop_calibration(addr, sampling_options(&session.params, "master")).await?;
                // Frame lag aligns two sources in time; leveling uses the newest sample
                let leveling = pick_matrix(&reply, 0)?;
                let measured = reply.get("measuredUserHeight").and_then(|v| v.as_f64());
                session.master_transform = Some(master_transform(
                    &leveling,
                    session.params.additional_master_y_rotation.unwrap_or(0.0),
                    session.params.calibrating_user_height,
                    measured,
                ));
                Ok(())
            }
            CalibrationStep::End => {
                let data = commit(session)?;
                settings::set_typed(self.settings.as_ref(), KEY_CALIBRATION, &data)?;
                self.settings.flush()?;
                info!("Calibration committed for {} data sources", data.transforms.len());
                Ok(())
            }
        }
    }

    async fn addr_of(&self, id: &str) -> Result<SocketAddr> {
        let record = self.registry.get(id).ok_or_else(|| Error::UnknownSource(id.to_string()))?;
        record.control_addr().await
    }
}

pub(crate) fn out_of_sequence(requested: CalibrationStep, expected: Option<CalibrationStep>) -> Error {
    Error::InvalidSequence {
        requested: requested.to_string(),
        expected: expected.map(|s| s.to_string()).unwrap_or_else(|| "CompleteCalibration".to_string()),
    }
}

fn sampling_options(params: &CalibrationParameters, role: &str) -> CommandData {
    let mut data = CommandData::new();
    data.insert("role".into(), role.into());
    data.insert("useCentroids".into(), params.use_centroids.unwrap_or(false).into());
    if role == "slave" {
        data.insert("lastButNthValidMatrix".into(), params.lag().into());
    }
    data
}

/// Select the `lag`-th matrix from the end of the reply's `matrices`
fn pick_matrix(reply: &serde_json::Value, lag: usize) -> Result<Matrix4<f64>> {
    let matrices: Vec<Vec<f64>> = reply
        .get("matrices")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::Protocol(format!("calibration matrices: {}", e)))?
        .unwrap_or_default();

    if lag >= matrices.len() {
        return Err(Error::Remote(format!(
            "{} valid matrices, cannot take last but {}",
            matrices.len(),
            lag
        )));
    }
    let values = &matrices[matrices.len() - 1 - lag];
    if values.len() != 16 || values.iter().any(|v| !v.is_finite()) {
        return Err(Error::Protocol(format!("expected 16 finite numbers, got {}", values.len())));
    }
    Ok(Matrix4::from_row_slice(values))
}

/// R_y(rotation) * leveling, with the floor height corrected by the user's known height
fn master_transform(
    leveling: &Matrix4<f64>,
    y_rotation_deg: f64,
    user_height: Option<f64>,
    measured_height: Option<f64>,
) -> Matrix4<f64> {
    let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), y_rotation_deg.to_radians()).to_homogeneous();
    let mut transform = rotation * leveling;
    if let (Some(expected), Some(measured)) = (user_height, measured_height) {
        transform[(1, 3)] += expected - measured;
    }
    transform
}

fn commit(session: &CalibrationSession) -> Result<CalibrationData> {
    let master = session
        .master_transform
        .ok_or_else(|| Error::InvalidParameter("master transform missing".to_string()))?;
    let slave_to_master = session
        .slave_to_master
        .ok_or_else(|| Error::InvalidParameter("data source transform missing".to_string()))?;

    let mut transforms = BTreeMap::new();
    transforms.insert(session.master_id.clone(), to_row_major(&master));
    transforms.insert(session.slave_id.clone(), to_row_major(&(master * slave_to_master)));
    Ok(CalibrationData {
        master_id: session.master_id.clone(),
        transforms,
        calibrated_at: Utc::now(),
    })
}

pub fn to_row_major(m: &Matrix4<f64>) -> [f64; 16] {
    let mut out = [0.0; 16];
    for row in 0..4 {
        for col in 0..4 {
            out[row * 4 + col] = m[(row, col)];
        }
    }
    out
}
