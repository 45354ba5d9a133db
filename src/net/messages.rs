// JSON message type definitions
// Discovery datagrams and the Command / CommandResult envelope

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Discovery datagrams (UDP, one JSON object per datagram)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryMessage {
    /// Probe broadcast by the tracking service
    Discover {
        service: String,
        nonce: u32,
    },

    /// Answer from a data source, sent unicast to the probe's source address
    Announce {
        nonce: u32,
        #[serde(flatten)]
        info: Announcement,
    },
}

/// What a data source reports about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub control_api_endpoint: String,
    pub control_api_port: u16,
    pub data_streamer_endpoint: String,
    pub data_streamer_port: u16,
}

/// Operations understood by the control surface and the node RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    EnableAutoDiscovery,
    ServiceStatus,
    StartTracking,
    StopTracking,
    ExecuteCalibrationStep,
    CompleteCalibration,
    SetMasterDataSource,
    StartDiagnosticMode,
    StopDiagnosticMode,
    SystemReboot,
    SetSceneDescriptor,
    ForgetDataSources,
    // Node-side only
    StartCalibration,
    StopCalibration,
    ApplyConfiguration,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Ordered key -> value payload
pub type CommandData = BTreeMap<String, serde_json::Value>;

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Caller-generated correlation token
    pub request_id: String,
    pub command_type: CommandType,
    #[serde(default)]
    pub data: CommandData,
    pub timestamp: DateTime<Utc>,
}

impl Command {
    /// New command with a fresh request id
    pub fn new(command_type: CommandType) -> Self {
        Command {
            request_id: uuid::Uuid::new_v4().to_string(),
            command_type,
            data: CommandData::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder-style payload entry
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        // Values built here are plain data; a failed conversion leaves the key out
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.to_string(), v);
        }
        self
    }

    /// Required payload entry, typed
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| Error::InvalidParameter(format!("{} requires '{}'", self.command_type, key)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidParameter(format!("'{}': {}", key, e)))
    }

    /// Optional payload entry, typed
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.data.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(_) => self.get(key).map(Some),
        }
    }
}

/// Result payload on both surfaces
pub type CommandOutcome = std::result::Result<serde_json::Value, Error>;

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T> {
    /// Echoes the command's request id
    pub request_id: String,
    pub data: T,
    /// Set once the caller has consumed the result
    #[serde(default)]
    pub read: bool,
    pub timestamp: DateTime<Utc>,
}

impl<T> CommandResult<T> {
    pub fn new(request_id: impl Into<String>, data: T) -> Self {
        CommandResult {
            request_id: request_id.into(),
            data,
            read: false,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_announce() {
        let json = r#"{
            "type": "announce",
            "nonce": 7,
            "id": "kinect-1",
            "controlApiEndpoint": "192.168.1.20",
            "controlApiPort": 9000,
            "dataStreamerEndpoint": "192.168.1.20",
            "dataStreamerPort": 9001
        }"#;

        let msg: DiscoveryMessage = serde_json::from_str(json).unwrap();
        match msg {
            DiscoveryMessage::Announce { nonce, info } => {
                assert_eq!(nonce, 7);
                assert_eq!(info.id, "kinect-1");
                assert_eq!(info.control_api_port, 9000);
                assert_eq!(info.data_streamer_port, 9001);
            }
            _ => panic!("Expected Announce"),
        }
    }

    #[test]
    fn test_serialize_discover() {
        let msg = DiscoveryMessage::Discover { service: "body-tracking".to_string(), nonce: 3 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"discover\""));
        assert!(json.contains("\"nonce\":3"));
    }

    #[test]
    fn test_command_wire_shape() {
        let cmd = Command::new(CommandType::SetMasterDataSource).with("id", "kinect-2");
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"requestId\""));
        assert!(json.contains("\"commandType\":\"SetMasterDataSource\""));
        assert!(json.contains("\"data\":{\"id\":\"kinect-2\"}"));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = Command::new(CommandType::ServiceStatus);
        let b = Command::new(CommandType::ServiceStatus);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_command_typed_access() {
        let cmd = Command::new(CommandType::ExecuteCalibrationStep)
            .with("useCentroids", true)
            .with("lastButNthValidMatrix", 2);
        assert!(cmd.get::<bool>("useCentroids").unwrap());
        assert_eq!(cmd.get_opt::<u32>("lastButNthValidMatrix").unwrap(), Some(2));
        assert_eq!(cmd.get_opt::<String>("dataSource2Id").unwrap(), None);
        assert!(matches!(cmd.get::<String>("dataSource1Id"), Err(Error::InvalidParameter(_))));
        assert!(matches!(cmd.get::<String>("useCentroids"), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_result_outcome_serialization() {
        let ok: CommandResult<CommandOutcome> = CommandResult::new("r1", Ok(serde_json::json!({"state": "Idle"})));
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"Ok\""));
        assert!(json.contains("\"read\":false"));

        let err: CommandResult<CommandOutcome> = CommandResult::new("r2", Err(Error::Timeout(500)));
        let json = serde_json::to_string(&err).unwrap();
        let back: CommandResult<CommandOutcome> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, Err(Error::Timeout(500)));
        assert_eq!(back.request_id, "r2");
    }
}
