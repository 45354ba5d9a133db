// Error types for the tracking service
// Every variant carries owned data so errors can travel inside CommandResults

use serde::{Deserialize, Serialize};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Tracking service error taxonomy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum Error {
    /// Target absent or refusing connections (expected, not logged as a failure)
    #[error("Data source unreachable: {0}")]
    Unreachable(String),

    /// Anomalous socket condition (reset, aborted, unexpected I/O error)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bounded wait exceeded
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Command illegal for the current service state
    #[error("{command} is not allowed while the service is {state}")]
    InvalidState {
        /// Rejected command
        command: String,
        /// State observed when the command was rejected
        state: String,
    },

    /// Calibration step requested out of order
    #[error("Calibration step {requested} out of sequence (expected {expected})")]
    InvalidSequence {
        /// Step that was requested
        requested: String,
        /// Step the session would accept next
        expected: String,
    },

    /// Referenced data source id is not in the registry
    #[error("Unknown data source: {0}")]
    UnknownSource(String),

    /// Concatenated per-node failures from a reconfiguration fan-out
    #[error("Reconfiguration failed on some data sources: {0}")]
    Aggregated(String),

    /// Malformed wire payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command data missing or invalid
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The data source answered with a failure of its own
    #[error("Remote error: {0}")]
    Remote(String),

    /// Persisted settings could not be read or written
    #[error("Settings error: {0}")]
    Settings(String),

    /// The command processor is not accepting work
    #[error("Command processor stopped")]
    Stopped,
}

impl Error {
    /// True for failures that simply mean "the node is not there".
    pub fn is_expected_absence(&self) -> bool {
        matches!(self, Error::Unreachable(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_roundtrips_through_json() {
        let err = Error::InvalidState {
            command: "StartTracking".to_string(),
            state: "Running".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"InvalidState\""));
        let back: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: Error = io.into();
        assert!(matches!(err, Error::Transport(ref m) if m.contains("reset")));
        assert!(!err.is_expected_absence());
        assert!(Error::Unreachable("a".into()).is_expected_absence());
    }
}
