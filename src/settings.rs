// Persisted settings
// Key -> JSON value store; the service keeps node configuration and calibration here

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::registry::DataSourceRecord;

pub const KEY_DATA_SOURCES: &str = "dataSources";
pub const KEY_MASTER: &str = "masterDataSource";
pub const KEY_CALIBRATION: &str = "calibration";
pub const KEY_SCENE: &str = "sceneDescriptor";

/// Load/save of key-value settings
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&self, key: &str, value: serde_json::Value);
    fn remove(&self, key: &str);
    /// Make pending changes durable
    fn flush(&self) -> Result<()>;
}

/// Typed read; a present but malformed value is an error
pub fn get_typed<T: DeserializeOwned>(store: &dyn SettingsStore, key: &str) -> Result<Option<T>> {
    match store.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| Error::Settings(format!("'{}': {}", key, e))),
    }
}

/// Typed write (not flushed)
pub fn set_typed<T: Serialize>(store: &dyn SettingsStore, key: &str, value: &T) -> Result<()> {
    let v = serde_json::to_value(value).map_err(|e| Error::Settings(format!("'{}': {}", key, e)))?;
    store.set(key, v);
    Ok(())
}

/// The configuration-only part of a DataSourceRecord that survives restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDataSource {
    pub id: String,
    pub control_endpoint: String,
    pub control_port: u16,
    pub data_stream_endpoint: String,
    pub data_stream_port: u16,
    #[serde(default)]
    pub is_master: bool,
}

impl From<&DataSourceRecord> for PersistedDataSource {
    fn from(r: &DataSourceRecord) -> Self {
        PersistedDataSource {
            id: r.id.clone(),
            control_endpoint: r.control_endpoint.clone(),
            control_port: r.control_port,
            data_stream_endpoint: r.data_stream_endpoint.clone(),
            data_stream_port: r.data_stream_port,
            is_master: r.is_master,
        }
    }
}

impl From<PersistedDataSource> for DataSourceRecord {
    fn from(p: PersistedDataSource) -> Self {
        let mut record = DataSourceRecord::new(
            p.id,
            p.control_endpoint,
            p.control_port,
            p.data_stream_endpoint,
            p.data_stream_port,
        );
        record.is_master = p.is_master;
        record
    }
}

/// Ephemeral store
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) {
        self.values.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Single JSON object file, replaced atomically on flush
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl JsonFileStore {
    /// Open (or start) the settings file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => serde_json::Map::new(),
            Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => {
                    return Err(Error::Settings(format!("{} is not a JSON object", path.display())))
                }
                Err(e) => return Err(Error::Settings(format!("{}: {}", path.display(), e))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, starting empty", path.display());
                serde_json::Map::new()
            }
            Err(e) => return Err(Error::Settings(format!("{}: {}", path.display(), e))),
        };
        info!("Settings loaded from {} ({} keys)", path.display(), values.len());
        Ok(JsonFileStore { path, values: Mutex::new(values) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) {
        self.values.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }

    fn flush(&self) -> Result<()> {
        let text = {
            let values = self.values.lock();
            serde_json::to_string_pretty(&*values).map_err(|e| Error::Settings(e.to_string()))?
        };
        write_atomic(&self.path, text.as_bytes()).map_err(|e| Error::Settings(format!("{}: {}", self.path.display(), e)))
    }
}

/// Write to `<path>.tmp` then rename over `path`
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
