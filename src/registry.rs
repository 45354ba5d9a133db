// Data source registry
// In-memory map of known sensor nodes, keyed by case-insensitive id

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A known data source (one sensor node)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceRecord {
    pub id: String,
    pub control_endpoint: String,
    pub control_port: u16,
    pub data_stream_endpoint: String,
    pub data_stream_port: u16,
    /// Compact identifier used to tag this node in wire-level streams
    #[serde(default)]
    pub unique_byte_id: u8,
    #[serde(default)]
    pub is_master: bool,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_reachable: bool,
}

impl DataSourceRecord {
    /// Create a record with endpoints only; bookkeeping fields start empty.
    pub fn new(
        id: impl Into<String>,
        control_endpoint: impl Into<String>,
        control_port: u16,
        data_stream_endpoint: impl Into<String>,
        data_stream_port: u16,
    ) -> Self {
        DataSourceRecord {
            id: id.into(),
            control_endpoint: control_endpoint.into(),
            control_port,
            data_stream_endpoint: data_stream_endpoint.into(),
            data_stream_port,
            unique_byte_id: 0,
            is_master: false,
            first_seen: None,
            last_seen: None,
            is_reachable: false,
        }
    }

    /// Socket address of the node's control API. Host names are resolved on every call.
    pub async fn control_addr(&self) -> Result<SocketAddr> {
        let host = self.control_endpoint.trim();
        if host.is_empty() {
            return Err(Error::InvalidParameter(format!("data source {} has no control endpoint", self.id)));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.control_port));
        }

        let mut addrs = tokio::net::lookup_host((host, self.control_port))
            .await
            .map_err(|e| Error::Unreachable(format!("{}: cannot resolve '{}': {}", self.id, host, e)))?;
        addrs
            .next()
            .ok_or_else(|| Error::Unreachable(format!("{}: '{}' has no addresses", self.id, host)))
    }
}

/// Outcome of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Immutable, restartable view of the registry at one instant
#[derive(Debug, Clone)]
pub struct Snapshot(Arc<[DataSourceRecord]>);

impl Snapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, DataSourceRecord> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<DataSourceRecord> {
        self.0.to_vec()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a DataSourceRecord;
    type IntoIter = std::slice::Iter<'a, DataSourceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Registry of known data sources
///
/// Pure in-memory state behind a single lock. Discovery, health polling and
/// control queries all go through here concurrently.
#[derive(Debug, Default)]
pub struct Registry {
    records: Mutex<HashMap<String, DataSourceRecord>>,
}

fn key(id: &str) -> String {
    id.to_lowercase()
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record keyed by id.
    ///
    /// A replacement keeps the existing byte id and first-seen time. The master
    /// flag only moves when the incoming record asserts it; in that case every
    /// other record loses it.
    pub fn upsert(&self, mut record: DataSourceRecord) -> Result<Upsert> {
        let mut records = self.records.lock();
        let k = key(&record.id);

        let outcome = match records.get(&k) {
            Some(existing) => {
                record.unique_byte_id = existing.unique_byte_id;
                record.first_seen = existing.first_seen.or(record.first_seen);
                record.is_master = record.is_master || existing.is_master;
                Upsert::Updated
            }
            None => {
                record.unique_byte_id = next_byte_id(&records)?;
                Upsert::Inserted
            }
        };

        if record.is_master {
            for (other_key, other) in records.iter_mut() {
                if *other_key != k {
                    other.is_master = false;
                }
            }
        }
        records.insert(k, record);
        Ok(outcome)
    }

    pub fn remove(&self, id: &str) -> Option<DataSourceRecord> {
        self.records.lock().remove(&key(id))
    }

    /// Forget every known data source
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn get(&self, id: &str) -> Option<DataSourceRecord> {
        self.records.lock().get(&key(id)).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().contains_key(&key(id))
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot of all records, ordered by id
    pub fn all(&self) -> Snapshot {
        let mut records: Vec<DataSourceRecord> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| key(&a.id).cmp(&key(&b.id)));
        Snapshot(records.into())
    }

    pub fn master(&self) -> Option<DataSourceRecord> {
        self.records.lock().values().find(|r| r.is_master).cloned()
    }

    /// Make `id` the single master data source
    pub fn set_master(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock();
        let k = key(id);
        if !records.contains_key(&k) {
            return Err(Error::UnknownSource(id.to_string()));
        }
        for (other_key, record) in records.iter_mut() {
            record.is_master = *other_key == k;
        }
        Ok(())
    }

    /// Record a probe / poll result. Returns the previous reachability, or
    /// None if the id is unknown.
    pub fn mark_reachable(&self, id: &str, reachable: bool, now: DateTime<Utc>) -> Option<bool> {
        let mut records = self.records.lock();
        let record = records.get_mut(&key(id))?;
        let previous = record.is_reachable;
        record.is_reachable = reachable;
        if reachable {
            record.last_seen = Some(now);
            if record.first_seen.is_none() {
                record.first_seen = Some(now);
            }
        }
        Some(previous)
    }

    /// Refresh last-seen without touching anything else (duplicate discovery answers)
    pub fn touch(&self, id: &str, now: DateTime<Utc>) -> bool {
        match self.records.lock().get_mut(&key(id)) {
            Some(record) => {
                record.last_seen = Some(now);
                true
            }
            None => false,
        }
    }
}

/// Smallest byte id not already taken
fn next_byte_id(records: &HashMap<String, DataSourceRecord>) -> Result<u8> {
    let mut used = [false; 256];
    for r in records.values() {
        used[r.unique_byte_id as usize] = true;
    }
    used.iter()
        .position(|taken| !taken)
        .map(|b| b as u8)
        .ok_or_else(|| Error::InvalidParameter("registry is full (256 data sources)".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> DataSourceRecord {
        DataSourceRecord::new(id, "127.0.0.1", 9000, "127.0.0.1", 9001)
    }

    #[test]
    fn test_upsert_is_idempotent_and_case_insensitive() {
        let registry = Registry::new();
        assert_eq!(registry.upsert(record("Kinect-A")).unwrap(), Upsert::Inserted);
        assert_eq!(registry.upsert(record("kinect-a")).unwrap(), Upsert::Updated);
        assert_eq!(registry.upsert(record("KINECT-A")).unwrap(), Upsert::Updated);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("kInEcT-a"));
    }

    #[test]
    fn test_byte_ids_are_unique_and_stable() {
        let registry = Registry::new();
        registry.upsert(record("a")).unwrap();
        registry.upsert(record("b")).unwrap();
        let b_id = registry.get("b").unwrap().unique_byte_id;
        registry.upsert(record("B")).unwrap();
        assert_eq!(registry.get("b").unwrap().unique_byte_id, b_id);
        assert_ne!(registry.get("a").unwrap().unique_byte_id, b_id);

        registry.remove("a");
        registry.upsert(record("c")).unwrap();
        assert_eq!(registry.get("c").unwrap().unique_byte_id, 0);
    }

    #[test]
    fn test_set_master_is_exclusive() {
        let registry = Registry::new();
        registry.upsert(record("a")).unwrap();
        registry.upsert(record("b")).unwrap();

        registry.set_master("A").unwrap();
        assert_eq!(registry.master().unwrap().id, "a");

        registry.set_master("b").unwrap();
        let masters: Vec<_> = registry.all().iter().filter(|r| r.is_master).map(|r| r.id.clone()).collect();
        assert_eq!(masters, vec!["b".to_string()]);
    }

    #[test]
    fn test_set_master_unknown_id() {
        let registry = Registry::new();
        registry.upsert(record("a")).unwrap();
        registry.set_master("a").unwrap();
        let err = registry.set_master("zzz").unwrap_err();
        assert_eq!(err, Error::UnknownSource("zzz".to_string()));
        // previous master untouched
        assert_eq!(registry.master().unwrap().id, "a");
    }

    #[test]
    fn test_upsert_preserves_master_from_discovery() {
        let registry = Registry::new();
        let mut m = record("m");
        m.is_master = true;
        registry.upsert(m).unwrap();
        // a discovery answer knows nothing about the master flag
        registry.upsert(record("m")).unwrap();
        assert!(registry.get("m").unwrap().is_master);

        let mut other = record("n");
        other.is_master = true;
        registry.upsert(other).unwrap();
        assert!(!registry.get("m").unwrap().is_master);
    }

    #[test]
    fn test_snapshot_is_restartable() {
        let registry = Registry::new();
        registry.upsert(record("b")).unwrap();
        registry.upsert(record("a")).unwrap();
        let snapshot = registry.all();
        registry.clear();

        let first: Vec<_> = snapshot.iter().map(|r| r.id.as_str()).collect();
        let second: Vec<_> = (&snapshot).into_iter().map(|r| r.id.as_str()).collect();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(first, second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mark_reachable() {
        let registry = Registry::new();
        registry.upsert(record("a")).unwrap();
        let now = Utc::now();
        assert_eq!(registry.mark_reachable("a", true, now), Some(false));
        let r = registry.get("a").unwrap();
        assert!(r.is_reachable);
        assert_eq!(r.last_seen, Some(now));
        assert_eq!(registry.mark_reachable("missing", true, now), None);
    }

    #[tokio::test]
    async fn test_control_addr() {
        let r = record("a");
        assert_eq!(r.control_addr().await.unwrap(), "127.0.0.1:9000".parse().unwrap());

        let named = DataSourceRecord::new("b", "localhost", 9100, "localhost", 9101);
        let addr = named.control_addr().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 9100);

        let blank = DataSourceRecord::new("c", " ", 1, "", 2);
        assert!(matches!(blank.control_addr().await, Err(Error::InvalidParameter(_))));
        let unknown = DataSourceRecord::new("d", "no-such-node.invalid", 1, "", 2);
        assert!(matches!(unknown.control_addr().await, Err(Error::Unreachable(_))));
    }
}
