//! Snapshot cache
//!
//! Last-known-good device data kept outside process memory so the coordinator
//! can serve something when the gateway is asleep or unreachable. A missing or
//! corrupt cache is never an error for the caller; it is simply "no cache".

use crate::error::{HeliosError, Result};
use crate::logging::get_logger;
use crate::snapshot::DeviceSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A snapshot plus the time it was captured
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot {
    pub snapshot: DeviceSnapshot,
    pub captured_at: DateTime<Utc>,
}

impl CachedSnapshot {
    pub const fn new(snapshot: DeviceSnapshot, captured_at: DateTime<Utc>) -> Self {
        Self {
            snapshot,
            captured_at,
        }
    }

    /// Wall-clock age; a capture time in the future counts as zero
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.captured_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Durable store for the last good snapshot of each instance
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing usable is stored
    fn load(&self, instance_id: &str) -> Result<Option<CachedSnapshot>>;

    /// Persist a freshly polled snapshot, stamped with the current time
    fn store(&self, instance_id: &str, snapshot: &DeviceSnapshot) -> Result<()>;
}

/// On-disk document layout
#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    devices: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    captured_at: Option<DateTime<Utc>>,
}

/// `sunpower_cache_{id}.json` with `.` and `:` replaced so hosts with ports work
pub fn cache_file_name(instance_id: &str) -> String {
    let clean = instance_id.trim().replace(['.', ':'], "_");
    format!("sunpower_cache_{clean}.json")
}

/// JSON files in a directory, one per instance
pub struct FileSnapshotStore {
    dir: PathBuf,
    logger: crate::logging::StructuredLogger,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            logger: get_logger("cache"),
        }
    }

    pub fn path_for(&self, instance_id: &str) -> PathBuf {
        self.dir.join(cache_file_name(instance_id))
    }

    fn discard_corrupt(&self, path: &Path, reason: &str) {
        self.logger.warn(&format!(
            "Cache file {} is unusable ({}), removing it",
            path.display(),
            reason
        ));
        if let Err(e) = std::fs::remove_file(path) {
            self.logger
                .warn(&format!("Failed to remove corrupt cache file: {e}"));
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, instance_id: &str) -> Result<Option<CachedSnapshot>> {
        let path = self.path_for(instance_id);

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.logger.debug("No cache file found");
                return Ok(None);
            }
            Err(e) => {
                return Err(HeliosError::cache(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let raw: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                self.discard_corrupt(&path, &e.to_string());
                return Ok(None);
            }
        };

        let snapshot = match DeviceSnapshot::from_device_list(&raw) {
            Ok(s) => s,
            Err(e) => {
                self.discard_corrupt(&path, &e.to_string());
                return Ok(None);
            }
        };

        let captured_at = match raw
            .get("captured_at")
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
        {
            Some(ts) => ts,
            // Files written by older releases carry no timestamp
            None => std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .map_err(|e| HeliosError::cache(format!("No capture time available: {e}")))?,
        };

        self.logger.debug(&format!(
            "Loaded cached snapshot: {} devices captured at {}",
            snapshot.device_count(),
            captured_at.to_rfc3339()
        ));
        Ok(Some(CachedSnapshot::new(snapshot, captured_at)))
    }

    fn store(&self, instance_id: &str, snapshot: &DeviceSnapshot) -> Result<()> {
        let path = self.path_for(instance_id);
        let devices = match snapshot.to_device_list() {
            serde_json::Value::Object(mut root) => match root.remove("devices") {
                Some(serde_json::Value::Array(list)) => list,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        let document = CacheDocument {
            devices,
            captured_at: Some(Utc::now()),
        };
        let contents = serde_json::to_string(&document)?;

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| HeliosError::cache(format!("Failed to create cache dir: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .and_then(|()| std::fs::rename(&tmp, &path))
            .map_err(|e| HeliosError::cache(format!("Failed to write {}: {}", path.display(), e)))?;

        self.logger.debug(&format!(
            "Saved snapshot with {} devices to {}",
            snapshot.device_count(),
            path.display()
        ));
        Ok(())
    }
}

/// Process-local store; counts calls so callers can assert on cache traffic
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, CachedSnapshot>>,
    loads: AtomicUsize,
    stores: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry with an explicit capture time
    pub fn with_entry(self, instance_id: &str, cached: CachedSnapshot) -> Self {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(instance_id.to_string(), cached);
        }
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::Relaxed)
    }

    pub fn get(&self, instance_id: &str) -> Option<CachedSnapshot> {
        self.entries.lock().ok()?.get(instance_id).cloned()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, instance_id: &str) -> Result<Option<CachedSnapshot>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let entries = self
            .entries
            .lock()
            .map_err(|_| HeliosError::cache("Snapshot store lock poisoned"))?;
        Ok(entries.get(instance_id).cloned())
    }

    fn store(&self, instance_id: &str, snapshot: &DeviceSnapshot) -> Result<()> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| HeliosError::cache("Snapshot store lock poisoned"))?;
        entries.insert(
            instance_id.to_string(),
            CachedSnapshot::new(snapshot.clone(), Utc::now()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot::from_device_list(&json!({
            "devices": [
                {"DEVICE_TYPE": "PVS", "SERIAL": "ZT1"},
                {"DEVICE_TYPE": "Inverter", "SERIAL": "E001", "p_3phsum_kw": 0.3}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn file_name_sanitizes_host_and_port() {
        assert_eq!(cache_file_name("172.27.153.1"), "sunpower_cache_172_27_153_1.json");
        assert_eq!(
            cache_file_name("10.222.1.245:9090"),
            "sunpower_cache_10_222_1_245_9090.json"
        );
    }

    #[test]
    fn age_is_never_negative() {
        let now = Utc::now();
        let cached = CachedSnapshot::new(snapshot(), now + chrono::Duration::seconds(30));
        assert_eq!(cached.age(now), Duration::ZERO);
        let cached = CachedSnapshot::new(snapshot(), now - chrono::Duration::seconds(90));
        assert_eq!(cached.age(now), Duration::from_secs(90));
    }

    #[test]
    fn missing_file_is_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        assert!(store.load("10.0.0.1").unwrap().is_none());
    }

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("nested"));
        store.store("10.0.0.1", &snapshot()).unwrap();

        let loaded = store.load("10.0.0.1").unwrap().unwrap();
        assert_eq!(loaded.snapshot, snapshot());
        assert!(loaded.age(Utc::now()) < Duration::from_secs(5));
        assert!(store.path_for("10.0.0.1").exists());
    }

    #[test]
    fn corrupt_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let path = store.path_for("pvs");
        std::fs::write(&path, "{not json").unwrap();

        assert!(store.load("pvs").unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn document_without_devices_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let path = store.path_for("pvs");
        std::fs::write(&path, r#"{"result": "succeed"}"#).unwrap();

        assert!(store.load("pvs").unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn legacy_file_without_timestamp_uses_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        std::fs::write(store.path_for("pvs"), snapshot().to_device_list().to_string()).unwrap();

        let loaded = store.load("pvs").unwrap().unwrap();
        assert!(loaded.age(Utc::now()) < Duration::from_secs(60));
    }

    #[test]
    fn memory_store_counts_traffic() {
        let store = MemorySnapshotStore::new();
        assert!(store.load("a").unwrap().is_none());
        store.store("a", &snapshot()).unwrap();
        assert!(store.load("a").unwrap().is_some());
        assert_eq!(store.load_count(), 2);
        assert_eq!(store.store_count(), 1);
    }
}
