use chrono::Utc;
use helios::cache::{FileSnapshotStore, SnapshotStore, cache_file_name};
use helios::snapshot::{DeviceRecord, DeviceSnapshot, DeviceType, FieldValue};
use std::fs;
use std::time::Duration;

fn snapshot() -> DeviceSnapshot {
    let mut snap = DeviceSnapshot::new();
    snap.insert(DeviceType::Pvs, "ZT01234567890ABCDE", DeviceRecord::new());
    let mut inv = DeviceRecord::new();
    inv.insert("p_3phsum_kw".into(), FieldValue::float(0.3121));
    inv.insert("STATE".into(), "working".into());
    snap.insert(DeviceType::Inverter, "E00122034051234", inv);
    snap
}

#[test]
fn file_names_are_filesystem_safe() {
    assert_eq!(
        cache_file_name("192.168.1.50:8080"),
        "sunpower_cache_192_168_1_50_8080.json"
    );
}

#[test]
fn store_then_load_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path());

    store.store("pvs-a", &snapshot()).unwrap();
    let loaded = store.load("pvs-a").unwrap().unwrap();

    assert_eq!(loaded.snapshot, snapshot());
    assert!(loaded.age(Utc::now()) < Duration::from_secs(60));
    assert!(store.load("pvs-b").unwrap().is_none());
}

#[test]
fn instances_do_not_share_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path());
    store.store("10.0.0.1", &snapshot()).unwrap();
    store.store("10.0.0.2", &snapshot()).unwrap();

    assert_ne!(store.path_for("10.0.0.1"), store.path_for("10.0.0.2"));
    assert!(store.path_for("10.0.0.1").exists());
    assert!(store.path_for("10.0.0.2").exists());
}

#[test]
fn corrupt_file_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path());
    let path = store.path_for("pvs");
    fs::write(&path, "{not json").unwrap();

    assert!(store.load("pvs").unwrap().is_none());
    assert!(!path.exists());
}

#[test]
fn file_without_timestamp_uses_modification_time() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path());
    fs::write(
        store.path_for("pvs"),
        r#"{"devices":[{"DEVICE_TYPE":"PVS","SERIAL":"ZT0001"}]}"#,
    )
    .unwrap();

    let loaded = store.load("pvs").unwrap().unwrap();
    assert!(loaded.age(Utc::now()) < Duration::from_secs(60));
    assert!(loaded.snapshot.device(DeviceType::Pvs, "ZT0001").is_some());
}
