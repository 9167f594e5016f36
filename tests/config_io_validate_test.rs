use helios::config::migrate::{Migration, migrate};
use helios::config::{Config, ProtocolPreference};
use std::fs;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.gateway.host = "10.0.0.5".to_string();
    cfg.gateway.protocol = ProtocolPreference::Varserver;
    cfg.polling.sunrise_elevation = Some(3.0);
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.gateway.host, "10.0.0.5");
    assert_eq!(loaded.gateway.protocol, ProtocolPreference::Varserver);
    assert_eq!(loaded.polling.sunrise_elevation, Some(3.0));
    assert_eq!(loaded.logging.file, cfg.logging.file);
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    assert!(cfg.validate().is_ok());

    cfg.gateway.host.clear();
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.polling.interval_seconds = 30;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.polling.sunset_elevation = Some(120.0);
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.health.max_retries = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.diagnostics.response_window = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn older_config_is_migrated() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(
        tmp.path(),
        "gateway:\n  host: 192.168.1.50\npolling:\n  interval_seconds: 300\n  polling_interval_seconds: 45\n  elevation_threshold: 8.0\n",
    )
    .unwrap();

    let mut cfg = Config::from_file(tmp.path()).unwrap();
    let applied = migrate(&mut cfg);

    assert!(applied.contains(&Migration::ElevationThreshold { threshold: 8.0 }));
    assert_eq!(cfg.polling.sunrise_elevation, Some(8.0));
    assert_eq!(cfg.polling.sunset_elevation, Some(8.0));
    assert!(cfg.polling.interval_seconds >= 60);
    assert!(cfg.validate().is_ok());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("Serialization error"));
}
