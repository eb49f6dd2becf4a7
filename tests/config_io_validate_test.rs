use bankwarden::config::{Config, RelayPatternEntry};
use std::fs;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.temperature.host = "10.0.0.5".to_string();
    cfg.balance.duration_secs = 42;
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.temperature.host, "10.0.0.5");
    assert_eq!(loaded.balance.duration_secs, 42);
    assert_eq!(loaded.logging.file, cfg.logging.file);
    assert!(loaded.validate().is_ok());
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    assert!(cfg.validate().is_ok());

    cfg.temperature.port = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.temperature.scaling_factor = 0.0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.temperature.max_retries = 0;
    assert!(cfg.validate().is_err());

    // Unbounded retries would stall the cycle on exponential backoff
    cfg = Config::default();
    cfg.temperature.retry_backoff_base = 10.0;
    cfg.temperature.max_retries = 21;
    let err = cfg.validate().unwrap_err().to_string();
    assert!(err.contains("temperature.max_retries"), "{}", err);
    cfg.temperature.max_retries = bankwarden::config::MAX_TEMPERATURE_RETRIES;
    assert!(cfg.validate().is_ok());

    cfg = Config::default();
    cfg.adc.divider_ratio = -1.0;
    assert!(cfg.validate().is_err());

    // Ranges must cover every channel exactly once
    cfg = Config::default();
    cfg.banks.ranges = vec![[1, 8], [9, 16], [17, 23]];
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.bus.bank_mux_channels = vec![0, 1];
    assert!(cfg.validate().is_err());
}

#[test]
fn incomplete_relay_table_is_rejected() {
    let mut cfg = Config::default();
    cfg.banks.relay_patterns = Some(vec![RelayPatternEntry {
        source: 1,
        dest: 2,
        mask: 0b0000_0011,
    }]);
    let err = cfg.validate().unwrap_err();
    assert!(format!("{}", err).contains("banks.relay_patterns"));
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("Serialization error"));
}
