//! Configuration loading and reconciliation tests

use std::io::Write;

use resource_manager::{
    EngineConfig, Error, ErrorKind, IdPoolConfig, IdRequest, Range, ResourceManager,
};
use tempfile::NamedTempFile;

const ENGINE_YAML: &str = r#"
id_pools:
  - name: vlan
    range: { start: 100, end: 199 }
    excludes:
      - { start: 100, end: 109 }
    alarms:
      enabled: true
      low_threshold: 20
  - name: tunnel-key
    range: { start: 5000, end: 1 }
    sync: false
ip_pools:
  - name: loopbacks
    subnets: ["192.0.2.0/24", "2001:db8::/64"]
    excludes: ["192.0.2.0/28"]
"#;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(ENGINE_YAML.as_bytes()).unwrap();

    let config = EngineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.id_pools.len(), 2);
    assert_eq!(config.id_pools[0].alarms.low_threshold, 20);
    // swapped bounds are normalized
    assert_eq!(config.id_pools[1].range, Range::new(1, 5000));
    assert!(!config.id_pools[1].sync);
    assert!(config.id_pools[0].sync);
    assert!(config.validate().is_ok());
}

#[test]
fn test_save_and_reload() {
    let config = EngineConfig::from_yaml_str(ENGINE_YAML).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.yaml");

    config.save(&path).unwrap();
    let reloaded = EngineConfig::from_file(&path).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_threshold_above_hundred_rejected() {
    let mut pool = IdPoolConfig::new("vlan", Range::new(1, 10));
    pool.alarms.low_threshold = 101;
    assert!(matches!(pool.validate(), Err(Error::InvalidRange(_))));
}

#[test]
fn test_loaded_config_drives_manager() {
    let config = EngineConfig::from_yaml_str(ENGINE_YAML).unwrap();
    let manager = ResourceManager::new();
    let report = manager.apply_config(&config);
    assert!(report.is_clean());

    manager.allocate_id(IdRequest::new("vlan", "k")).unwrap();
    let stats = manager.pool_stats("vlan").unwrap();
    assert_eq!(stats.total, 100);
    assert_eq!(stats.available, 89);
    assert_eq!(
        manager.response("vlan", "k").unwrap().and_then(|r| r.id()),
        Some(110)
    );

    let loopbacks = manager.pool_stats("loopbacks").unwrap();
    assert_eq!(loopbacks.total, 256 + (1u128 << 64));
    assert_eq!(loopbacks.available, 240 + (1u128 << 64));
}
