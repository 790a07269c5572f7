//! Configuration loading from disk and environment
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::time::Duration;

use gwsrv::{AppConfig, GatewayConfig, GatewayRegistry, GwError};

const VALID: &str = "\
polling:
  interval_ms: 500
  request_timeout_ms: 1500
reconnect:
  initial_delay_ms: 200
  jitter: true
logging:
  level: debug
  format: json
gateways:
  - ip: 10.1.0.10
    port: 502
    slave_ids: [1, 2, 3]
  - ip: 10.1.0.11
    port: 5020
    slave_ids: [1]
    interval_ms: 2000
    register_groups:
      - name: meter
        function_code: 3
        address: 40
        quantity: 10
";

#[test]
fn test_missing_file_writes_template() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config").join("gwsrv.yaml");

    let err = AppConfig::load(&path).unwrap_err();
    assert!(matches!(err, GwError::Config(_)));
    assert!(err.is_fatal());
    assert!(path.exists());

    // The template itself is a loadable configuration
    let config = AppConfig::load(&path).unwrap();
    assert_eq!(config.gateways, AppConfig::template().gateways);
}

#[test]
fn test_load_file_with_env_override() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gwsrv.yaml");
    std::fs::write(&path, VALID).unwrap();

    std::env::set_var("GWSRV_POLLING__CONNECT_TIMEOUT_MS", "750");
    let config = AppConfig::load(&path);
    std::env::remove_var("GWSRV_POLLING__CONNECT_TIMEOUT_MS");
    let config = config.unwrap();

    assert_eq!(config.polling.interval(), Duration::from_millis(500));
    assert_eq!(config.polling.request_timeout(), Duration::from_millis(1500));
    assert_eq!(config.polling.connect_timeout(), Duration::from_millis(750));
    assert_eq!(config.reconnect.initial_delay_ms, 200);
    assert_eq!(config.reconnect.max_delay_ms, 60_000);
    assert!(config.reconnect.jitter);
    assert_eq!(config.logging.level, "debug");

    let registry = GatewayRegistry::from_configs(config.gateways).unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.slave_count(), 3);
    let second = registry.find_by_endpoint("10.1.0.11", 5020).unwrap();
    assert_eq!(second.interval, Some(Duration::from_secs(2)));
    assert_eq!(second.groups.len(), 1);
    assert_eq!(second.groups[0].name, "meter");
}

#[test]
fn test_invalid_settings_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gwsrv.yaml");
    std::fs::write(
        &path,
        "reconnect:\n  backoff_multiplier: 0.5\ngateways:\n  - ip: 10.0.0.1\n    port: 502\n    slave_ids: [1]\n",
    )
    .unwrap();

    let err = AppConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("backoff_multiplier"));
}

#[test]
fn test_malformed_yaml_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gwsrv.yaml");
    std::fs::write(&path, "gateways: [ {ip: 10.0.0.1, port: nope").unwrap();

    assert!(matches!(AppConfig::load(&path), Err(GwError::Config(_))));
}

#[test]
fn test_registry_rejects_bad_gateways() {
    let dup = GatewayRegistry::from_configs(vec![
        GatewayConfig::new("10.0.0.1", 502, vec![1]),
        GatewayConfig::new("10.0.0.1", 502, vec![2]),
    ]);
    assert!(matches!(dup, Err(GwError::Config(_))));

    let no_slaves = GatewayRegistry::from_configs(vec![GatewayConfig::new("10.0.0.1", 502, vec![])]);
    assert!(no_slaves.is_err());

    let broadcast = GatewayRegistry::from_configs(vec![GatewayConfig::new("10.0.0.1", 502, vec![0])]);
    assert!(broadcast.is_err());

    assert!(GatewayRegistry::from_configs(Vec::new()).is_err());
}
