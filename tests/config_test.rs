//! Configuration integration tests

use std::io::Write;

use serial_test::serial;
use tempfile::NamedTempFile;

use hub_proxy::config::{self, ProxyConfig, ENV_PREFIX};

#[test]
fn test_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"data_port": 42001, "log_level": "debug", "buffer_size": 65536}}"#
    )
    .unwrap();

    let config = ProxyConfig::from_file(file.path()).unwrap();
    assert_eq!(config.data_port, 42001);
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.buffer_size, 65536);
    // Unspecified fields keep their defaults
    assert_eq!(config.connect_timeout, 10);
}

#[test]
fn test_from_file_rejects_unknown_fields() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"data_port": 42001, "no_such_option": true}}"#).unwrap();

    assert!(ProxyConfig::from_file(file.path()).is_err());
}

#[test]
fn test_from_missing_file() {
    assert!(ProxyConfig::from_file("/nonexistent/hub-proxy.json").is_err());
}

#[test]
#[serial]
fn test_from_env() {
    std::env::set_var(format!("{}CONNECT_TIMEOUT", ENV_PREFIX), "3");
    std::env::set_var(format!("{}LOG_LEVEL", ENV_PREFIX), "trace");

    let config = ProxyConfig::from_env().unwrap();
    assert_eq!(config.connect_timeout, 3);
    assert_eq!(config.log_level, "trace");

    std::env::remove_var(format!("{}CONNECT_TIMEOUT", ENV_PREFIX));
    std::env::remove_var(format!("{}LOG_LEVEL", ENV_PREFIX));
}

#[test]
#[serial]
fn test_from_env_rejects_garbage() {
    std::env::set_var(format!("{}DATA_PORT", ENV_PREFIX), "not-a-port");
    assert!(ProxyConfig::from_env().is_err());
    std::env::remove_var(format!("{}DATA_PORT", ENV_PREFIX));
}

#[test]
#[serial]
fn test_global_store_layering() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"data_port": 42002, "connect_timeout": 7}}"#).unwrap();

    // Environment overrides the file
    std::env::set_var(format!("{}CONNECT_TIMEOUT", ENV_PREFIX), "4");

    config::initialize(Some(file.path())).unwrap();
    let loaded = config::get_config();
    assert_eq!(loaded.data_port, 42002);
    assert_eq!(loaded.connect_timeout, 4);

    std::env::remove_var(format!("{}CONNECT_TIMEOUT", ENV_PREFIX));

    // Restore defaults for other tests
    config::update_config(ProxyConfig::default()).unwrap();
}

#[test]
#[serial]
fn test_update_config_validates() {
    let mut bad = ProxyConfig::default();
    bad.buffer_size = 0;
    assert!(config::update_config(bad).is_err());
    assert_ne!(config::get_config().buffer_size, 0);
}
