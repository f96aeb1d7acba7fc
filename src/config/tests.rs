use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::Settings;
use super::{StoreKind, load_config, load_config_from};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.ws_port, 8081);
    assert_eq!(settings.broker.mailbox_capacity, 64);
    assert!(settings.broker.topics.is_empty());
    assert_eq!(settings.broker.store, StoreKind::Memory);
    assert_eq!(settings.broker.sled_path, "relayhub_topics");
    assert!(!settings.dispatcher.enabled);
    assert_eq!(settings.dispatcher.store, StoreKind::Memory);
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn advertise_url_defaults_to_dispatch_endpoint() {
    let mut settings = Settings::default();
    assert_eq!(settings.advertise_url(), "http://127.0.0.1:8080/dispatch");

    settings.dispatcher.advertise_url = Some("http://node-b:9000/dispatch".to_string());
    assert_eq!(settings.advertise_url(), "http://node-b:9000/dispatch");
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("relayhub.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [broker]
        mailbox_capacity = 8
        topics = ["lists", "users"]
        store = "sled"
        sled_path = "/var/lib/relayhub/topics"

        [dispatcher]
        enabled = true
        store = "sled"
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(&path).expect("load_config_from failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    // untouched values keep their defaults
    assert_eq!(cfg.server.ws_port, 8081);
    assert_eq!(cfg.broker.mailbox_capacity, 8);
    assert_eq!(cfg.broker.topics, vec!["lists", "users"]);
    assert_eq!(cfg.broker.store, StoreKind::Sled);
    assert_eq!(cfg.broker.sled_path, "/var/lib/relayhub/topics");
    assert!(cfg.dispatcher.enabled);
    assert_eq!(cfg.dispatcher.store, StoreKind::Sled);
    assert_eq!(cfg.dispatcher.hook_capacity, 1_024);
}

#[test]
#[serial]
fn load_config_reads_environment() {
    temp_env::with_vars(
        [
            ("RELAYHUB_SERVER__WS_PORT", Some("9101")),
            ("RELAYHUB_BROKER__TOPICS", Some("a,b,c")),
            ("RELAYHUB_DISPATCHER__ENABLED", Some("true")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.ws_port, 9101);
            assert_eq!(cfg.broker.topics, vec!["a", "b", "c"]);
            assert!(cfg.dispatcher.enabled);
            assert_eq!(cfg.server.port, 8080);
        },
    );
}

#[test]
fn load_config_from_missing_file_fails() {
    let tmp = TempDir::new().expect("create tempdir");
    assert!(load_config_from(tmp.path().join("absent.toml")).is_err());
}
