use super::settings::Settings;
use super::{DeliveryFailurePolicy, load_config, load_config_from};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.store.path, "popcore_db");
    assert_eq!(settings.store.ring_buffer_size, 4096);
    assert_eq!(settings.store.max_db_batch_size, 1024);
    assert_eq!(settings.broker.durable_queue_in_memory_cache_limit, 10_000);
    assert_eq!(settings.delivery.batch_limit, 1000);
    assert_eq!(settings.delivery.failure_policy, DeliveryFailurePolicy::Log);
    assert_eq!(settings.delivery.max_redelivery_count, 10);
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    // Switch into a temp dir so load_config picks up config/default.toml from there.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [store]
        path = "/var/lib/popcore"
        ring_buffer_size = 512

        [delivery]
        batch_limit = 10
        failure_policy = "requeue"
        max_redelivery_count = 3
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.store.path, "/var/lib/popcore");
    assert_eq!(cfg.store.ring_buffer_size, 512);
    assert_eq!(cfg.store.max_db_batch_size, 1024);
    assert_eq!(cfg.delivery.batch_limit, 10);
    assert_eq!(cfg.delivery.failure_policy, DeliveryFailurePolicy::Requeue);
    assert_eq!(cfg.delivery.max_redelivery_count, 3);
}

#[test]
#[serial]
fn test_environment_overrides_missing_file() {
    temp_env::with_vars(
        [
            ("BROKER__NON_DURABLE_QUEUE_MAX_DEPTH", Some("42")),
            ("LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config_from("does/not/exist").expect("load_config failed");
            assert_eq!(cfg.broker.non_durable_queue_max_depth, 42);
            assert_eq!(cfg.logging.level, "debug");
            assert_eq!(cfg.delivery.worker_count, 5);
        },
    );
}
