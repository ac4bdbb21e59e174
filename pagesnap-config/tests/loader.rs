use std::{collections::HashMap, fs, time::Duration};

use pagesnap_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, EnvConfig, Role,
};
use pagesnap_core::request::Viewport;
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("pagesnap.toml");
    fs::write(&path, contents).expect("write config");
    path
}

fn env(vars: &[(&str, &str)]) -> EnvConfig {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    EnvConfig::from_lookup(|name| map.get(name).cloned())
}

#[test]
fn defaults_apply_without_file_or_env() {
    let load = ConfigLoader::new()
        .load_with_env(EnvConfig::default())
        .expect("defaults are valid");
    let config = load.config;

    assert_eq!(config.server.port, 3000);
    assert_eq!(config.server.public_base_url, "http://localhost:3000");
    assert_eq!(config.server.role, Role::All);
    assert_eq!(config.storage.public_url, "http://localhost:3000/artifacts");
    assert!(config.redis.is_none());
    assert_eq!(config.queue.prefix, "pagesnap");
    assert_eq!(config.queue.max_attempts, 2);
    assert_eq!(config.queue.max_stalled_count, 1);
    assert_eq!(config.worker.concurrency, 2);
    assert_eq!(config.worker.rate_limit_max, 10);
    assert_eq!(config.worker.lock_duration, Duration::from_secs(120));
    assert_eq!(config.capture.timeout, Duration::from_secs(60));
    assert_eq!(config.capture.default_viewport, Viewport::new(1280, 800));
    assert_eq!(config.results.ttl, Duration::from_secs(259_200));
    assert_eq!(config.status.recheck_delay, Duration::from_millis(300));

    let messages: Vec<String> = load.warnings.iter().map(|w| w.message.clone()).collect();
    assert!(messages.iter().any(|m| m.contains("No pagesnap.toml")));
    assert!(messages.iter().any(|m| m.contains("No Redis URL")));
}

#[test]
fn file_values_are_applied() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[server]
port = 8080
public_base_url = "https://shots.example.com/"
role = "worker"

[redis]
url = "redis://cache:6379"

[storage]
root = "/var/lib/pagesnap"

[queue]
prefix = "snap"
max_attempts = 3

[worker]
concurrency = 4
lock_duration_secs = 180
stalled_interval_ms = 10000

[capture]
timeout_secs = 45
default_viewport = { width = 1440, height = 900 }
jpeg_quality = 70

[results]
ttl_secs = 3600
"#,
    );

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .expect("valid config");
    let config = load.config;

    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.server.public_base_url, "https://shots.example.com");
    assert_eq!(config.server.role, Role::Worker);
    assert_eq!(
        config.storage.public_url,
        "https://shots.example.com/artifacts"
    );
    assert_eq!(config.redis.unwrap().url, "redis://cache:6379");
    assert_eq!(config.queue.prefix, "snap");
    assert_eq!(config.queue.max_attempts, 3);
    assert_eq!(config.worker.concurrency, 4);
    assert_eq!(config.worker.stalled_interval, Duration::from_secs(10));
    assert_eq!(config.capture.timeout, Duration::from_secs(45));
    assert_eq!(config.capture.default_viewport, Viewport::new(1440, 900));
    assert_eq!(config.capture.jpeg_quality, 70);
    assert_eq!(config.results.ttl, Duration::from_secs(3600));
    assert!(
        load.warnings
            .iter()
            .all(|w| !w.message.contains("No Redis URL"))
    );
}

#[test]
fn environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[server]
port = 8080

[worker]
concurrency = 4
"#,
    );

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env(&[
            ("SERVER_PORT", "9090"),
            ("WORKER_CONCURRENCY", "8"),
            ("LOCK_DURATION", "3m"),
            ("RATE_LIMIT_WINDOW", "30s"),
            ("POLL_INTERVAL", "500"),
            ("PAGESNAP_ROLE", "API"),
            ("REDIS_URL", "redis://localhost"),
        ]))
        .expect("valid config")
        .config;

    assert_eq!(config.server.port, 9090);
    assert_eq!(config.server.role, Role::Api);
    assert_eq!(config.worker.concurrency, 8);
    assert_eq!(config.worker.lock_duration, Duration::from_secs(180));
    assert_eq!(config.worker.rate_limit_window, Duration::from_secs(30));
    assert_eq!(config.worker.poll_interval, Duration::from_millis(500));
    assert_eq!(config.redis.unwrap().url, "redis://localhost");
}

#[test]
fn config_path_from_environment_is_used() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[server]\nport = 7000\n");

    let config = ConfigLoader::new()
        .load_with_env(env(&[("PAGESNAP_CONFIG", path.to_str().unwrap())]))
        .expect("valid config")
        .config;
    assert_eq!(config.server.port, 7000);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::new()
        .with_config_path(dir.path().join("absent.toml"))
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[server\nport = ");
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
}

#[test]
fn lock_must_outlast_capture_timeout() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[worker]\nlock_duration_secs = 30\n");
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::LockShorterThanCapture { .. })
    ));
}

#[test]
fn zero_concurrency_is_rejected() {
    let err = ConfigLoader::new()
        .load_with_env(env(&[("WORKER_CONCURRENCY", "0")]))
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::ZeroConcurrency)
    ));
}

#[test]
fn renew_fraction_must_be_a_proper_fraction() {
    let err = ConfigLoader::new()
        .load_with_env(env(&[("RENEW_AT_FRACTION", "1.5")]))
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::RenewFractionOutOfRange(_))
    ));
}

#[test]
fn loose_stall_budget_is_warned_about() {
    let load = ConfigLoader::new()
        .load_with_env(env(&[("QUEUE_MAX_STALLED_COUNT", "3")]))
        .expect("valid config");
    assert!(
        load.warnings
            .iter()
            .any(|w| w.message.contains("max_stalled_count"))
    );
}

#[test]
fn settings_follow_config() {
    let config = ConfigLoader::new()
        .load_with_env(env(&[
            ("WORKER_CONCURRENCY", "3"),
            ("RATE_LIMIT_MAX", "5"),
            ("QUEUE_REMOVE_GRACE", "2m"),
            ("JPEG_QUALITY", "90"),
        ]))
        .expect("valid config")
        .config;

    let worker = config.worker_settings();
    assert_eq!(worker.concurrency, 3);
    assert_eq!(worker.start_limit.max_starts, 5);
    assert_eq!(worker.result_ttl, config.results.ttl);

    let options = config.enqueue_options();
    assert_eq!(options.max_attempts, 2);
    assert_eq!(options.remove_after, Some(Duration::from_secs(120)));

    assert_eq!(config.capture_settings().jpeg_quality, 90);
    assert_eq!(config.queue_settings().prefix, "pagesnap");
}
