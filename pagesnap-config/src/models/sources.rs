use std::{path::PathBuf, str::FromStr, time::Duration};

use pagesnap_core::request::Viewport;
use serde::{Deserialize, Serialize};

use crate::util::{non_empty, parse_duration};

use super::Role;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub queue: FileQueueConfig,
    #[serde(default)]
    pub worker: FileWorkerConfig,
    #[serde(default)]
    pub capture: FileCaptureConfig,
    #[serde(default)]
    pub fallback: FileFallbackConfig,
    #[serde(default)]
    pub results: FileResultsConfig,
    #[serde(default)]
    pub status: FileStatusConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileQueueConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_grace_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stalled_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_at_fraction: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_min_margin_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalled_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCaptureConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_viewport: Option<Viewport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_viewport: Option<Viewport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_scale_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_scale_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jpeg_quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_pause_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_scroll_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_executable: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileFallbackConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_html_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileResultsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStatusConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recheck_delay_ms: Option<u64>,
}

/// Environment-derived configuration values.
///
/// Duration variables accept humantime strings (`"90s"`, `"2m"`); bare
/// integers use the unit of the matching file key.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub public_base_url: Option<String>,
    pub role: Option<Role>,
    pub redis_url: Option<String>,
    pub storage_root: Option<PathBuf>,
    pub storage_public_url: Option<String>,
    pub queue_prefix: Option<String>,
    pub queue_remove_grace: Option<Duration>,
    pub queue_max_stalled_count: Option<u32>,
    pub queue_max_attempts: Option<u32>,
    pub worker_concurrency: Option<usize>,
    pub rate_limit_max: Option<u32>,
    pub rate_limit_window: Option<Duration>,
    pub lock_duration: Option<Duration>,
    pub renew_at_fraction: Option<f32>,
    pub renew_min_margin: Option<Duration>,
    pub stalled_interval: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub capture_timeout: Option<Duration>,
    pub navigation_timeout: Option<Duration>,
    pub jpeg_quality: Option<u8>,
    pub scroll_step_pause: Option<Duration>,
    pub max_scroll_steps: Option<u32>,
    pub settle: Option<Duration>,
    pub chrome_executable: Option<PathBuf>,
    pub fallback_timeout: Option<Duration>,
    pub fallback_max_html_bytes: Option<usize>,
    pub fallback_user_agent: Option<String>,
    pub result_ttl: Option<Duration>,
    pub status_recheck_delay: Option<Duration>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the environment layer from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).and_then(non_empty);
        let secs = |name: &str| {
            var(name).and_then(|s| parse_duration(&s, Duration::from_secs(1)))
        };
        let millis = |name: &str| {
            var(name).and_then(|s| parse_duration(&s, Duration::from_millis(1)))
        };

        Self {
            config_path: var("PAGESNAP_CONFIG").map(PathBuf::from),
            server_host: var("SERVER_HOST"),
            server_port: parse_value(var("SERVER_PORT")),
            public_base_url: var("PUBLIC_BASE_URL"),
            role: var("PAGESNAP_ROLE").and_then(|s| Role::parse(&s)),
            redis_url: var("REDIS_URL"),
            storage_root: var("STORAGE_ROOT").map(PathBuf::from),
            storage_public_url: var("STORAGE_PUBLIC_URL"),
            queue_prefix: var("QUEUE_PREFIX"),
            queue_remove_grace: secs("QUEUE_REMOVE_GRACE"),
            queue_max_stalled_count: parse_value(var("QUEUE_MAX_STALLED_COUNT")),
            queue_max_attempts: parse_value(var("QUEUE_MAX_ATTEMPTS")),
            worker_concurrency: parse_value(var("WORKER_CONCURRENCY")),
            rate_limit_max: parse_value(var("RATE_LIMIT_MAX")),
            rate_limit_window: millis("RATE_LIMIT_WINDOW"),
            lock_duration: secs("LOCK_DURATION"),
            renew_at_fraction: parse_value(var("RENEW_AT_FRACTION")),
            renew_min_margin: millis("RENEW_MIN_MARGIN"),
            stalled_interval: millis("STALLED_INTERVAL"),
            poll_interval: millis("POLL_INTERVAL"),
            capture_timeout: secs("CAPTURE_TIMEOUT"),
            navigation_timeout: secs("NAVIGATION_TIMEOUT"),
            jpeg_quality: parse_value(var("JPEG_QUALITY")),
            scroll_step_pause: millis("SCROLL_STEP_PAUSE"),
            max_scroll_steps: parse_value(var("MAX_SCROLL_STEPS")),
            settle: millis("SETTLE_DELAY"),
            chrome_executable: var("CHROME_EXECUTABLE").map(PathBuf::from),
            fallback_timeout: secs("FALLBACK_TIMEOUT"),
            fallback_max_html_bytes: parse_value(var("FALLBACK_MAX_HTML_BYTES")),
            fallback_user_agent: var("FALLBACK_USER_AGENT"),
            result_ttl: secs("RESULT_TTL"),
            status_recheck_delay: millis("STATUS_RECHECK_DELAY"),
        }
    }
}

fn parse_value<T: FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| s.parse().ok())
}
