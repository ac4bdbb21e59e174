pub mod sources;

use std::{fmt, path::PathBuf, time::Duration};

use pagesnap_core::{
    capture::{CaptureSettings, ScrollSettings},
    fallback::FallbackSettings,
    limiter::StartLimit,
    queue::{EnqueueOptions, QueueSettings},
    request::Viewport,
    worker::{LeaseSettings, WorkerSettings},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: Option<RedisConfig>,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub capture: CaptureConfig,
    pub fallback: FallbackConfig,
    pub results: ResultsConfig,
    pub status: StatusConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.storage.root)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            prefix: self.queue.prefix.clone(),
            max_stalled_count: self.queue.max_stalled_count,
        }
    }

    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            max_attempts: self.queue.max_attempts,
            remove_after: Some(self.queue.remove_grace),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let worker = &self.worker;
        WorkerSettings {
            concurrency: worker.concurrency,
            lease: LeaseSettings {
                lock_duration: worker.lock_duration,
                renew_at_fraction: worker.renew_at_fraction,
                renew_min_margin: worker.renew_min_margin,
            },
            start_limit: StartLimit {
                max_starts: worker.rate_limit_max,
                window: worker.rate_limit_window,
            },
            stalled_interval: worker.stalled_interval,
            poll_interval: worker.poll_interval,
            result_ttl: self.results.ttl,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        let capture = &self.capture;
        CaptureSettings {
            timeout: capture.timeout,
            navigation_timeout: capture.navigation_timeout,
            default_viewport: capture.default_viewport,
            mobile_viewport: capture.mobile_viewport,
            device_scale_factor: capture.device_scale_factor,
            mobile_scale_factor: capture.mobile_scale_factor,
            jpeg_quality: capture.jpeg_quality,
            settle: capture.settle,
            scroll: ScrollSettings {
                step_pause: capture.step_pause,
                max_steps: capture.max_scroll_steps,
            },
            ..CaptureSettings::default()
        }
    }

    pub fn fallback_settings(&self) -> FallbackSettings {
        FallbackSettings {
            timeout: self.fallback.timeout,
            max_html_bytes: self.fallback.max_html_bytes,
            user_agent: self.fallback.user_agent.clone(),
        }
    }
}

/// Which halves of the service this process runs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// HTTP API and workers in one process.
    #[default]
    All,
    Api,
    Worker,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Role::All),
            "api" => Some(Role::Api),
            "worker" => Some(Role::Worker),
            _ => None,
        }
    }

    pub fn runs_api(self) -> bool {
        matches!(self, Role::All | Role::Api)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::All => "all",
            Role::Api => "api",
            Role::Worker => "worker",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally visible origin, used for status and artifact URLs.
    pub public_base_url: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub prefix: String,
    pub remove_grace: Duration,
    pub max_stalled_count: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    pub lock_duration: Duration,
    pub renew_at_fraction: f32,
    pub renew_min_margin: Duration,
    pub stalled_interval: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub timeout: Duration,
    pub navigation_timeout: Duration,
    pub default_viewport: Viewport,
    pub mobile_viewport: Viewport,
    pub device_scale_factor: f64,
    pub mobile_scale_factor: f64,
    pub jpeg_quality: u8,
    pub step_pause: Duration,
    pub max_scroll_steps: u32,
    pub settle: Duration,
    pub chrome_executable: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub timeout: Duration,
    pub max_html_bytes: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct ResultsConfig {
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub recheck_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
