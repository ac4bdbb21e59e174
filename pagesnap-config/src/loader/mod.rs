pub mod error;

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use pagesnap_core::{
    capture::CaptureSettings, fallback::FallbackSettings, queue::QueueSettings,
    worker::WorkerSettings,
};
use tracing::debug;

use crate::{
    models::{
        CaptureConfig, Config, ConfigMetadata, FallbackConfig, QueueConfig,
        RedisConfig, ResultsConfig, ServerConfig, StatusConfig, StorageConfig,
        WorkerConfig,
        sources::{EnvConfig, FileConfig},
    },
    validation::{self, ConfigWarnings},
};

pub use error::ConfigLoadError;

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["pagesnap.toml", "config/pagesnap.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, then layers the process environment over the TOML file
    /// over built-in defaults.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Same as [`ConfigLoader::load`] with an explicit environment layer and
    /// no `.env` handling.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file, config_path) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();

        if config_path.is_none() {
            warnings.push_with_hint(
                "No pagesnap.toml detected; using environment variables and defaults",
                "Set PAGESNAP_CONFIG or pass --config to use a configuration file",
            );
        }

        let config = compose_config(file.unwrap_or_default(), env, config_path);
        validation::validate(&config, &mut warnings)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let requested = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match requested {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let file_config = read_file_config(&path)?;
        debug!(path = %path.display(), "configuration file loaded");
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn secs(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}

fn millis(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_millis)
}

fn compose_config(file: FileConfig, env: EnvConfig, config_path: Option<PathBuf>) -> Config {
    let FileConfig {
        server: file_server,
        redis: file_redis,
        storage: file_storage,
        queue: file_queue,
        worker: file_worker,
        capture: file_capture,
        fallback: file_fallback,
        results: file_results,
        status: file_status,
    } = file;

    let capture_defaults = CaptureSettings::default();
    let worker_defaults = WorkerSettings::default();
    let queue_defaults = QueueSettings::default();
    let fallback_defaults = FallbackSettings::default();

    let port = env.server_port.or(file_server.port).unwrap_or(3000);
    let public_base_url = env
        .public_base_url
        .or(file_server.public_base_url)
        .unwrap_or_else(|| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port,
        role: env.role.or(file_server.role).unwrap_or_default(),
        public_base_url,
    };

    let redis = env
        .redis_url
        .map(|url| RedisConfig { url })
        .or_else(|| file_redis.map(|r| RedisConfig { url: r.url }));

    let storage = StorageConfig {
        root: env
            .storage_root
            .or(file_storage.root)
            .unwrap_or_else(|| PathBuf::from("./data/artifacts")),
        public_url: env
            .storage_public_url
            .or(file_storage.public_url)
            .unwrap_or_else(|| format!("{}/artifacts", server.public_base_url)),
    };

    let queue = QueueConfig {
        prefix: env
            .queue_prefix
            .or(file_queue.prefix)
            .unwrap_or(queue_defaults.prefix),
        remove_grace: env
            .queue_remove_grace
            .or(secs(file_queue.remove_grace_secs))
            .unwrap_or(Duration::from_secs(60)),
        max_stalled_count: env
            .queue_max_stalled_count
            .or(file_queue.max_stalled_count)
            .unwrap_or(queue_defaults.max_stalled_count),
        max_attempts: env
            .queue_max_attempts
            .or(file_queue.max_attempts)
            .unwrap_or(2),
    };

    let worker = WorkerConfig {
        concurrency: env
            .worker_concurrency
            .or(file_worker.concurrency)
            .unwrap_or(worker_defaults.concurrency),
        rate_limit_max: env
            .rate_limit_max
            .or(file_worker.rate_limit_max)
            .unwrap_or(worker_defaults.start_limit.max_starts),
        rate_limit_window: env
            .rate_limit_window
            .or(millis(file_worker.rate_limit_window_ms))
            .unwrap_or(worker_defaults.start_limit.window),
        lock_duration: env
            .lock_duration
            .or(secs(file_worker.lock_duration_secs))
            .unwrap_or(worker_defaults.lease.lock_duration),
        renew_at_fraction: env
            .renew_at_fraction
            .or(file_worker.renew_at_fraction)
            .unwrap_or(worker_defaults.lease.renew_at_fraction),
        renew_min_margin: env
            .renew_min_margin
            .or(millis(file_worker.renew_min_margin_ms))
            .unwrap_or(worker_defaults.lease.renew_min_margin),
        stalled_interval: env
            .stalled_interval
            .or(millis(file_worker.stalled_interval_ms))
            .unwrap_or(worker_defaults.stalled_interval),
        poll_interval: env
            .poll_interval
            .or(millis(file_worker.poll_interval_ms))
            .unwrap_or(worker_defaults.poll_interval),
    };

    let capture = CaptureConfig {
        timeout: env
            .capture_timeout
            .or(secs(file_capture.timeout_secs))
            .unwrap_or(capture_defaults.timeout),
        navigation_timeout: env
            .navigation_timeout
            .or(secs(file_capture.navigation_timeout_secs))
            .unwrap_or(capture_defaults.navigation_timeout),
        default_viewport: file_capture
            .default_viewport
            .unwrap_or(capture_defaults.default_viewport),
        mobile_viewport: file_capture
            .mobile_viewport
            .unwrap_or(capture_defaults.mobile_viewport),
        device_scale_factor: file_capture
            .device_scale_factor
            .unwrap_or(capture_defaults.device_scale_factor),
        mobile_scale_factor: file_capture
            .mobile_scale_factor
            .unwrap_or(capture_defaults.mobile_scale_factor),
        jpeg_quality: env
            .jpeg_quality
            .or(file_capture.jpeg_quality)
            .unwrap_or(capture_defaults.jpeg_quality),
        step_pause: env
            .scroll_step_pause
            .or(millis(file_capture.step_pause_ms))
            .unwrap_or(capture_defaults.scroll.step_pause),
        max_scroll_steps: env
            .max_scroll_steps
            .or(file_capture.max_scroll_steps)
            .unwrap_or(capture_defaults.scroll.max_steps),
        settle: env
            .settle
            .or(millis(file_capture.settle_ms))
            .unwrap_or(capture_defaults.settle),
        chrome_executable: env.chrome_executable.or(file_capture.chrome_executable),
    };

    let fallback = FallbackConfig {
        timeout: env
            .fallback_timeout
            .or(secs(file_fallback.timeout_secs))
            .unwrap_or(fallback_defaults.timeout),
        max_html_bytes: env
            .fallback_max_html_bytes
            .or(file_fallback.max_html_bytes)
            .unwrap_or(fallback_defaults.max_html_bytes),
        user_agent: env
            .fallback_user_agent
            .or(file_fallback.user_agent)
            .unwrap_or(fallback_defaults.user_agent),
    };

    let results = ResultsConfig {
        ttl: env
            .result_ttl
            .or(secs(file_results.ttl_secs))
            .unwrap_or(worker_defaults.result_ttl),
    };

    let status = StatusConfig {
        recheck_delay: env
            .status_recheck_delay
            .or(millis(file_status.recheck_delay_ms))
            .unwrap_or(Duration::from_millis(300)),
    };

    Config {
        server,
        redis,
        storage,
        queue,
        worker,
        capture,
        fallback,
        results,
        status,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    }
}
