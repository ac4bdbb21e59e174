use std::{fmt, time::Duration};

use thiserror::Error;
use url::Url;

use crate::models::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(hint) => write!(f, "{} ({hint})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Non-fatal findings collected while loading configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

/// Settings that would leave the service broken.
#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("worker concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("rate limit must allow at least one start per window")]
    ZeroRateLimit,
    #[error(
        "lock duration ({lock:?}) must exceed the capture timeout ({capture:?}); \
         shorter locks expire mid-capture and every job stalls"
    )]
    LockShorterThanCapture { lock: Duration, capture: Duration },
    #[error("renew_at_fraction must be between 0 and 1 (exclusive), got {0}")]
    RenewFractionOutOfRange(f32),
    #[error("jpeg_quality must be between 1 and 100, got {0}")]
    JpegQualityOutOfRange(u8),
    #[error("{name} viewport must have positive dimensions")]
    EmptyViewport { name: &'static str },
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("invalid {name} '{value}'")]
    InvalidUrl {
        name: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
}

pub fn validate(
    config: &Config,
    warnings: &mut ConfigWarnings,
) -> Result<(), ConfigGuardRailError> {
    let worker = &config.worker;
    if worker.concurrency == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrency);
    }
    if worker.rate_limit_max == 0 {
        return Err(ConfigGuardRailError::ZeroRateLimit);
    }
    if worker.lock_duration <= config.capture.timeout {
        return Err(ConfigGuardRailError::LockShorterThanCapture {
            lock: worker.lock_duration,
            capture: config.capture.timeout,
        });
    }
    if !(worker.renew_at_fraction > 0.0 && worker.renew_at_fraction < 1.0) {
        return Err(ConfigGuardRailError::RenewFractionOutOfRange(
            worker.renew_at_fraction,
        ));
    }
    if !(1..=100).contains(&config.capture.jpeg_quality) {
        return Err(ConfigGuardRailError::JpegQualityOutOfRange(
            config.capture.jpeg_quality,
        ));
    }
    for (name, viewport) in [
        ("default", config.capture.default_viewport),
        ("mobile", config.capture.mobile_viewport),
    ] {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(ConfigGuardRailError::EmptyViewport { name });
        }
    }
    if config.queue.max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroAttempts);
    }
    for (name, value) in [
        ("public_base_url", &config.server.public_base_url),
        ("storage public_url", &config.storage.public_url),
    ] {
        Url::parse(value).map_err(|source| ConfigGuardRailError::InvalidUrl {
            name,
            value: value.clone(),
            source,
        })?;
    }

    if config.redis.is_none() {
        warnings.push_with_hint(
            "No Redis URL configured; queue and result records are held in memory",
            "Set REDIS_URL to share jobs between API and worker processes",
        );
    }
    if config.queue.max_stalled_count > 1 {
        warnings.push(format!(
            "max_stalled_count is {}; a crashing page may be retried that many times",
            config.queue.max_stalled_count
        ));
    }
    if worker.lock_duration < worker.renew_min_margin * 2 {
        warnings.push("lock duration is shorter than twice the renew margin");
    }

    Ok(())
}
