//! Backend selection and service wiring shared by `main` and tests.

use std::sync::Arc;

use anyhow::Context;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pagesnap_config::Config;
use pagesnap_core::{
    IntakeService, StatusPoller,
    capture::{BrowserBackend, CaptureEngine},
    fallback::FallbackResolver,
    limiter::{InMemoryStartLimiter, RedisStartLimiter, StartLimiter},
    queue::{InMemoryJobQueue, JobQueue, RedisJobQueue},
    results::{InMemoryResultStore, RedisResultStore, ResultStore},
    ssrf::SsrfGuard,
    storage::{LocalObjectStore, ObjectStore},
    worker::{JobProcessor, WorkerPool},
};

use super::app_state::AppState;

/// Durable collaborators shared by the API and the workers.
#[derive(Clone, Debug)]
pub struct Backends {
    pub queue: Arc<dyn JobQueue>,
    pub results: Arc<dyn ResultStore>,
    pub limiter: Arc<dyn StartLimiter>,
    pub objects: Arc<dyn ObjectStore>,
}

impl Backends {
    /// Redis-backed when a URL is configured, otherwise process-local.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let Some(redis_config) = config.redis.as_ref() else {
            warn!("No Redis configured; jobs and results live in this process only");
            return Ok(Self::in_memory(config));
        };

        info!("Connecting to Redis at {}", redis_config.url);
        let client = redis::Client::open(redis_config.url.as_str())
            .context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        info!("Successfully connected to Redis");

        let settings = config.queue_settings();
        let start_limit = config.worker_settings().start_limit;
        Ok(Self {
            limiter: Arc::new(RedisStartLimiter::new(
                conn.clone(),
                &settings.prefix,
                start_limit,
            )),
            results: Arc::new(RedisResultStore::new(conn.clone(), settings.prefix.clone())),
            queue: Arc::new(RedisJobQueue::new(conn, settings)),
            objects: local_objects(config),
        })
    }

    pub fn in_memory(config: &Config) -> Self {
        Self {
            queue: Arc::new(InMemoryJobQueue::new(config.queue_settings())),
            results: Arc::new(InMemoryResultStore::new()),
            limiter: Arc::new(InMemoryStartLimiter::new(
                config.worker_settings().start_limit,
            )),
            objects: local_objects(config),
        }
    }
}

fn local_objects(config: &Config) -> Arc<dyn ObjectStore> {
    Arc::new(LocalObjectStore::new(
        config.storage.root.clone(),
        config.storage.public_url.clone(),
    ))
}

pub fn build_state(config: &Config, backends: &Backends, guard: SsrfGuard) -> AppState {
    let intake = IntakeService::new(
        guard,
        Arc::clone(&backends.objects),
        Arc::clone(&backends.queue),
        config.enqueue_options(),
    );
    let status = StatusPoller::new(
        Arc::clone(&backends.results),
        Arc::clone(&backends.queue),
        config.status.recheck_delay,
        config.results.ttl,
    );
    AppState::new(intake, status, &config.server.public_base_url)
}

pub fn build_worker_pool(
    config: &Config,
    backends: &Backends,
    browser: Arc<dyn BrowserBackend>,
    guard: SsrfGuard,
    shutdown: CancellationToken,
) -> anyhow::Result<WorkerPool> {
    let engine = CaptureEngine::new(browser, config.capture_settings());
    let fallback = FallbackResolver::http(&config.fallback_settings(), guard)
        .context("failed to build preview-image HTTP client")?;
    let processor = JobProcessor::new(engine, Arc::clone(&backends.objects), fallback);

    Ok(WorkerPool::new(
        Arc::clone(&backends.queue),
        Arc::clone(&backends.results),
        Arc::clone(&backends.limiter),
        processor,
        config.worker_settings(),
        shutdown,
    ))
}
