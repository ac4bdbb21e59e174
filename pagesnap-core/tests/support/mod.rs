#![allow(dead_code)]

use std::{
    io::Cursor,
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use tokio_util::sync::CancellationToken;
use url::Url;

use pagesnap_core::{
    CaptureError, JobStatus, Result, StorageKey,
    capture::{
        BrowserBackend, BrowserPage, CaptureEngine, CaptureSettings, PageOptions,
        ScrollSettings, SnapshotOptions,
    },
    fallback::{FallbackResolver, HtmlFetcher},
    intake::IntakeService,
    limiter::{InMemoryStartLimiter, StartLimit},
    queue::{
        DequeueRequest, EnqueueOptions, InMemoryJobQueue, JobHandle, JobId,
        JobLease, JobQueue, JobRecord, JobState, LeaseId, LeaseRenewal,
        QueueCounts, QueueSettings, StalledScan,
    },
    request::{CaptureRequest, Viewport},
    results::{InMemoryResultStore, ResultRecord},
    ssrf::{SsrfGuard, StaticResolver},
    status::StatusPoller,
    storage::{InMemoryObjectStore, ObjectStore},
    worker::{JobProcessor, LeaseSettings, WorkerPool, WorkerSettings},
};

pub const PUBLIC_HOST: &str = "example.com";
pub const PRIVATE_HOST: &str = "intranet.test";

/// Browser that renders a solid image sized to the emulated viewport.
#[derive(Debug, Default)]
pub struct FakeBrowser {
    failure: Mutex<Option<String>>,
    navigate_delay: Duration,
    panic_next: Arc<AtomicBool>,
    pages_opened: AtomicUsize,
    pages_closed: Arc<AtomicUsize>,
    open_now: Arc<AtomicUsize>,
    peak_open: Arc<AtomicUsize>,
}

impl FakeBrowser {
    /// Every navigation takes `delay` before it completes.
    pub fn slow(delay: Duration) -> Self {
        Self {
            navigate_delay: delay,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        let browser = Self::default();
        browser.set_failure(Some(message));
        browser
    }

    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock().unwrap() = message.map(str::to_string);
    }

    /// The next navigation panics instead of returning.
    pub fn panic_on_next_navigation(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.pages_closed.load(Ordering::SeqCst)
    }

    /// Most pages ever open at the same time.
    pub fn peak_open_pages(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserBackend for FakeBrowser {
    async fn new_page(&self, options: &PageOptions) -> Result<Box<dyn BrowserPage>> {
        self.pages_opened.fetch_add(1, Ordering::SeqCst);
        let open = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            viewport: options.viewport,
            failure: self.failure.lock().unwrap().clone(),
            navigate_delay: self.navigate_delay,
            panic_next: Arc::clone(&self.panic_next),
            closed: Arc::clone(&self.pages_closed),
            open_now: Arc::clone(&self.open_now),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct FakePage {
    viewport: Viewport,
    failure: Option<String>,
    navigate_delay: Duration,
    panic_next: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
    open_now: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn navigate(&self, _url: &str) -> Result<()> {
        tokio::time::sleep(self.navigate_delay).await;
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("renderer crashed while loading the page");
        }
        match &self.failure {
            Some(message) => Err(CaptureError::CaptureEngine(message.clone())),
            None => Ok(()),
        }
    }

    async fn wait_for_load(&self) -> Result<()> {
        Ok(())
    }

    async fn inject_style(&self, _css: &str) -> Result<()> {
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        if script.starts_with("Math.max") {
            return Ok(serde_json::json!(self.viewport.height));
        }
        Ok(serde_json::Value::Null)
    }

    async fn screenshot(&self, options: SnapshotOptions) -> Result<Vec<u8>> {
        let height = if options.full_page {
            self.viewport.height * 2
        } else {
            self.viewport.height
        };
        let img = RgbImage::from_pixel(self.viewport.width, height, image::Rgb([20, 90, 160]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .map_err(|e| CaptureError::CaptureEngine(e.to_string()))?;
        Ok(out.into_inner())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.open_now.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Queue whose lease renewals always fail, as when the backend connection
/// keeps dropping. Everything else reaches the wrapped queue.
#[derive(Debug)]
pub struct RenewalOutage(pub Arc<InMemoryJobQueue>);

#[async_trait]
impl JobQueue for RenewalOutage {
    async fn add(
        &self,
        id: &JobId,
        payload: &CaptureRequest,
        options: EnqueueOptions,
    ) -> Result<JobHandle> {
        self.0.add(id, payload, options).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        self.0.get(id).await
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        self.0.dequeue(request).await
    }

    async fn renew(&self, _renewal: LeaseRenewal) -> Result<JobLease> {
        Err(CaptureError::Queue("connection reset".into()))
    }

    async fn complete(&self, id: &JobId, lease_id: LeaseId, result: &ResultRecord) -> Result<()> {
        self.0.complete(id, lease_id, result).await
    }

    async fn fail(
        &self,
        id: &JobId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> Result<JobState> {
        self.0.fail(id, lease_id, error, retryable).await
    }

    async fn scan_stalled(&self) -> Result<StalledScan> {
        self.0.scan_stalled().await
    }

    async fn counts(&self) -> Result<QueueCounts> {
        self.0.counts().await
    }
}

/// Object store that rejects every write.
#[derive(Debug)]
pub struct ReadOnlyObjects {
    inner: Arc<InMemoryObjectStore>,
    put_attempts: AtomicUsize,
}

impl ReadOnlyObjects {
    pub fn new(inner: Arc<InMemoryObjectStore>) -> Self {
        Self {
            inner,
            put_attempts: AtomicUsize::new(0),
        }
    }

    pub fn put_attempts(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for ReadOnlyObjects {
    async fn put(&self, _key: &StorageKey, _bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        Err(CaptureError::Storage("read-only file system".into()))
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool> {
        self.inner.exists(key).await
    }

    fn public_url(&self, key: &StorageKey) -> String {
        self.inner.public_url(key)
    }
}

/// Serves one fixed document, or fails when none is configured.
#[derive(Debug, Default)]
pub struct CannedHtml(pub Option<String>);

#[async_trait]
impl HtmlFetcher for CannedHtml {
    async fn fetch_html(&self, url: &Url) -> Result<String> {
        self.0
            .clone()
            .ok_or_else(|| CaptureError::FallbackExhausted(format!("{url} unreachable")))
    }
}

pub fn resolver() -> StaticResolver {
    StaticResolver::new()
        .with_host(PUBLIC_HOST, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        .with_host(PRIVATE_HOST, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
}

pub fn capture_settings() -> CaptureSettings {
    CaptureSettings {
        settle: Duration::ZERO,
        scroll: ScrollSettings {
            step_pause: Duration::from_millis(1),
            max_steps: 5,
        },
        ..CaptureSettings::default()
    }
}

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        concurrency: 2,
        lease: LeaseSettings {
            lock_duration: Duration::from_secs(5),
            ..LeaseSettings::default()
        },
        start_limit: StartLimit {
            max_starts: 100,
            window: Duration::from_secs(60),
        },
        stalled_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        result_ttl: Duration::from_secs(60),
    }
}

/// Everything wired against in-memory backends.
pub struct Harness {
    pub intake: IntakeService,
    pub poller: StatusPoller,
    pub pool: WorkerPool,
    pub queue: Arc<InMemoryJobQueue>,
    pub results: Arc<InMemoryResultStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub browser: Arc<FakeBrowser>,
    pub shutdown: CancellationToken,
}

pub fn harness(browser: FakeBrowser, preview_html: Option<&str>) -> Harness {
    harness_with(
        browser,
        preview_html,
        worker_settings(),
        |queue| queue as Arc<dyn JobQueue>,
        |objects| objects as Arc<dyn ObjectStore>,
    )
}

/// Like [`harness`], but the worker pool sees the queue and object store
/// through the given wrappers while intake and the poller use them directly.
pub fn harness_with(
    browser: FakeBrowser,
    preview_html: Option<&str>,
    settings: WorkerSettings,
    pool_queue: impl FnOnce(Arc<InMemoryJobQueue>) -> Arc<dyn JobQueue>,
    pool_objects: impl FnOnce(Arc<InMemoryObjectStore>) -> Arc<dyn ObjectStore>,
) -> Harness {
    let queue = Arc::new(InMemoryJobQueue::new(QueueSettings::default()));
    let results = Arc::new(InMemoryResultStore::new());
    let objects = Arc::new(InMemoryObjectStore::new("https://cdn.test/shots"));
    let browser = Arc::new(browser);
    let shutdown = CancellationToken::new();

    let intake = IntakeService::new(
        SsrfGuard::new(Arc::new(resolver())),
        objects.clone(),
        queue.clone(),
        EnqueueOptions::default(),
    );
    let poller = StatusPoller::new(
        results.clone(),
        queue.clone(),
        Duration::from_millis(5),
        settings.result_ttl,
    );

    let engine = CaptureEngine::new(browser.clone(), capture_settings());
    let fallback = FallbackResolver::new(Arc::new(CannedHtml(
        preview_html.map(str::to_string),
    )));
    let processor = JobProcessor::new(engine, pool_objects(objects.clone()), fallback);
    let limiter = Arc::new(InMemoryStartLimiter::new(settings.start_limit));
    let pool = WorkerPool::new(
        pool_queue(queue.clone()),
        results.clone(),
        limiter,
        processor,
        settings,
        shutdown.clone(),
    );

    Harness {
        intake,
        poller,
        pool,
        queue,
        results,
        objects,
        browser,
        shutdown,
    }
}

/// Polls until the job reaches `done` or `error`.
pub async fn wait_for_outcome(poller: &StatusPoller, id: &JobId) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = poller.poll(id).await.expect("status poll");
        match status {
            JobStatus::Done { .. } | JobStatus::Error { .. } => return status,
            _ if Instant::now() > deadline => panic!("job {id} still {status:?}"),
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
}
