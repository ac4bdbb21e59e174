#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::Cursor,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use image::{ImageFormat, RgbImage};
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use pagesnap_config::{Config, ConfigLoader, EnvConfig};
use pagesnap_core::{
    CaptureError, Result,
    capture::{BrowserBackend, BrowserPage, PageOptions, SnapshotOptions},
    request::Viewport,
    ssrf::{SsrfGuard, StaticResolver},
    worker::WorkerPool,
};
use pagesnap_server::{
    infra::startup::{Backends, build_state, build_worker_pool},
    routes::create_app,
};

pub const BASE_URL: &str = "http://pagesnap.test";

#[derive(Debug, Default)]
pub struct SolidBrowser;

#[async_trait]
impl BrowserBackend for SolidBrowser {
    async fn new_page(&self, options: &PageOptions) -> Result<Box<dyn BrowserPage>> {
        Ok(Box::new(SolidPage {
            viewport: options.viewport,
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct SolidPage {
    viewport: Viewport,
}

#[async_trait]
impl BrowserPage for SolidPage {
    async fn navigate(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn wait_for_load(&self) -> Result<()> {
        Ok(())
    }

    async fn inject_style(&self, _css: &str) -> Result<()> {
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!(self.viewport.height))
    }

    async fn screenshot(&self, _options: SnapshotOptions) -> Result<Vec<u8>> {
        let img = RgbImage::from_pixel(
            self.viewport.width,
            self.viewport.height,
            image::Rgb([240, 240, 240]),
        );
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .map_err(|e| CaptureError::CaptureEngine(e.to_string()))?;
        Ok(out.into_inner())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub config: Config,
    pub backends: Backends,
    pub guard: SsrfGuard,
    pub shutdown: CancellationToken,
    _artifacts: TempDir,
}

impl TestApp {
    pub fn start_workers(&self) -> WorkerPool {
        build_worker_pool(
            &self.config,
            &self.backends,
            Arc::new(SolidBrowser),
            self.guard.clone(),
            self.shutdown.clone(),
        )
        .expect("worker pool")
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        self.send(Request::get(path).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &str,
        key: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::post(path).header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("Idempotency-Key", key);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }
}

pub fn test_app() -> TestApp {
    let artifacts = TempDir::new().expect("tempdir");
    let vars: HashMap<&str, String> = HashMap::from([
        ("PUBLIC_BASE_URL", BASE_URL.to_string()),
        ("STORAGE_ROOT", artifacts.path().display().to_string()),
        ("STATUS_RECHECK_DELAY", "1".to_string()),
        ("POLL_INTERVAL", "10".to_string()),
        ("STALLED_INTERVAL", "100".to_string()),
        ("SETTLE_DELAY", "0".to_string()),
        ("SCROLL_STEP_PAUSE", "1".to_string()),
    ]);
    let env = EnvConfig::from_lookup(|name| vars.get(name).cloned());
    let config = ConfigLoader::new()
        .load_with_env(env)
        .expect("test config")
        .config;

    let backends = Backends::in_memory(&config);
    let resolver = StaticResolver::new()
        .with_host("example.com", IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        .with_host("metadata.internal", IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)));
    let guard = SsrfGuard::new(Arc::new(resolver));
    let state = build_state(&config, &backends, guard.clone());
    let router = create_app(state, Some(config.storage.root.clone()));

    TestApp {
        router,
        config,
        backends,
        guard,
        shutdown: CancellationToken::new(),
        _artifacts: artifacts,
    }
}
