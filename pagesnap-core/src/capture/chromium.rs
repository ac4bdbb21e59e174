//! Headless Chromium backend over the DevTools protocol.

use std::{fmt, path::PathBuf, time::Duration};

use async_trait::async_trait;
use chromiumoxide::{
    Page,
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::{
        emulation::{SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams},
        network::SetUserAgentOverrideParams,
    },
    page::ScreenshotParams,
};
use futures::StreamExt;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{BrowserBackend, BrowserPage, PageOptions, SnapshotOptions};
use crate::{
    error::{CaptureError, Result},
    request::Viewport,
};

fn engine_err(context: &str, err: impl fmt::Display) -> CaptureError {
    CaptureError::CaptureEngine(format!("{context}: {err}"))
}

#[derive(Clone, Debug)]
pub struct ChromiumOptions {
    pub executable: Option<PathBuf>,
    pub window: Viewport,
    pub request_timeout: Duration,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            executable: None,
            window: Viewport::new(1280, 800),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// One browser process shared by every page of a worker.
pub struct ChromiumBackend {
    browser: Mutex<Option<Browser>>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ChromiumBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChromiumBackend")
            .field("browser", &"Browser")
            .finish()
    }
}

impl ChromiumBackend {
    pub async fn launch(options: ChromiumOptions) -> Result<Self> {
        info!("Launching headless browser");

        let mut builder = BrowserConfig::builder()
            .window_size(options.window.width, options.window.height)
            .request_timeout(options.request_timeout)
            .no_sandbox()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-extensions")
            .arg("--mute-audio")
            .arg("--hide-scrollbars");
        if let Some(path) = options.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| engine_err("invalid browser config", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| engine_err("failed to launch browser", e))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            handler: Mutex::new(Some(handler)),
        })
    }

    async fn emulate(page: &Page, options: &PageOptions) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(options.viewport.width))
            .height(i64::from(options.viewport.height))
            .device_scale_factor(options.device_scale_factor)
            .mobile(options.mobile)
            .build()
            .map_err(|e| engine_err("invalid device metrics", e))?;
        page.execute(metrics)
            .await
            .map_err(|e| engine_err("device metrics override failed", e))?;

        if options.mobile {
            page.execute(SetTouchEmulationEnabledParams::new(true))
                .await
                .map_err(|e| engine_err("touch emulation failed", e))?;
        }

        if let Some(user_agent) = &options.user_agent {
            page.execute(SetUserAgentOverrideParams {
                user_agent: user_agent.clone(),
                accept_language: None,
                platform: None,
                user_agent_metadata: None,
            })
            .await
            .map_err(|e| engine_err("user agent override failed", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn new_page(&self, options: &PageOptions) -> Result<Box<dyn BrowserPage>> {
        let page = {
            let guard = self.browser.lock().await;
            let browser = guard
                .as_ref()
                .ok_or_else(|| CaptureError::CaptureEngine("browser is shut down".into()))?;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| engine_err("failed to open page", e))?
        };

        if let Err(err) = Self::emulate(&page, options).await {
            let _ = page.close().await;
            return Err(err);
        }
        Ok(Box::new(ChromiumPage { page }))
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            info!("Closing headless browser");
            if let Err(e) = browser.close().await {
                warn!("browser close failed: {e}");
            }
            let _ = browser.wait().await;
        }
        if let Some(handler) = self.handler.lock().await.take() {
            handler.abort();
        }
        Ok(())
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| engine_err("navigation failed", e))?;
        Ok(())
    }

    async fn wait_for_load(&self) -> Result<()> {
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| engine_err("page load failed", e))?;
        Ok(())
    }

    async fn inject_style(&self, css: &str) -> Result<()> {
        let literal = serde_json::to_string(css)?;
        let script = format!(
            "(() => {{ const s = document.createElement('style'); \
             s.setAttribute('data-pagesnap', ''); s.textContent = {literal}; \
             (document.head || document.documentElement).appendChild(s); return true; }})()"
        );
        self.evaluate(&script).await.map(|_| ())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| engine_err("script evaluation failed", e))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn screenshot(&self, options: SnapshotOptions) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .full_page(options.full_page)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| engine_err("screenshot failed", e))
    }

    async fn close(&self) -> Result<()> {
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| engine_err("failed to close page", e))
    }
}
