//! Rendering pages into images through an injected browser backend.
//!
//! The engine only needs a narrow capability set from the browser
//! ({navigate, wait for load, inject style, evaluate, screenshot}); any
//! automation backend can be adapted to [`BrowserBackend`]/[`BrowserPage`].

#[cfg(feature = "chromium")]
pub mod chromium;
pub mod engine;
pub mod overlay;
pub mod scroll;

use std::{fmt, time::Duration};

use async_trait::async_trait;

use crate::{error::Result, request::Viewport};

pub use engine::{CaptureEngine, CaptureSettings, RenderedImage};
pub use overlay::OVERLAY_SUPPRESSION_CSS;
pub use scroll::ScrollSettings;

/// Emulation applied to a page before navigation.
#[derive(Clone, Debug, PartialEq)]
pub struct PageOptions {
    pub viewport: Viewport,
    pub device_scale_factor: f64,
    pub mobile: bool,
    pub user_agent: Option<String>,
    pub navigation_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Capture the full scrollable document rather than the viewport.
    pub full_page: bool,
}

#[async_trait]
pub trait BrowserBackend: Send + Sync + fmt::Debug {
    async fn new_page(&self, options: &PageOptions) -> Result<Box<dyn BrowserPage>>;

    /// Releases the underlying browser. Pages must not be used afterwards.
    async fn shutdown(&self) -> Result<()>;
}

#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn wait_for_load(&self) -> Result<()>;

    /// Adds a stylesheet to the current document.
    async fn inject_style(&self, css: &str) -> Result<()>;

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Raster snapshot in any format the `image` crate can decode.
    async fn screenshot(&self, options: SnapshotOptions) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;
}
