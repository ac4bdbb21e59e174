use std::{io::Cursor, sync::Arc, time::Duration};

use image::{GenericImageView, codecs::jpeg::JpegEncoder};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    BrowserBackend, BrowserPage, OVERLAY_SUPPRESSION_CSS, PageOptions,
    ScrollSettings, SnapshotOptions, scroll,
};
use crate::{
    error::{CaptureError, Result},
    request::{CaptureRequest, Viewport},
};

const DEFAULT_MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureSettings {
    /// Budget for the whole capture, navigation through encoding.
    pub timeout: Duration,
    pub navigation_timeout: Duration,
    pub default_viewport: Viewport,
    pub mobile_viewport: Viewport,
    pub device_scale_factor: f64,
    pub mobile_scale_factor: f64,
    pub mobile_user_agent: String,
    pub jpeg_quality: u8,
    /// Pause after load and overlay suppression before scrolling.
    pub settle: Duration,
    pub scroll: ScrollSettings,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            navigation_timeout: Duration::from_secs(30),
            default_viewport: Viewport::new(1280, 800),
            mobile_viewport: Viewport::new(390, 844),
            device_scale_factor: 1.0,
            mobile_scale_factor: 3.0,
            mobile_user_agent: DEFAULT_MOBILE_USER_AGENT.to_string(),
            jpeg_quality: 80,
            settle: Duration::from_millis(500),
            scroll: ScrollSettings::default(),
        }
    }
}

/// Encoded capture ready for upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RenderedImage {
    pub fn byte_size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Clone, Debug)]
pub struct CaptureEngine {
    backend: Arc<dyn BrowserBackend>,
    settings: CaptureSettings,
}

impl CaptureEngine {
    pub fn new(backend: Arc<dyn BrowserBackend>, settings: CaptureSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn page_options(&self, request: &CaptureRequest) -> PageOptions {
        let viewport = match (request.viewport, request.mobile) {
            (Some(viewport), _) => viewport,
            (None, true) => self.settings.mobile_viewport,
            (None, false) => self.settings.default_viewport,
        };
        PageOptions {
            viewport,
            device_scale_factor: if request.mobile {
                self.settings.mobile_scale_factor
            } else {
                self.settings.device_scale_factor
            },
            mobile: request.mobile,
            user_agent: request
                .mobile
                .then(|| self.settings.mobile_user_agent.clone()),
            navigation_timeout: self.settings.navigation_timeout,
        }
    }

    /// Renders the request's page and encodes it as JPEG.
    ///
    /// Opening the page counts against the capture timeout. The page is
    /// always closed, including after a timeout or once `cancel` fires.
    pub async fn capture(
        &self,
        request: &CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<RenderedImage> {
        let options = self.page_options(request);
        let timeout = self.settings.timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = || CaptureError::CaptureTimeout(timeout.as_secs());

        let page = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CaptureError::Abandoned(request.url.clone()));
            }
            opened = tokio::time::timeout_at(deadline, self.backend.new_page(&options)) => {
                opened.map_err(|_| timed_out())??
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(CaptureError::Abandoned(request.url.clone())),
            rendered = tokio::time::timeout_at(
                deadline,
                self.render(page.as_ref(), request, &options),
            ) => rendered.map_err(|_| timed_out()).and_then(|inner| inner),
        };

        if let Err(err) = page.close().await {
            warn!(url = %request.url, "failed to close page: {err}");
        }

        let screenshot = outcome?;
        let quality = self.settings.jpeg_quality;
        tokio::task::spawn_blocking(move || encode_jpeg(&screenshot, quality))
            .await
            .map_err(|e| CaptureError::CaptureEngine(format!("encoder task failed: {e}")))?
    }

    async fn render(
        &self,
        page: &dyn BrowserPage,
        request: &CaptureRequest,
        options: &PageOptions,
    ) -> Result<Vec<u8>> {
        debug!(url = %request.url, viewport = %options.viewport.descriptor(), "navigating");

        tokio::time::timeout(options.navigation_timeout, async {
            page.navigate(&request.url).await?;
            page.wait_for_load().await
        })
        .await
        .map_err(|_| CaptureError::CaptureTimeout(options.navigation_timeout.as_secs()))??;

        page.inject_style(OVERLAY_SUPPRESSION_CSS).await?;
        tokio::time::sleep(self.settings.settle).await;

        scroll::scroll_through(page, options.viewport.height, self.settings.scroll).await?;

        page.screenshot(SnapshotOptions {
            full_page: request.full_page,
        })
        .await
    }
}

/// Decodes any supported raster format and re-encodes it as JPEG.
pub fn encode_jpeg(raw: &[u8], quality: u8) -> Result<RenderedImage> {
    let decoded = image::load_from_memory(raw)
        .map_err(|e| CaptureError::CaptureEngine(format!("unreadable screenshot: {e}")))?;
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(CaptureError::CaptureEngine("empty screenshot".into()));
    }

    let rgb = decoded.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| CaptureError::CaptureEngine(format!("jpeg encoding failed: {e}")))?;

    Ok(RenderedImage {
        bytes: buffer.into_inner(),
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::{ImageFormat, RgbaImage};

    /// Browser that never manages to open a tab.
    #[derive(Debug)]
    struct WedgedBrowser;

    #[async_trait]
    impl BrowserBackend for WedgedBrowser {
        async fn new_page(&self, _options: &PageOptions) -> Result<Box<dyn BrowserPage>> {
            std::future::pending().await
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    fn wedged_engine(timeout: Duration) -> CaptureEngine {
        let settings = CaptureSettings {
            timeout,
            ..CaptureSettings::default()
        };
        CaptureEngine::new(Arc::new(WedgedBrowser), settings)
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, image::Rgba([200, 30, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn encodes_png_to_jpeg_preserving_dimensions() {
        let rendered = encode_jpeg(&png(64, 48), 80).unwrap();
        assert_eq!((rendered.width, rendered.height), (64, 48));
        assert_eq!(&rendered.bytes[..2], &[0xFF, 0xD8]);
        assert!(rendered.byte_size() > 0);
    }

    #[test]
    fn garbage_is_an_engine_failure() {
        let err = encode_jpeg(b"not an image", 80).unwrap_err();
        assert!(matches!(err, CaptureError::CaptureEngine(_)));
    }

    #[tokio::test]
    async fn opening_a_page_counts_against_the_capture_timeout() {
        let engine = wedged_engine(Duration::from_millis(50));
        let request = CaptureRequest::new("https://example.com");

        let started = std::time::Instant::now();
        let err = engine
            .capture(&request, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::CaptureTimeout(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_abandons_a_pending_capture() {
        let engine = wedged_engine(Duration::from_secs(60));
        let request = CaptureRequest::new("https://example.com");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = engine.capture(&request, &cancel).await.unwrap_err();
        assert!(matches!(err, CaptureError::Abandoned(_)), "{err}");
    }
}
