//! Incremental scroll routine that wakes lazy-loaded content.

use std::time::Duration;

use tracing::trace;

use super::BrowserPage;
use crate::error::Result;

const DOCUMENT_HEIGHT_SCRIPT: &str = "Math.max(\
    document.body ? document.body.scrollHeight : 0, \
    document.documentElement ? document.documentElement.scrollHeight : 0)";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScrollSettings {
    pub step_pause: Duration,
    pub max_steps: u32,
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            step_pause: Duration::from_millis(100),
            max_steps: 40,
        }
    }
}

async fn document_height(page: &dyn BrowserPage) -> Result<u64> {
    let value = page.evaluate(DOCUMENT_HEIGHT_SCRIPT).await?;
    Ok(value.as_f64().map(|h| h.max(0.0) as u64).unwrap_or(0))
}

/// Scrolls down one viewport at a time until the bottom (or the step cap)
/// is reached, then returns to the top. Returns the number of steps taken.
///
/// The document height is re-read after every step because lazy content
/// usually grows the page.
pub async fn scroll_through(
    page: &dyn BrowserPage,
    viewport_height: u32,
    settings: ScrollSettings,
) -> Result<u32> {
    let step = u64::from(viewport_height.max(1));
    let mut offset = 0u64;
    let mut steps = 0u32;
    let mut height = document_height(page).await?;

    while offset + step < height && steps < settings.max_steps {
        offset += step;
        page.evaluate(&format!("window.scrollTo(0, {offset})"))
            .await?;
        tokio::time::sleep(settings.step_pause).await;
        steps += 1;
        height = document_height(page).await?;
    }

    page.evaluate("window.scrollTo(0, 0)").await?;
    tokio::time::sleep(settings.step_pause).await;

    trace!(steps, height, "scroll pass finished");
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SnapshotOptions;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Page whose document grows once while being scrolled.
    struct GrowingPage {
        height: Mutex<u64>,
        scripts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrowserPage for GrowingPage {
        async fn navigate(&self, _url: &str) -> Result<()> {
            Ok(())
        }

        async fn wait_for_load(&self) -> Result<()> {
            Ok(())
        }

        async fn inject_style(&self, _css: &str) -> Result<()> {
            Ok(())
        }

        async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
            self.scripts.lock().unwrap().push(script.to_string());
            if script.starts_with("Math.max") {
                let mut height = self.height.lock().unwrap();
                let current = *height;
                if current == 2000 {
                    *height = 3000;
                }
                return Ok(serde_json::json!(current));
            }
            Ok(serde_json::Value::Null)
        }

        async fn screenshot(&self, _options: SnapshotOptions) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn page(height: u64) -> GrowingPage {
        GrowingPage {
            height: Mutex::new(height),
            scripts: Mutex::new(Vec::new()),
        }
    }

    fn fast() -> ScrollSettings {
        ScrollSettings {
            step_pause: Duration::from_millis(1),
            max_steps: 40,
        }
    }

    #[tokio::test]
    async fn follows_growing_document_and_returns_to_top() {
        let page = page(2000);
        let steps = scroll_through(&page, 1000, fast()).await.unwrap();

        // 2000px grows to 3000px after the first read: offsets 1000, 2000
        assert_eq!(steps, 2);
        let scripts = page.scripts.lock().unwrap();
        assert_eq!(scripts.last().map(String::as_str), Some("window.scrollTo(0, 0)"));
    }

    #[tokio::test]
    async fn short_page_needs_no_steps() {
        let page = page(500);
        assert_eq!(scroll_through(&page, 800, fast()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn step_cap_bounds_endless_pages() {
        let page = page(1_000_000);
        let settings = ScrollSettings {
            max_steps: 3,
            ..fast()
        };
        assert_eq!(scroll_through(&page, 100, settings).await.unwrap(), 3);
    }
}
