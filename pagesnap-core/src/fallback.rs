//! Degraded substitute for failed captures: the page's social preview image.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, LOCATION};
use tracing::debug;
use url::Url;

use crate::{
    error::{CaptureError, Result},
    ssrf::SsrfGuard,
};

const MAX_REDIRECTS: usize = 5;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Meta keys in order of preference.
const PREVIEW_KEYS: &[&str] = &[
    "og:image",
    "og:image:url",
    "og:image:secure_url",
    "twitter:image",
    "twitter:image:src",
];

static META_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("meta tag pattern"));

static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#)
        .expect("attribute pattern")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackSettings {
    pub timeout: Duration,
    pub max_html_bytes: usize,
    pub user_agent: String,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_html_bytes: 2 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Source of raw page HTML.
#[async_trait]
pub trait HtmlFetcher: Send + Sync + fmt::Debug {
    async fn fetch_html(&self, url: &Url) -> Result<String>;
}

/// Fetches HTML over HTTP with browser-like headers and a size cap.
///
/// Redirects are followed by hand so that every hop after the first goes
/// through the SSRF guard before it is requested.
#[derive(Debug, Clone)]
pub struct HttpHtmlFetcher {
    client: reqwest::Client,
    guard: SsrfGuard,
    max_bytes: usize,
}

impl HttpHtmlFetcher {
    pub fn new(settings: &FallbackSettings, guard: SsrfGuard) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                CaptureError::FallbackExhausted(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            guard,
            max_bytes: settings.max_html_bytes,
        })
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<String> {
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(fetch_failed)? {
            let room = self.max_bytes.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= self.max_bytes {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

fn fetch_failed(err: reqwest::Error) -> CaptureError {
    CaptureError::FallbackExhausted(err.to_string())
}

#[async_trait]
impl HtmlFetcher for HttpHtmlFetcher {
    async fn fetch_html(&self, url: &Url) -> Result<String> {
        let mut current = url.clone();

        for hop in 0..=MAX_REDIRECTS {
            if hop > 0 {
                self.guard.check(&current).await?;
            }

            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(fetch_failed)?;

            let location = response
                .status()
                .is_redirection()
                .then(|| response.headers().get(LOCATION))
                .flatten()
                .and_then(|value| value.to_str().ok());
            let Some(location) = location else {
                let response = response.error_for_status().map_err(fetch_failed)?;
                return self.read_capped(response).await;
            };

            let next = current.join(location).map_err(|e| {
                CaptureError::FallbackExhausted(format!("bad redirect target: {e}"))
            })?;
            debug!(from = %current, to = %next, "following redirect");
            current = next;
        }

        Err(CaptureError::FallbackExhausted(format!(
            "more than {MAX_REDIRECTS} redirects from {url}"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct FallbackResolver {
    fetcher: Arc<dyn HtmlFetcher>,
}

impl FallbackResolver {
    pub fn new(fetcher: Arc<dyn HtmlFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn http(settings: &FallbackSettings, guard: SsrfGuard) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpHtmlFetcher::new(settings, guard)?)))
    }

    /// Returns the absolute URL of the page's preview image.
    pub async fn resolve(&self, page_url: &Url) -> Result<String> {
        let html = self.fetcher.fetch_html(page_url).await?;
        let image = extract_preview_image(&html, page_url).ok_or_else(|| {
            CaptureError::FallbackExhausted(format!("no preview image found on {page_url}"))
        })?;
        debug!(url = %page_url, image = %image, "preview image resolved");
        Ok(image)
    }
}

fn attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))?
                .as_str()
                .to_string();
            Some((name, value))
        })
        .collect()
}

/// Finds the best preview-image meta tag, whatever the attribute order, and
/// resolves its value against the page URL.
pub fn extract_preview_image(html: &str, page_url: &Url) -> Option<String> {
    let mut best: Option<(usize, String)> = None;

    for tag in META_TAG.find_iter(html) {
        let attrs = attributes(tag.as_str());
        let Some(key) = ["property", "name", "itemprop"]
            .iter()
            .find_map(|attr| attrs.get(*attr))
        else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let Some(rank) = PREVIEW_KEYS.iter().position(|k| *k == key) else {
            continue;
        };
        let Some(content) = attrs.get("content").map(|c| c.trim()) else {
            continue;
        };
        if content.is_empty() {
            continue;
        }
        if best.as_ref().is_none_or(|(current, _)| rank < *current) {
            best = Some((rank, content.to_string()));
        }
    }

    let (_, raw) = best?;
    absolutize(&html_escape::decode_html_entities(&raw), page_url)
}

fn absolutize(candidate: &str, page_url: &Url) -> Option<String> {
    let candidate = candidate.trim();
    let resolved = if let Some(rest) = candidate.strip_prefix("//") {
        Url::parse(&format!("https://{rest}")).ok()?
    } else {
        page_url.join(candidate).ok()?
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}
