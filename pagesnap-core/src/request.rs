//! Capture request model and shape validation.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CaptureError, Result};

const MAX_URL_LENGTH: usize = 2048;
const MAX_VIEWPORT_DIMENSION: u32 = 16_384;
const MAX_IDEMPOTENCY_KEY_LENGTH: usize = 128;

/// Browser viewport in CSS pixels.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// `"{width}x{height}"`, the form used in cache keys and storage names.
    pub fn descriptor(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// A single screenshot request as submitted by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub full_page: bool,
    #[serde(default)]
    pub mobile: bool,
    /// Skip any cached artifact and always capture again.
    #[serde(default)]
    pub fresh: bool,
    /// Fail the job instead of substituting the page's preview image.
    #[serde(default)]
    pub no_og_fallback: bool,
}

impl CaptureRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            viewport: None,
            full_page: false,
            mobile: false,
            fresh: false,
            no_og_fallback: false,
        }
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = Some(Viewport::new(width, height));
        self
    }

    pub fn with_full_page(mut self, full_page: bool) -> Self {
        self.full_page = full_page;
        self
    }

    pub fn with_mobile(mut self, mobile: bool) -> Self {
        self.mobile = mobile;
        self
    }

    pub fn with_fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn with_fallback_disabled(mut self, disabled: bool) -> Self {
        self.no_og_fallback = disabled;
        self
    }

    /// Checks the request shape and returns the parsed target URL.
    ///
    /// Scheme enforcement is left to the SSRF guard so that protocol
    /// rejections surface with their own reason.
    pub fn validate(&self) -> Result<Url> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(CaptureError::Validation("url is required".into()));
        }
        if raw.len() > MAX_URL_LENGTH {
            return Err(CaptureError::Validation(format!(
                "url exceeds {MAX_URL_LENGTH} characters"
            )));
        }

        let parsed = Url::parse(raw).map_err(|e| {
            CaptureError::Validation(format!("url is not valid: {e}"))
        })?;

        if let Some(viewport) = self.viewport {
            for (name, value) in
                [("width", viewport.width), ("height", viewport.height)]
            {
                if value == 0 {
                    return Err(CaptureError::Validation(format!(
                        "viewport.{name} must be a positive integer"
                    )));
                }
                if value > MAX_VIEWPORT_DIMENSION {
                    return Err(CaptureError::Validation(format!(
                        "viewport.{name} must not exceed {MAX_VIEWPORT_DIMENSION}"
                    )));
                }
            }
        }

        Ok(parsed)
    }
}

/// Validates a client-supplied `Idempotency-Key`.
///
/// Keys become job ids and appear in status URLs, so they are limited to a
/// conservative URL-safe alphabet.
pub fn validate_idempotency_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LENGTH {
        return Err(CaptureError::Validation(format!(
            "Idempotency-Key must be 1-{MAX_IDEMPOTENCY_KEY_LENGTH} characters"
        )));
    }
    let allowed = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
    };
    if !key.chars().all(allowed) {
        return Err(CaptureError::Validation(
            "Idempotency-Key may only contain letters, digits, '-', '_', '.' and ':'"
                .into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_client_body_with_defaults() {
        let body =
            r#"{"url":"https://example.com","viewport":{"width":1920,"height":1080},"fullPage":true}"#;
        let request: CaptureRequest = serde_json::from_str(body).unwrap();

        assert_eq!(request.viewport, Some(Viewport::new(1920, 1080)));
        assert!(request.full_page);
        assert!(!request.mobile);
        assert!(!request.fresh);
        assert!(!request.no_og_fallback);
    }

    #[test]
    fn reads_fallback_flag_by_wire_name() {
        let body = r#"{"url":"https://example.com","noOgFallback":true,"fresh":true}"#;
        let request: CaptureRequest = serde_json::from_str(body).unwrap();
        assert!(request.no_og_fallback);
        assert!(request.fresh);
    }

    #[test]
    fn rejects_zero_viewport() {
        let request = CaptureRequest::new("https://example.com").with_viewport(0, 600);
        let err = request.validate().unwrap_err();
        assert!(matches!(err, CaptureError::Validation(_)));
        assert!(err.to_string().contains("viewport.width"));
    }

    #[test]
    fn rejects_unparseable_url() {
        let err = CaptureRequest::new("not a url").validate().unwrap_err();
        assert!(matches!(err, CaptureError::Validation(_)));
    }

    #[test]
    fn rejects_missing_url() {
        let err = CaptureRequest::new("   ").validate().unwrap_err();
        assert!(err.to_string().contains("url is required"));
    }

    #[test]
    fn idempotency_key_alphabet() {
        assert!(validate_idempotency_key("order-42_v1.retry:3").is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key("has space").is_err());
        assert!(validate_idempotency_key("slash/inside").is_err());
        assert!(validate_idempotency_key(&"k".repeat(129)).is_err());
    }
}
