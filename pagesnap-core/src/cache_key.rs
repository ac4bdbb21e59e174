//! Content-addressed identity for capture requests.
//!
//! The cache key is derived from the four semantic request fields only
//! (url, full-page flag, viewport, mobile flag). Idempotency keys, the
//! fresh flag and the fallback flag never participate, so unrelated callers
//! asking for the same page converge on one stored artifact.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::request::CaptureRequest;

/// File extension of every stored capture.
pub const ARTIFACT_EXTENSION: &str = "jpg";
pub const ARTIFACT_CONTENT_TYPE: &str = "image/jpeg";

const DEFAULT_VIEWPORT_DESCRIPTOR: &str = "default";

/// Semantic fields that determine a capture's identity.
#[derive(Debug, Serialize)]
struct SemanticFields<'a> {
    url: &'a str,
    full_page: bool,
    viewport: String,
    mobile: bool,
}

/// Stable fingerprint of a capture request.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(request: &CaptureRequest) -> Self {
        let url = normalize_url(&request.url);
        let fields = SemanticFields {
            url: &url,
            full_page: request.full_page,
            viewport: request
                .viewport
                .map(|v| v.descriptor())
                .unwrap_or_default(),
            mobile: request.mobile,
        };

        // serde_json maps are key-sorted, so the canonical form does not
        // depend on the order fields were declared or supplied in.
        let canonical = serde_json::to_value(&fields)
            .map(|value| value.to_string())
            .unwrap_or_else(|_| {
                format!(
                    "{}|{}|{}|{}",
                    fields.url,
                    fields.full_page,
                    fields.viewport,
                    fields.mobile
                )
            });

        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object-store path of a capture:
/// `{hash}/{hash}.{viewport}[.fp][.mobile].{ext}`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn for_request(request: &CaptureRequest) -> Self {
        Self::new(&CacheKey::for_request(request), request)
    }

    pub fn new(cache_key: &CacheKey, request: &CaptureRequest) -> Self {
        let mut name = format!(
            "{hash}/{hash}.{viewport}",
            hash = cache_key.as_str(),
            viewport = request
                .viewport
                .map(|v| v.descriptor())
                .unwrap_or_else(|| DEFAULT_VIEWPORT_DESCRIPTOR.to_string()),
        );
        if request.full_page {
            name.push_str(".fp");
        }
        if request.mobile {
            name.push_str(".mobile");
        }
        name.push('.');
        name.push_str(ARTIFACT_EXTENSION);
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    url::Url::parse(trimmed)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| trimmed.to_string())
}
