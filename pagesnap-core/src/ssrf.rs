//! Server-side request forgery guard.
//!
//! Validates a target URL before it is ever queued: the scheme must be http
//! or https and the host must resolve to an address outside the reserved
//! ranges below. Only the initially resolved address is checked; redirects
//! followed later by the browser are not re-validated.

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::Arc,
};

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use tracing::debug;
use url::{Host, Url};

use crate::error::{CaptureError, Result, SsrfRejection};

static RESERVED_RANGES: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "0.0.0.0/8",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
        "::/128",
    ]
    .iter()
    .map(|cidr| cidr.parse().expect("static CIDR literal"))
    .collect()
});

/// True when `addr` falls inside one of the reserved ranges.
///
/// IPv4-mapped IPv6 addresses are unwrapped first so `::ffff:10.0.0.1`
/// cannot bypass the IPv4 table.
pub fn is_reserved(addr: IpAddr) -> bool {
    let addr = match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };
    RESERVED_RANGES.iter().any(|net| net.contains(addr))
}

/// Resolves a hostname to a single address.
#[async_trait]
pub trait HostResolver: Send + Sync + fmt::Debug {
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr>;
}

/// Resolver backed by the operating system via `tokio::net::lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr> {
        let mut addrs = tokio::net::lookup_host((host, 80)).await?;
        addrs.next().map(|sock| sock.ip()).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses returned",
            )
        })
    }
}

/// Fixed host table; unknown hosts fail resolution.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, addr: IpAddr) -> Self {
        self.entries.insert(host.into().to_ascii_lowercase(), addr);
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("unknown host {host}"),
                )
            })
    }
}

#[derive(Clone)]
pub struct SsrfGuard {
    resolver: Arc<dyn HostResolver>,
}

impl fmt::Debug for SsrfGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsrfGuard")
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl Default for SsrfGuard {
    fn default() -> Self {
        Self::new(Arc::new(SystemResolver))
    }
}

impl SsrfGuard {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self { resolver }
    }

    /// Parses and checks a raw URL string.
    pub async fn check_str(&self, raw: &str) -> Result<IpAddr> {
        let url = Url::parse(raw).map_err(|e| {
            CaptureError::Validation(format!("url is not valid: {e}"))
        })?;
        self.check(&url).await
    }

    /// Returns the address the URL resolved to when it is safe to fetch.
    pub async fn check(&self, url: &Url) -> Result<IpAddr> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CaptureError::SsrfRejected(
                SsrfRejection::InvalidProtocol,
            ));
        }

        let addr = match url.host() {
            Some(Host::Ipv4(v4)) => IpAddr::V4(v4),
            Some(Host::Ipv6(v6)) => IpAddr::V6(v6),
            Some(Host::Domain(domain)) => {
                self.resolver.resolve(domain).await.map_err(|e| {
                    CaptureError::DnsFailure {
                        host: domain.to_string(),
                        reason: e.to_string(),
                    }
                })?
            }
            None => {
                return Err(CaptureError::SsrfRejected(
                    SsrfRejection::MissingHost,
                ));
            }
        };

        if is_reserved(addr) {
            debug!(url = %url, %addr, "rejecting reserved address");
            return Err(CaptureError::SsrfRejected(
                SsrfRejection::PrivateAddressRejected,
            ));
        }

        Ok(addr)
    }
}
