use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};

use crate::directory::TokenDirectory;
use crate::resolver::ResolverCache;
use crate::rewriting::html::html_rewriter::HtmlRewriter;

/// Scheme the gateway uses when talking to an upstream origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::from_scheme(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown protocol '{s}', expected 'http' or 'https'"))
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The listen address for the gateway, where all proxied hosts point to
    pub host: SocketAddr,
    /// The public root domain whose wildcard children carry proxy tokens,
    /// e.g. `proxywarp.com`
    pub base_domain: String,
    /// Enables the `/admin/*` diagnostics surface and error detail in pages
    pub debug: bool,
    /// Path of the persisted token database
    pub db_file: PathBuf,
    /// Length of freshly generated tokens
    pub token_length: usize,
    /// How often the expiry sweep runs
    pub cleanup_interval_ms: u64,
    /// Idle lifetime of a token before the sweep removes it
    pub token_expiration_ms: u64,
    /// Scheme assumed for origins registered without one
    pub default_protocol: Protocol,
    /// User-Agent presented to upstream origins
    pub user_agent: String,
    pub timeouts: Timeouts,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: SocketAddr::from(([0, 0, 0, 0], 3000)),
            base_domain: "changeme.local".to_string(),
            debug: false,
            db_file: PathBuf::from("./data/tokens.json"),
            token_length: 6,
            cleanup_interval_ms: 24 * 60 * 60 * 1000,
            token_expiration_ms: 30 * 24 * 60 * 60 * 1000,
            default_protocol: Protocol::Https,
            user_agent: "Mozilla/5.0 (compatible; proxywarp/0.1; +https://proxywarp.com)"
                .to_string(),
            timeouts: Timeouts::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Upstream request timeout, applied as both total and read timeout
    pub proxy_request_ms: u64,
    /// Hard envelope around one proxied request before a 504 is emitted
    pub router_watchdog_ms: u64,
    /// Budget for one `/admin/test-connection` probe run
    pub admin_probe_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            proxy_request_ms: 20_000,
            router_watchdog_ms: 30_000,
            admin_probe_ms: 15_000,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a resolver cache entry
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { ttl_ms: 30_000 }
    }
}

#[derive(Clone)]
/// The state that is passed to the management routes
pub struct APIState {
    pub config: Arc<Config>,
    pub directory: TokenDirectory,
    pub resolver: ResolverCache,
    pub client: reqwest::Client,
    pub started_at: Instant,
}

#[derive(Clone)]
/// The state that is passed to the proxy handler
pub struct ProxyState {
    pub config: Arc<Config>,
    pub client: reqwest::Client,
    pub directory: TokenDirectory,
    pub resolver: ResolverCache,
    pub html_rewriter: Arc<HtmlRewriter>,
}

#[derive(Clone)]
/// The shared state that is passed to the hostname router
pub struct SharedState {
    pub config: Arc<Config>,
}
