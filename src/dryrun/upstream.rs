//! Upstream Proxy Guard
//!
//! The dry-run core never talks to an exchange, but the run config still
//! declares the proxy endpoints the surrounding session would use. The guard
//! verifies those endpoints point at the expected mainnet hosts before a run
//! is allowed to start, so a paper-trading session can never be silently
//! wired to a lookalike feed.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Expected REST host for USD-M futures market data.
pub const EXPECTED_REST_HOST: &str = "fapi.binance.com";
/// Expected market-data WebSocket host.
pub const EXPECTED_WS_HOST: &str = "fstream.binance.com";
/// The only supported proxy mode.
pub const PROXY_MODE_BACKEND: &str = "backend-proxy";

/// Declared proxy endpoints from the run config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub mode: String,
    pub rest_base_url: String,
    pub market_ws_base_url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: PROXY_MODE_BACKEND.to_string(),
            rest_base_url: format!("https://{EXPECTED_REST_HOST}"),
            market_ws_base_url: format!("wss://{EXPECTED_WS_HOST}/ws"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    RestGuard { url: String, detail: String },
    WsGuard { url: String, detail: String },
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::RestGuard { url, detail } => {
                write!(f, "upstream_guard_fail_rest: {url} ({detail})")
            }
            UpstreamError::WsGuard { url, detail } => {
                write!(f, "upstream_guard_fail_ws: {url} ({detail})")
            }
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Verify the declared endpoints. Host comparison is exact; schemes and
/// paths are the proxy's business.
pub fn verify_proxy(proxy: &ProxyConfig) -> Result<(), UpstreamError> {
    if proxy.mode != PROXY_MODE_BACKEND {
        return Err(UpstreamError::RestGuard {
            url: proxy.rest_base_url.clone(),
            detail: format!("unsupported proxy mode: {}", proxy.mode),
        });
    }
    check_host(&proxy.rest_base_url, EXPECTED_REST_HOST).map_err(|detail| {
        UpstreamError::RestGuard {
            url: proxy.rest_base_url.clone(),
            detail,
        }
    })?;
    check_host(&proxy.market_ws_base_url, EXPECTED_WS_HOST).map_err(|detail| {
        UpstreamError::WsGuard {
            url: proxy.market_ws_base_url.clone(),
            detail,
        }
    })
}

fn check_host(raw: &str, expected: &str) -> Result<(), String> {
    let parsed = Url::parse(raw).map_err(|e| format!("unparseable url: {e}"))?;
    match parsed.host_str() {
        Some(host) if host.eq_ignore_ascii_case(expected) => Ok(()),
        Some(host) => Err(format!("host {host} != {expected}")),
        None => Err("url has no host".to_string()),
    }
}
