//! Gateway and middleware configuration.
//!
//! Deserialized from a JSON file at startup. The canary section mirrors the
//! middleware's dynamic options; values under their minimum fall back to the
//! defaults rather than being clamped.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::canary::SameSite;

const DEFAULT_CACHE_SIZE: usize = 100_000;
const MIN_CACHE_SIZE: usize = 10;
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60 * 10);
const DEFAULT_CACHE_CLEAN_DURATION: Duration = Duration::from_secs(60 * 20);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("product name required for canary middleware")]
    MissingProduct,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Probe server address; empty disables it.
    #[serde(default = "default_health_listen")]
    pub health_listen: String,
    pub canary: CanaryConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_health_listen() -> String {
    "127.0.0.1:8081".to_string()
}

/// One labeled service: a base name plus its deployed variants.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Base service name the canary label is appended to.
    pub name: String,
    /// Host headers routed to this service.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Where requests go when no variant matches.
    #[serde(default)]
    pub default_variant: Option<UpstreamConfig>,
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
}

/// A deployed variant, registered under its full (namespaced) service name.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantConfig {
    pub name: String,
    #[serde(flatten)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// `host:port` of the upstream.
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    /// SNI override; defaults to the address host.
    #[serde(default)]
    pub sni: Option<String>,
}

/// Canary middleware options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CanaryConfig {
    /// Product stamped into the outbound header and the label-service URL.
    pub product: String,
    /// Label service base URL; empty disables the store entirely.
    pub server: String,
    /// Cookie names probed for a uid, in order.
    pub uid_cookies: Vec<String>,
    /// Tokens composing `X-Ratelimit-Key`; empty disables it.
    pub rate_limit_key: Vec<String>,
    pub add_request_id: bool,
    /// Internal-gateway mode: trust the inbound header as-is.
    pub forward_label: bool,
    /// Echo the resolved header onto the response.
    pub canary_response_header: bool,
    pub max_cache_size: usize,
    pub cache_expiration_secs: u64,
    pub cache_clean_duration_secs: u64,
    pub sticky: Option<StickyConfig>,
    pub labels_map: Option<LabelsMapConfig>,
}

impl CanaryConfig {
    pub fn cache_size(&self) -> usize {
        if self.max_cache_size < MIN_CACHE_SIZE {
            DEFAULT_CACHE_SIZE
        } else {
            self.max_cache_size
        }
    }

    pub fn cache_expiration(&self) -> Duration {
        let configured = Duration::from_secs(self.cache_expiration_secs);
        if configured < Duration::from_secs(1) {
            DEFAULT_EXPIRATION
        } else {
            configured
        }
    }

    pub fn cache_clean_duration(&self) -> Duration {
        let configured = Duration::from_secs(self.cache_clean_duration_secs);
        if configured < Duration::from_secs(60) {
            DEFAULT_CACHE_CLEAN_DURATION
        } else {
            configured
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StickyConfig {
    pub cookie: StickyCookieConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StickyCookieConfig {
    pub name: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: String,
}

impl StickyCookieConfig {
    pub fn parsed_same_site(&self) -> SameSite {
        match self.same_site.as_str() {
            "none" => SameSite::None,
            "lax" => SameSite::Lax,
            "strict" => SameSite::Strict,
            _ => SameSite::Unset,
        }
    }
}

/// Static header-to-labels overlay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelsMapConfig {
    pub request_header_name: String,
    /// Header value to comma-separated label tokens.
    pub labels: HashMap<String, String>,
}
