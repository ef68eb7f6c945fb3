//! Label load balancer: picks the upstream variant matching the request's
//! canary label.
//!
//! Variants register under their full deployment name (typically
//! `namespace-service-label-port`), normalized down to `service[-label]`.
//! The list stays sorted by name length, longest first and stable, so a
//! linear scan stops at the longest-prefix match. `nofallback` restricts the
//! scan to exact matches.

use http::HeaderMap;

use crate::canary::CanaryHeader;
use crate::config::ServiceConfig;

use super::upstream::{AddressError, Upstream};

struct NamedVariant {
    name: String,
    upstream: Upstream,
}

/// Per-service balancer keyed by the `X-Canary` label.
pub struct LabelBalancer {
    service_name: String,
    default: Option<Upstream>,
    variants: Vec<NamedVariant>,
}

impl LabelBalancer {
    pub fn new(service_name: impl Into<String>, default: Option<Upstream>) -> Self {
        Self {
            service_name: service_name.into(),
            default,
            variants: Vec::new(),
        }
    }

    /// Builds a balancer with every variant of a configured service.
    pub fn from_service_config(cfg: &ServiceConfig) -> Result<Self, AddressError> {
        let default = cfg
            .default_variant
            .as_ref()
            .map(Upstream::from_config)
            .transpose()?;
        let mut balancer = Self::new(cfg.name.clone(), default);
        for variant in &cfg.variants {
            balancer.add_service(&variant.name, Upstream::from_config(&variant.upstream)?);
        }
        Ok(balancer)
    }

    /// Registers a variant under its full deployment name.
    ///
    /// Not safe to call concurrently with `select`; balancers are fully
    /// built before they are mounted.
    pub fn add_service(&mut self, full_name: &str, upstream: Upstream) {
        let name = normalize_service_name(full_name, &self.service_name);
        self.insert_sorted(NamedVariant { name, upstream });
    }

    fn insert_sorted(&mut self, variant: NamedVariant) {
        // Stable length-descending order: equal lengths keep insertion order.
        let at = self
            .variants
            .partition_point(|v| v.name.len() >= variant.name.len());
        self.variants.insert(at, variant);
    }

    /// Selects the variant for the request's canary label.
    ///
    /// Returns `None` when nothing matches and no default applies; the
    /// caller turns that into a 500.
    pub fn select(&self, headers: &HeaderMap) -> Option<&Upstream> {
        let info = CanaryHeader::from_header(headers, false);
        let fallback = !info.nofallback;

        if !info.label.is_empty() {
            let target = format!("{}-{}", self.service_name, info.label);
            if let Some(variant) = self.match_target(&target, fallback) {
                return Some(&variant.upstream);
            }
        }

        if fallback || info.label.is_empty() {
            return self.default.as_ref();
        }
        None
    }

    fn match_target(&self, target: &str, fallback: bool) -> Option<&NamedVariant> {
        self.variants
            .iter()
            .find(|v| target == v.name || (fallback && target.starts_with(&v.name)))
    }
}

/// Derives the match name from a full deployment name: cut everything
/// before the base name, then strip the trailing port and separators.
pub fn normalize_service_name(full_name: &str, base_name: &str) -> String {
    let name = match full_name.rfind(base_name) {
        Some(i) if i > 0 => &full_name[i..],
        _ => full_name,
    };
    name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '-')
        .to_string()
}
