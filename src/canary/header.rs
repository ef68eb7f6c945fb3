//! The `X-Canary` header: parse, trust filtering, and serialization.
//!
//! A single header value carries comma-separated (preferred) or
//! semicolon-separated (compat) `key=value` tokens plus the bare flags
//! `nofallback` and `testing`; the whole value may also be a bare label.
//! Multiple header occurrences are accepted as one token each.
//!
//! `product=` and `uid=` are trusted fields: they are only accepted when the
//! gateway runs downstream of another instance that set them. On an edge
//! gateway the parser drops them, which is what stops clients from spoofing
//! an identity — serialization-time filtering would be too late.
//!
//! Full example:
//! `X-Canary: label=beta,product=urbs,uid=5c4057f0be825b390667abee,client=iOS,channel=stable,app=teambition,version=v10.0,nofallback,testing`

use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;

pub const X_CANARY: &str = "X-Canary";

// Subset of a DNS-1035 label.
static VALID_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][0-9a-z-]{1,62}$").expect("label regex"));

/// True when `s` can stand alone as a canary label.
pub fn is_valid_label(s: &str) -> bool {
    VALID_LABEL.is_match(s)
}

/// Structured view of one `X-Canary` header value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CanaryHeader {
    pub label: String,
    pub product: String,
    pub uid: String,
    pub client: String,
    pub channel: String,
    pub app: String,
    pub version: String,
    pub nofallback: bool,
    pub testing: bool,
}

impl CanaryHeader {
    /// Parses every `X-Canary` occurrence on `headers`.
    ///
    /// A single occurrence containing a delimiter is split on it; the comma
    /// dialect wins over the semicolon one. `trust` admits the `product=`
    /// and `uid=` fields.
    pub fn from_header(headers: &HeaderMap, trust: bool) -> Self {
        let mut parsed = Self::default();
        let values: Vec<&str> = headers
            .get_all(X_CANARY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();

        if values.len() == 1 {
            let value = values[0];
            if value.find(',').is_some_and(|i| i > 0) {
                parsed.feed(value.split(','), trust);
            } else if value.find(';').is_some_and(|i| i > 0) {
                parsed.feed(value.split(';'), trust);
            } else {
                parsed.feed(values, trust);
            }
        } else {
            parsed.feed(values, trust);
        }
        parsed
    }

    /// Consumes one token per item; unknown tokens are dropped. A bare first
    /// token matching the label grammar is shorthand for `label=<token>`.
    pub fn feed<'a, I>(&mut self, tokens: I, trust: bool)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for (i, token) in tokens.into_iter().enumerate() {
            let token = token.trim();
            if let Some(rest) = token.strip_prefix("label=") {
                self.label = rest.to_string();
            } else if let Some(rest) = token.strip_prefix("product=").filter(|_| trust) {
                self.product = rest.to_string();
            } else if let Some(rest) = token.strip_prefix("uid=").filter(|_| trust) {
                self.uid = rest.to_string();
            } else if let Some(rest) = token.strip_prefix("client=") {
                self.client = rest.to_string();
            } else if let Some(rest) = token.strip_prefix("channel=") {
                self.channel = rest.to_string();
            } else if let Some(rest) = token.strip_prefix("app=") {
                self.app = rest.to_string();
            } else if let Some(rest) = token.strip_prefix("version=") {
                self.version = rest.to_string();
            } else if token == "nofallback" {
                self.nofallback = true;
            } else if token == "testing" {
                self.testing = true;
            } else if i == 0 && is_valid_label(token) {
                self.label = token.to_string();
            }
        }
        if self.testing && self.label.is_empty() {
            self.label = "testing".to_string();
        }
    }

    /// Serializes in the fixed field order, skipping empty fields.
    /// An empty label yields an empty string: no label, no header.
    pub fn to_value(&self) -> String {
        if self.label.is_empty() {
            return String::new();
        }
        let mut parts = vec![format!("label={}", self.label)];
        for (key, value) in [
            ("product", &self.product),
            ("uid", &self.uid),
            ("client", &self.client),
            ("channel", &self.channel),
            ("app", &self.app),
            ("version", &self.version),
        ] {
            if !value.is_empty() {
                parts.push(format!("{key}={value}"));
            }
        }
        if self.nofallback {
            parts.push("nofallback".to_string());
        }
        if self.testing {
            parts.push("testing".to_string());
        }
        parts.join(",")
    }
}
