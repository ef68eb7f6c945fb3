//! HTTP client for the label service.
//!
//! Issues `GET {server}/users/{uid}/labels:cache?product={product}` with a
//! process-global reqwest client and parses the JSON envelope
//! `{"timestamp": <unix-seconds>, "result": [Label, ...]}`. Every failed
//! round-trip counts against the shared [`HealthGate`]; a fully parsed 200
//! closes it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Deserialize;
use thiserror::Error;

use super::{HealthGate, Label};

const HEADER_X_REQUEST_ID: &str = "X-Request-Id";
const HEADER_TRACEPARENT: &str = "traceparent";

static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "canary-gateway/{} (label client)",
        env!("CARGO_PKG_VERSION")
    )
});

// Pinned transport settings: short request deadline, generous connection
// reuse, no upstream cert validation (label servers sit on internal PKI).
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(1))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(25))
        .danger_accept_invalid_certs(true)
        .build()
        .expect("label http client")
});

/// Why a label fetch failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("label request failed (failures: {failures}): {source}")]
    Transport {
        failures: u64,
        #[source]
        source: reqwest::Error,
    },
    #[error("label service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("label response decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct LabelsEnvelope {
    #[serde(default)]
    timestamp: i64,
    // Absent or null both mean "no labels".
    #[serde(default)]
    result: Option<Vec<Label>>,
}

/// Error-suppressing fetch seam between the store and the label service.
///
/// Implementations never fail: on any backend problem they return an empty
/// list stamped with the current time.
#[async_trait]
pub trait LabelFetcher: Send + Sync {
    async fn must_fetch(
        &self,
        uid: &str,
        request_id: &str,
        traceparent: Option<&str>,
    ) -> (Vec<Label>, i64);
}

/// Label-service client bound to one server URL and product.
pub struct LabelClient {
    server: String,
    product: String,
    gate: Arc<HealthGate>,
}

impl LabelClient {
    pub fn new(server: impl Into<String>, product: impl Into<String>, gate: Arc<HealthGate>) -> Self {
        Self {
            server: server.into(),
            product: product.into(),
            gate,
        }
    }

    /// Builds the per-uid label URL. A server value carrying `%s` templates
    /// is formatted with the uid and the product, in that order.
    fn label_url(&self, uid: &str) -> String {
        if self.server.contains("%s") {
            self.server.replacen("%s", uid, 1).replacen("%s", &self.product, 1)
        } else {
            format!(
                "{}/users/{}/labels:cache?product={}",
                self.server, uid, self.product
            )
        }
    }

    /// One fetch round-trip with gate bookkeeping.
    pub async fn fetch(
        &self,
        uid: &str,
        request_id: &str,
        traceparent: Option<&str>,
    ) -> Result<(Vec<Label>, i64), FetchError> {
        let mut req = HTTP_CLIENT
            .get(self.label_url(uid))
            .header(reqwest::header::USER_AGENT, USER_AGENT.as_str())
            .header(HEADER_X_REQUEST_ID, request_id);
        if let Some(tp) = traceparent {
            req = req.header(HEADER_TRACEPARENT, tp);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(source) => {
                let failures = self.gate.count_failure();
                return Err(FetchError::Transport { failures, source });
            }
        };

        let status = resp.status().as_u16();
        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(source) => {
                let failures = self.gate.count_failure();
                return Err(FetchError::Transport { failures, source });
            }
        };

        if status != 200 || body.is_empty() {
            self.gate.count_failure();
            return Err(FetchError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        match serde_json::from_slice::<LabelsEnvelope>(&body) {
            Ok(envelope) => {
                self.gate.reset();
                Ok((envelope.result.unwrap_or_default(), envelope.timestamp))
            }
            Err(err) => {
                self.gate.count_failure();
                Err(FetchError::Decode(err))
            }
        }
    }
}

#[async_trait]
impl LabelFetcher for LabelClient {
    async fn must_fetch(
        &self,
        uid: &str,
        request_id: &str,
        traceparent: Option<&str>,
    ) -> (Vec<Label>, i64) {
        let now = unix_now();
        if !self.gate.maybe_healthy() {
            return (Vec::new(), now);
        }
        match self.fetch(uid, request_id, traceparent).await {
            Ok((labels, timestamp)) => {
                // A future or non-positive server timestamp must not extend
                // the TTL; past timestamps shorten it as intended.
                let timestamp = if timestamp > 0 && timestamp < now {
                    timestamp
                } else {
                    now
                };
                (labels, timestamp)
            }
            Err(err) => {
                tracing::error!(request_id, error = %err, "label fetch failed");
                (Vec::new(), now)
            }
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
