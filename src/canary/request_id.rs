//! Request-id shaping.
//!
//! The canonical id lives in `X-Request-Id`; older hops may send
//! `X-CA-Request-Id` or `Request-Id`. When synthesis is enabled and no id is
//! present, the trace-id slice of a W3C `traceparent` header is preferred,
//! then the legacy `eagleeye-traceid`, then a fresh UUID v4.

use pingora_core::Result;
use pingora_http::RequestHeader;
use uuid::Uuid;

use super::header_str;

pub const X_REQUEST_ID: &str = "X-Request-Id";

/// Resolves the request id and, when synthesizing, writes it back onto the
/// request. Returns the id (possibly empty when synthesis is disabled).
pub fn shape_request_id(req: &mut RequestHeader, add_request_id: bool) -> Result<String> {
    let mut request_id = header_str(&req.headers, X_REQUEST_ID)
        .or_else(|| header_str(&req.headers, "X-CA-Request-Id"))
        .or_else(|| header_str(&req.headers, "Request-Id"))
        .unwrap_or("")
        .to_string();

    if add_request_id && request_id.is_empty() {
        request_id = synthesize(req);
        req.insert_header(X_REQUEST_ID, request_id.as_str())?;
    }
    Ok(request_id)
}

/// Derives an id from trace headers, falling back to a new UUID.
///
/// https://www.w3.org/TR/trace-context/#traceparent-header — the 32 hex
/// digits at [3..35] are the trace id.
fn synthesize(req: &RequestHeader) -> String {
    if let Some(traceparent) = header_str(&req.headers, "traceparent") {
        if traceparent.len() >= 55 {
            return traceparent[3..35].to_string();
        }
    }
    if let Some(trace_id) = header_str(&req.headers, "eagleeye-traceid") {
        if !trace_id.is_empty() {
            return trace_id.to_string();
        }
    }
    Uuid::new_v4().to_string()
}
