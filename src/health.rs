//! HTTP health server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.
//! Readiness reports the label-service gate state in the body but stays 200
//! either way: a degraded label service only degrades routing, it does not
//! take the gateway out of rotation.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::label::HealthGate;

/// Answers probe requests.
pub async fn health_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match req.uri().path() {
        "/healthz" => (StatusCode::OK, "ok"),
        "/readyz" if HealthGate::shared().maybe_healthy() => (StatusCode::OK, "ok"),
        "/readyz" => (StatusCode::OK, "degraded"),
        _ => (StatusCode::NOT_FOUND, "not found"),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    Ok(response)
}

/// Binds the probe listener and serves it forever.
pub async fn start_health_server(addr: SocketAddr) -> std::io::Result<()> {
    serve(TcpListener::bind(addr).await?).await
}

async fn serve(listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service_fn(health_handler));
            if let Err(e) = conn.await {
                tracing::debug!(%peer, error = %e, "probe connection failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Binds an ephemeral port and serves probes on it.
    async fn spawn_probe_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));
        addr
    }

    /// One HTTP/1.0 GET; the connection closes after the response.
    async fn probe(addr: SocketAddr, path: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.0\r\nHost: probe\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let raw = String::from_utf8(raw).unwrap();

        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        (status, body.to_string())
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let addr = spawn_probe_server().await;
        assert_eq!(probe(addr, "/healthz").await, (200, "ok".to_string()));
    }

    #[tokio::test]
    async fn readyz_stays_200_whatever_the_gate_says() {
        let addr = spawn_probe_server().await;
        let (status, body) = probe(addr, "/readyz").await;
        assert_eq!(status, 200);
        assert!(body == "ok" || body == "degraded");
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let addr = spawn_probe_server().await;
        assert_eq!(probe(addr, "/metrics").await.0, 404);
    }
}
