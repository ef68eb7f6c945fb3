//! Pingora-based reverse proxy with canary label routing.
//!
//! Each request passes through the canary middleware, which resolves a
//! per-user label (from the `X-Canary` header, cookies, or the label
//! service) and stamps it back on the request; the label balancer then
//! proxies to the matching upstream variant.

mod canary;
mod config;
mod health;
mod label;
mod proxy;
mod store;

use anyhow::Context;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::GatewayConfig;
use crate::proxy::GatewayProxy;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .context("usage: canary-gateway <config.json>")?;
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading {config_path}"))?;
    let cfg: GatewayConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {config_path}"))?;

    tracing::info!(config = %config_path, "canary-gateway starting");

    let gateway = GatewayProxy::from_config(&cfg)?;

    // Probe server runs on its own runtime thread beside the proxy.
    if !cfg.health_listen.is_empty() {
        let health_addr: std::net::SocketAddr = cfg
            .health_listen
            .parse()
            .with_context(|| format!("invalid health listen address {}", cfg.health_listen))?;
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            rt.block_on(async {
                tracing::info!(%health_addr, "health server listening");
                if let Err(e) = health::start_health_server(health_addr).await {
                    tracing::error!(error = %e, "health server error");
                }
            });
        });
    }

    let opt = Opt::default();
    let mut server = Server::new(Some(opt))?;
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, gateway);
    proxy_service.add_tcp(&cfg.listen);

    tracing::info!(addr = %cfg.listen, "HTTP proxy listening");

    server.add_service(proxy_service);
    server.run_forever();
}
