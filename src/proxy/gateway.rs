//! Pingora ProxyHttp implementation for the gateway.
//!
//! Runs the canary middleware before proxying, picks the upstream variant
//! through the per-host label balancer, echoes the resolved headers onto the
//! response, and emits the access-log record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};

use crate::canary::{header_str, Canary, RequestOutcome, X_CANARY, X_REQUEST_ID};
use crate::config::GatewayConfig;

use super::balancer::LabelBalancer;
use super::upstream::split_host_port;

/// Per-request context carried across the proxy hooks.
#[derive(Default)]
pub struct GatewayCtx {
    outcome: Option<RequestOutcome>,
    /// Selected upstream, for the access log.
    upstream_address: Option<String>,
}

/// The gateway: canary middleware plus per-host label balancers.
pub struct GatewayProxy {
    canary: Canary,
    services: HashMap<String, Arc<LabelBalancer>>,
    /// Serves hosts with no dedicated service entry.
    catch_all: Option<Arc<LabelBalancer>>,
}

impl GatewayProxy {
    pub fn new(
        canary: Canary,
        services: HashMap<String, Arc<LabelBalancer>>,
        catch_all: Option<Arc<LabelBalancer>>,
    ) -> Self {
        Self {
            canary,
            services,
            catch_all,
        }
    }

    /// Builds the middleware and every service balancer from config.
    pub fn from_config(cfg: &GatewayConfig) -> anyhow::Result<Self> {
        let canary = Canary::new(&cfg.canary, "canary")?;

        let mut services = HashMap::new();
        let mut catch_all = None;
        for service in &cfg.services {
            let balancer = Arc::new(LabelBalancer::from_service_config(service)?);
            if service.hosts.is_empty() {
                catch_all = Some(balancer);
            } else {
                for host in &service.hosts {
                    services.insert(host.to_ascii_lowercase(), balancer.clone());
                }
            }
        }
        Ok(Self::new(canary, services, catch_all))
    }

    fn balancer_for(&self, host: &str) -> Option<&Arc<LabelBalancer>> {
        self.services
            .get(&host.to_ascii_lowercase())
            .or(self.catch_all.as_ref())
    }
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let client_addr = session.client_addr().map(|a| a.to_string());
        let outcome = self
            .canary
            .handle(session.req_header_mut(), client_addr.as_deref())
            .await?;
        ctx.outcome = Some(outcome);
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let host = routing_host(session.req_header());

        let balancer = self.balancer_for(&host).ok_or_else(|| {
            Error::explain(
                ErrorType::HTTPStatus(404),
                format!("no route for host={}", host),
            )
        })?;

        let upstream = balancer
            .select(&session.req_header().headers)
            .ok_or_else(|| {
                Error::explain(
                    ErrorType::HTTPStatus(500),
                    "no service found in label balancer",
                )
            })?;

        ctx.upstream_address = Some(upstream.address.to_string());
        Ok(Box::new(HttpPeer::new(
            upstream.address,
            upstream.tls,
            upstream.sni.clone(),
        )))
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(outcome) = &ctx.outcome {
            if outcome.echo_request_id && !outcome.request_id.is_empty() {
                upstream_response.insert_header(X_REQUEST_ID, outcome.request_id.as_str())?;
            }
            if outcome.echo_canary && !outcome.canary.is_empty() {
                upstream_response.insert_header(X_CANARY, outcome.canary.as_str())?;
            }
            if let Some(cookie) = &outcome.set_cookie {
                upstream_response.append_header("Set-Cookie", cookie.as_str())?;
            }
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let req = session.req_header();
        let outcome = ctx.outcome.take().unwrap_or_default();

        tracing::info!(
            method = req.method.as_str(),
            path = req.uri.path(),
            status = status,
            upstream = ctx.upstream_address.as_deref().unwrap_or("-"),
            x_real_ip = header_str(&req.headers, "X-Real-Ip").unwrap_or(""),
            request_id = %outcome.request_id,
            user_agent = header_str(&req.headers, "User-Agent").unwrap_or(""),
            referer = header_str(&req.headers, "Referer").unwrap_or(""),
            traceparent = header_str(&req.headers, "traceparent").unwrap_or(""),
            uid = %outcome.uid,
            canary = %outcome.canary,
            rate_limit_key = %outcome.rate_limit_key,
            "request completed"
        );
    }
}

/// The host a request is routed by: the Host header, or the `:authority` of
/// an HTTP/2 request, minus any port.
fn routing_host(req: &pingora_http::RequestHeader) -> String {
    header_str(&req.headers, "Host")
        .or_else(|| req.uri.authority().map(|a| a.as_str()))
        .map(|raw| split_host_port(raw).0.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CanaryConfig;
    use crate::proxy::Upstream;

    #[test]
    fn routing_host_comes_from_the_host_header() {
        let mut req = pingora_http::RequestHeader::build("GET", b"/foo", None).unwrap();
        assert_eq!(routing_host(&req), "");

        req.insert_header("Host", "example.com:8080").unwrap();
        assert_eq!(routing_host(&req), "example.com");

        req.insert_header("Host", "[::1]:8080").unwrap();
        assert_eq!(routing_host(&req), "::1");
    }

    #[test]
    fn routing_host_falls_back_to_the_authority() {
        let req = pingora_http::RequestHeader::build(
            "GET",
            b"http://authority.example.com:9090/foo",
            None,
        )
        .unwrap();
        assert_eq!(routing_host(&req), "authority.example.com");
    }

    fn test_proxy() -> GatewayProxy {
        let cfg = CanaryConfig {
            product: "Urbs".to_string(),
            ..Default::default()
        };
        let canary = Canary::new(&cfg, "gw-test").unwrap();

        let api = Arc::new(LabelBalancer::new(
            "urbs-api",
            Some(Upstream {
                address: "127.0.0.1:9000".parse().unwrap(),
                tls: false,
                sni: "127.0.0.1".to_string(),
            }),
        ));
        let mut services = HashMap::new();
        services.insert("api.example.com".to_string(), api);
        GatewayProxy::new(canary, services, None)
    }

    #[test]
    fn balancer_lookup_is_case_insensitive() {
        let proxy = test_proxy();
        assert!(proxy.balancer_for("api.example.com").is_some());
        assert!(proxy.balancer_for("API.Example.Com").is_some());
        assert!(proxy.balancer_for("other.example.com").is_none());
    }

    #[test]
    fn catch_all_serves_unknown_hosts() {
        let cfg = CanaryConfig {
            product: "Urbs".to_string(),
            ..Default::default()
        };
        let canary = Canary::new(&cfg, "gw-catchall").unwrap();
        let catch_all = Arc::new(LabelBalancer::new("urbs-core", None));
        let proxy = GatewayProxy::new(canary, HashMap::new(), Some(catch_all));
        assert!(proxy.balancer_for("whatever.example.com").is_some());
    }

    #[test]
    fn gateway_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayProxy>();
        assert_send_sync::<GatewayCtx>();
    }
}
