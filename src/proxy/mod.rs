//! HTTP request proxying and label-based variant selection.
//!
//! The gateway runs the canary middleware on every request, then routes it
//! to the upstream variant whose name matches the resolved label, with
//! longest-prefix fallback and an optional default sink.

mod balancer;
mod gateway;
mod upstream;

pub use balancer::{normalize_service_name, LabelBalancer};
pub use gateway::GatewayProxy;
pub use upstream::{split_host_port, Upstream};
