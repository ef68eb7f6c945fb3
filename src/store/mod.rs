//! Label cache for the canary middleware.
//!
//! Provides the per-uid label cache consulted on every request, plus the
//! process-global registry that keeps warm caches across middleware
//! reconfiguration.

mod label_store;

pub use label_store::LabelStore;
