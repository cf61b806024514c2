//! Routing rule engine.
//!
//! Rules are CEL-conditioned overrides of the target `(provider, model)`
//! plus prepended fallbacks, scoped virtual-key → team → customer →
//! global. Rule sets are compiled once per config snapshot and evaluated
//! read-only per request.

mod engine;

pub use engine::{RouteOverride, RoutingEngine};
