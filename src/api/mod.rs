//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub outbox submission and collection reads
//! - Metrics (Prometheus)

pub mod metrics;
mod outbox;

pub use metrics::metrics_router;
pub use outbox::outbox_router;
