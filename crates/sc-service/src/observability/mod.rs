//! Observability for the Session Coordinator.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields;
//! client-supplied negotiation parameters are never logged. Metric labels
//! are bounded enums (see [`metrics`]).
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sc_sessions_active` | Gauge | none |
//! | `sc_transports_active` | Gauge | none |
//! | `sc_producers_active` | Gauge | none |
//! | `sc_consumers_active` | Gauge | none |
//! | `sc_signaling_requests_total` | Counter | `event`, `status` |
//! | `sc_signaling_latency_seconds` | Histogram | `event` |
//! | `sc_engine_timeouts_total` | Counter | `operation` |
//! | `sc_egress_transitions_total` | Counter | `state` |
//! | `sc_actor_mailbox_depth` | Gauge | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
