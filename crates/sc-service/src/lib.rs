//! Session Coordinator (SC) Service Library
//!
//! The Session Coordinator is the signaling and orchestration half of the
//! Stagehand media server:
//!
//! - WebSocket signaling: clients negotiate transports, publish tracks and
//!   subscribe to other participants' tracks over JSON frames
//! - Session lifecycle: every connection owns its transports, producers and
//!   consumers, which are released exactly once when it goes away
//! - Notification fan-out of new and closed producers
//! - Egress: one live video track at a time is bridged into an external
//!   transcoder that writes a rolling HLS playlist
//!
//! # Architecture
//!
//! ```text
//! SessionCoordinator (singleton)
//! ├── EgressBridge actor (HLS output slot + standby queue)
//! └── supervises N SessionActors
//!     └── SessionActor (one per signaling connection)
//! ```
//!
//! Shared state lives in [`registry`]; every media operation goes through a
//! timeout-bounded [`engine::MediaEngine`].
//!
//! # Modules
//!
//! - [`actors`] - Coordinator and per-session actors
//! - [`config`] - Service configuration from environment
//! - [`egress`] - HLS egress bridge and transcoder process supervision
//! - [`engine`] - Media engine seam and the `mediasoup` adapter
//! - [`errors`] - Error types with client-facing error codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`registry`] - Session, room, transport and producer/consumer records
//! - [`signaling`] - WebSocket endpoint

pub mod actors;
pub mod config;
pub mod egress;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod registry;
pub mod signaling;
