//! Actor model for the Session Coordinator.
//!
//! ```text
//! SessionCoordinator (singleton)
//! ├── engine event supervisor (worker death, out-of-band transport closes)
//! ├── EgressBridge actor (singleton, owns the transcoder output slot)
//! └── supervises N SessionActors
//!     └── SessionActor (one per signaling connection)
//!         └── serializes every operation on the session's media state
//! ```
//!
//! Each actor owns a bounded mpsc mailbox; handles send messages and wait
//! on oneshot replies. Cancellation flows from the coordinator's root
//! `CancellationToken` to child tokens.

pub mod coordinator;
pub mod metrics;
pub mod session;

pub use coordinator::SessionCoordinator;
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use session::{SessionActor, SessionHandle, OUTBOUND_CHANNEL_CAPACITY};
