//! # SC Test Utilities
//!
//! Shared test utilities for the Session Coordinator (SC) service.
//!
//! This crate provides test doubles for the coordinator's two external
//! seams and a harness for running the real coordinator on top of them,
//! without a mediasoup worker or an ffmpeg binary.
//!
//! ## Modules
//!
//! - `mock_engine` - In-memory `MediaEngine` with scripted failures and hangs
//! - `mock_transcoder` - `Transcoder` with scripted lifecycle events
//! - `fixtures` - Negotiation parameters (capabilities, RTP, DTLS)
//! - `harness` - `TestHarness` / `TestClient`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = Arc::new(MockMediaEngine::new());
//!     engine.fail_next(EngineOp::Consume, EngineError::Rejected("bad caps".into()));
//!
//!     let harness = TestHarness::builder().engine(engine).build().await;
//!     let alice = harness.connect();
//!     alice.open_send_transport().await;
//!
//!     // Run your test...
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_engine;
pub mod mock_transcoder;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
pub use mock_engine::*;
pub use mock_transcoder::*;
