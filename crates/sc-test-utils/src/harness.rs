//! Coordinator test harness.
//!
//! Provides `TestHarness` for running a real `SessionCoordinator` on top of
//! the mock engine and transcoder, and `TestClient` for driving a session
//! the way the signaling endpoint does.
//!
//! # Example
//! ```rust,ignore
//! #[tokio::test]
//! async fn test_publish() {
//!     let harness = TestHarness::start().await;
//!     let mut alice = harness.connect();
//!     alice.open_send_transport().await;
//!     let producer_id = alice.publish(MediaKind::Video).await;
//!     harness.wait_for_egress_state(&producer_id, EgressState::Running).await;
//! }
//! ```

use crate::fixtures;
use crate::mock_engine::MockMediaEngine;
use crate::mock_transcoder::MockTranscoder;
use common::types::{Direction, MediaKind, ProducerId, SessionId};
use sc_service::actors::{SessionCoordinator, SessionHandle, OUTBOUND_CHANNEL_CAPACITY};
use sc_service::config::{Config, NotificationScope};
use sc_service::egress::{EgressState, EgressStatus};
use sc_service::engine::MediaEngine;
use sc_service::observability::HealthState;
use signaling_protocol::{ConsumerParams, Notification, ServerFrame, TransportParams};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Polling interval of the `wait_for_*` helpers.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls before a `wait_for_*` helper gives up.
const POLL_ATTEMPTS: usize = 300;

/// Builder for [`TestHarness`].
#[derive(Default)]
pub struct TestHarnessBuilder {
    scope: Option<NotificationScope>,
    call_timeout: Option<Duration>,
    max_attempts: Option<u32>,
    backoff: Option<(Duration, Duration)>,
    engine: Option<Arc<MockMediaEngine>>,
    transcoder: Option<MockTranscoder>,
}

impl TestHarnessBuilder {
    #[must_use]
    pub fn scope(mut self, scope: NotificationScope) -> Self {
        self.scope = Some(scope);
        self
    }

    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Some((base, max));
        self
    }

    #[must_use]
    pub fn engine(mut self, engine: Arc<MockMediaEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    #[must_use]
    pub fn transcoder(mut self, transcoder: MockTranscoder) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    /// Start the coordinator. Panics if it cannot start.
    pub async fn build(self) -> TestHarness {
        let output_dir = tempfile::tempdir().expect("Failed to create HLS output directory");

        let mut config = Config::from_vars(&HashMap::from([(
            "SC_ID".to_string(),
            "sc-test".to_string(),
        )]))
        .expect("Default test configuration must be valid");
        config.egress.output_dir = output_dir.path().join("hls");
        if let Some(scope) = self.scope {
            config.notification_scope = scope;
        }
        if let Some(timeout) = self.call_timeout {
            config.engine.call_timeout = timeout;
        }
        if let Some(attempts) = self.max_attempts {
            config.egress.max_attempts = attempts;
        }
        let (base, max) = self
            .backoff
            .unwrap_or((Duration::from_millis(20), Duration::from_millis(200)));
        config.egress.backoff_base = base;
        config.egress.backoff_max = max;

        let engine = self.engine.unwrap_or_default();
        let transcoder = self.transcoder.unwrap_or_default();
        let health = Arc::new(HealthState::new());

        let coordinator = SessionCoordinator::start(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Arc::new(transcoder.clone()),
            &config,
            Arc::clone(&health),
        )
        .await
        .expect("Coordinator failed to start");

        TestHarness {
            coordinator: Arc::new(coordinator),
            engine,
            transcoder,
            health,
            config,
            _output_dir: output_dir,
        }
    }
}

/// A running coordinator over mocks.
pub struct TestHarness {
    pub coordinator: Arc<SessionCoordinator>,
    pub engine: Arc<MockMediaEngine>,
    pub transcoder: MockTranscoder,
    pub health: Arc<HealthState>,
    pub config: Config,
    _output_dir: TempDir,
}

impl TestHarness {
    #[must_use]
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    /// Start with default settings.
    pub async fn start() -> Self {
        Self::builder().build().await
    }

    /// Open a session. Panics if the coordinator refuses it.
    pub fn connect(&self) -> TestClient {
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let handle = self
            .coordinator
            .connect(tx)
            .expect("Coordinator refused connection");
        TestClient {
            handle,
            outbound: rx,
            coordinator: Arc::clone(&self.coordinator),
        }
    }

    /// Where the transcoder writes the HLS playlist.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.config.egress.manifest_path()
    }

    pub async fn egress_status(&self) -> EgressStatus {
        self.coordinator
            .egress()
            .status()
            .await
            .expect("Egress bridge stopped")
    }

    /// Wait until `producer_id` holds the output slot in `state`.
    pub async fn wait_for_egress_state(&self, producer_id: &ProducerId, state: EgressState) {
        let mut last = None;
        for _ in 0..POLL_ATTEMPTS {
            let status = self.egress_status().await;
            if status
                .active
                .as_ref()
                .is_some_and(|a| &a.producer_id == producer_id && a.state == state)
            {
                return;
            }
            last = Some(status);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("Egress for {producer_id} never reached {state:?}; last status: {last:?}");
    }

    /// Wait until the output slot is empty.
    pub async fn wait_for_egress_idle(&self) {
        for _ in 0..POLL_ATTEMPTS {
            if self.egress_status().await.active.is_none() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("Egress never became idle");
    }

    /// Poll `condition` until it holds.
    pub async fn wait_until(&self, what: &str, condition: impl Fn() -> bool) {
        for _ in 0..POLL_ATTEMPTS {
            if condition() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("Timed out waiting for {what}");
    }
}

/// One connected session plus the frames the server pushed to it.
pub struct TestClient {
    pub handle: SessionHandle,
    pub outbound: mpsc::Receiver<ServerFrame>,
    coordinator: Arc<SessionCoordinator>,
}

impl TestClient {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    /// Create and connect the send transport.
    pub async fn open_send_transport(&self) -> TransportParams {
        self.open_transport(Direction::Send).await
    }

    /// Create and connect the receive transport.
    pub async fn open_recv_transport(&self) -> TransportParams {
        self.open_transport(Direction::Recv).await
    }

    async fn open_transport(&self, direction: Direction) -> TransportParams {
        let params = self
            .handle
            .create_transport(direction)
            .await
            .expect("create-webrtc-transport failed");
        self.handle
            .connect_transport(direction, fixtures::dtls_parameters())
            .await
            .expect("connect-transport failed");
        params
    }

    /// Produce a track of `kind` on the (connected) send transport.
    pub async fn publish(&self, kind: MediaKind) -> ProducerId {
        self.handle
            .produce(kind, fixtures::rtp_parameters(kind))
            .await
            .expect("produce failed")
    }

    /// Consume `producer_id` with full capabilities and resume it.
    pub async fn subscribe(&self, producer_id: &ProducerId) -> ConsumerParams {
        let params = self
            .handle
            .consume(producer_id.clone(), fixtures::client_capabilities())
            .await
            .expect("consume failed");
        self.handle
            .resume_consumer(params.id.clone())
            .await
            .expect("resume-consumer failed");
        params
    }

    /// Next notification pushed to this client, skipping responses.
    pub async fn next_notification(&mut self) -> Notification {
        let deadline = POLL_INTERVAL * u32::try_from(POLL_ATTEMPTS).unwrap_or(u32::MAX);
        tokio::time::timeout(deadline, async {
            loop {
                match self.outbound.recv().await {
                    Some(ServerFrame::Notification(notification)) => return notification,
                    Some(ServerFrame::Response { .. }) => {}
                    None => panic!("Outbound channel closed"),
                }
            }
        })
        .await
        .expect("No notification arrived")
    }

    /// Every frame already queued for this client.
    pub fn drain_frames(&mut self) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Notifications already queued for this client.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.drain_frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::Notification(n) => Some(n),
                ServerFrame::Response { .. } => None,
            })
            .collect()
    }

    /// The signaling endpoint's disconnect path.
    pub async fn disconnect(&self) {
        self.coordinator.disconnect(self.handle.id()).await;
    }
}
