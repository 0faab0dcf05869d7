//! Timeout-bounded access to the media engine.

use super::{ConsumerInfo, EngineError, EngineEvent, MediaEngine, PlainTransportInfo, WebRtcTransportInfo};
use crate::errors::ScError;
use crate::observability::metrics;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use futures::future::BoxFuture;
use signaling_protocol::{DtlsParameters, RtpCapabilities, RtpParameters};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// An engine object that must be closed if nobody ends up owning it.
trait Reapable: Send + 'static {
    fn reap(self, engine: Arc<dyn MediaEngine>) -> BoxFuture<'static, ()>;
}

impl Reapable for WebRtcTransportInfo {
    fn reap(self, engine: Arc<dyn MediaEngine>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _ = engine.close_transport(&self.id).await;
            debug!(target: "sc.engine", transport_id = %self.id, "Reaped late transport");
        })
    }
}

impl Reapable for PlainTransportInfo {
    fn reap(self, engine: Arc<dyn MediaEngine>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _ = engine.close_transport(&self.id).await;
            debug!(target: "sc.engine", transport_id = %self.id, "Reaped late plain transport");
        })
    }
}

impl Reapable for ProducerId {
    fn reap(self, engine: Arc<dyn MediaEngine>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _ = engine.close_producer(&self).await;
            debug!(target: "sc.engine", producer_id = %self, "Reaped late producer");
        })
    }
}

impl Reapable for ConsumerInfo {
    fn reap(self, engine: Arc<dyn MediaEngine>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _ = engine.close_consumer(&self.id).await;
            debug!(target: "sc.engine", consumer_id = %self.id, "Reaped late consumer");
        })
    }
}

/// Media engine wrapper that bounds every call by `call_timeout`.
///
/// Calls that create engine objects run on their own task. If such a call
/// times out, the task is left running and whatever it eventually creates
/// is closed immediately.
#[derive(Clone)]
pub struct BoundedEngine {
    engine: Arc<dyn MediaEngine>,
    call_timeout: Duration,
}

impl BoundedEngine {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, call_timeout: Duration) -> Self {
        Self {
            engine,
            call_timeout,
        }
    }

    /// The configured per-call timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.subscribe_events()
    }

    fn timed_out(operation: &'static str) -> ScError {
        metrics::record_engine_timeout(operation);
        warn!(
            target: "sc.engine",
            operation,
            "Media engine call timed out"
        );
        ScError::EngineTimeout { operation }
    }

    /// Bound a call that creates nothing.
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ScError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(ScError::from),
            Err(_) => Err(Self::timed_out(operation)),
        }
    }

    /// Bound a call that creates an engine object, reaping late results.
    async fn call_reaping<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ScError>
    where
        T: Reapable,
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let mut task = tokio::spawn(fut);
        match tokio::time::timeout(self.call_timeout, &mut task).await {
            Ok(Ok(result)) => result.map_err(ScError::from),
            Ok(Err(join_error)) => Err(ScError::Internal(format!(
                "engine {operation} task failed: {join_error}"
            ))),
            Err(_) => {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    if let Ok(Ok(resource)) = task.await {
                        resource.reap(engine).await;
                    }
                });
                Err(Self::timed_out(operation))
            }
        }
    }

    pub async fn rtp_capabilities(&self) -> Result<RtpCapabilities, ScError> {
        self.call("rtp_capabilities", self.engine.rtp_capabilities())
            .await
    }

    pub async fn create_webrtc_transport(&self) -> Result<WebRtcTransportInfo, ScError> {
        let engine = Arc::clone(&self.engine);
        self.call_reaping("create_webrtc_transport", async move {
            engine.create_webrtc_transport().await
        })
        .await
    }

    pub async fn connect_webrtc_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ScError> {
        self.call(
            "connect_webrtc_transport",
            self.engine
                .connect_webrtc_transport(transport_id, dtls_parameters),
        )
        .await
    }

    pub async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, ScError> {
        let engine = Arc::clone(&self.engine);
        let transport_id = transport_id.clone();
        self.call_reaping("produce", async move {
            engine.produce(&transport_id, kind, rtp_parameters).await
        })
        .await
    }

    pub async fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, ScError> {
        self.call(
            "can_consume",
            self.engine.can_consume(producer_id, rtp_capabilities),
        )
        .await
    }

    pub async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, ScError> {
        let engine = Arc::clone(&self.engine);
        let transport_id = transport_id.clone();
        let producer_id = producer_id.clone();
        self.call_reaping("consume", async move {
            engine
                .consume(&transport_id, &producer_id, rtp_capabilities, paused)
                .await
        })
        .await
    }

    pub async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), ScError> {
        self.call("resume_consumer", self.engine.resume_consumer(consumer_id))
            .await
    }

    pub async fn create_plain_transport(&self) -> Result<PlainTransportInfo, ScError> {
        let engine = Arc::clone(&self.engine);
        self.call_reaping("create_plain_transport", async move {
            engine.create_plain_transport().await
        })
        .await
    }

    pub async fn connect_plain_transport(
        &self,
        transport_id: &TransportId,
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    ) -> Result<(), ScError> {
        self.call(
            "connect_plain_transport",
            self.engine
                .connect_plain_transport(transport_id, ip, port, rtcp_port),
        )
        .await
    }

    /// Close a transport. Failures are logged; the object is gone either way.
    pub async fn close_transport(&self, transport_id: &TransportId) {
        if let Err(e) = self
            .call("close_transport", self.engine.close_transport(transport_id))
            .await
        {
            debug!(target: "sc.engine", transport_id = %transport_id, error = %e, "Transport close failed");
        }
    }

    /// Close a producer. Failures are logged.
    pub async fn close_producer(&self, producer_id: &ProducerId) {
        if let Err(e) = self
            .call("close_producer", self.engine.close_producer(producer_id))
            .await
        {
            debug!(target: "sc.engine", producer_id = %producer_id, error = %e, "Producer close failed");
        }
    }

    /// Close a consumer. Failures are logged.
    pub async fn close_consumer(&self, consumer_id: &ConsumerId) {
        if let Err(e) = self
            .call("close_consumer", self.engine.close_consumer(consumer_id))
            .await
        {
            debug!(target: "sc.engine", consumer_id = %consumer_id, error = %e, "Consumer close failed");
        }
    }
}
