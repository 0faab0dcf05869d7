//! In-memory media engine for coordinator tests.
//!
//! `MockMediaEngine` keeps the objects it created, so tests can check that
//! nothing leaks, and can be scripted to:
//! - Fail an operation once or persistently
//! - Delay or hang an operation (for timeout tests)
//! - Close a transport out-of-band or kill its "worker"
//!
//! Compatibility follows codec support: `can_consume` holds when the
//! client capabilities list the mime type of the producer's first codec.
//!
//! # Example
//!
//! ```rust,ignore
//! use sc_test_utils::{MockMediaEngine, EngineOp};
//!
//! let engine = MockMediaEngine::new();
//! engine.fail_next(EngineOp::Produce, EngineError::Rejected("bad".into()));
//! engine.delay(EngineOp::CreateWebRtcTransport, Duration::from_secs(30));
//! ```

use crate::fixtures;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use parking_lot::Mutex;
use sc_service::engine::{
    ConsumerInfo, EngineError, EngineEvent, MediaEngine, PlainTransportInfo, WebRtcTransportInfo,
    ENGINE_EVENT_CHANNEL_CAPACITY,
};
use signaling_protocol::{DtlsParameters, RtpCapabilities, RtpParameters};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::broadcast;

/// First local port handed out to plain transports.
const PLAIN_TRANSPORT_BASE_PORT: u16 = 20_000;

/// Engine operations that can be scripted and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    RtpCapabilities,
    CreateWebRtcTransport,
    ConnectWebRtcTransport,
    Produce,
    CanConsume,
    Consume,
    ResumeConsumer,
    CreatePlainTransport,
    ConnectPlainTransport,
    CloseTransport,
    CloseProducer,
    CloseConsumer,
}

#[derive(Debug, Clone)]
struct MockTransport {
    plain: bool,
    connected: bool,
}

#[derive(Debug, Clone)]
struct MockProducer {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone)]
struct MockConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

/// A `connect_plain_transport` call as the engine saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainConnection {
    pub transport_id: TransportId,
    pub ip: IpAddr,
    pub port: u16,
    pub rtcp_port: Option<u16>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    transports: HashMap<TransportId, MockTransport>,
    producers: HashMap<ProducerId, MockProducer>,
    consumers: HashMap<ConsumerId, MockConsumer>,
    plain_connections: Vec<PlainConnection>,
    calls: HashMap<EngineOp, usize>,
    fail_next: HashMap<EngineOp, VecDeque<EngineError>>,
    fail_always: HashMap<EngineOp, EngineError>,
    delays: HashMap<EngineOp, Duration>,
    hangs: HashSet<EngineOp>,
    closed_transports: Vec<TransportId>,
    closed_consumers: Vec<ConsumerId>,
    closed_producers: Vec<ProducerId>,
    worker_dead: bool,
}

impl MockState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Drop a transport and everything created on it.
    fn remove_transport(&mut self, transport_id: &TransportId) -> bool {
        if self.transports.remove(transport_id).is_none() {
            return false;
        }
        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.remove_producer(&producer_id);
        }
        self.consumers
            .retain(|_, c| &c.transport_id != transport_id);
        self.closed_transports.push(transport_id.clone());
        true
    }

    /// Drop a producer and the consumers fed by it.
    fn remove_producer(&mut self, producer_id: &ProducerId) -> bool {
        if self.producers.remove(producer_id).is_none() {
            return false;
        }
        self.consumers.retain(|_, c| &c.producer_id != producer_id);
        self.closed_producers.push(producer_id.clone());
        true
    }
}

/// Scriptable `MediaEngine` double.
pub struct MockMediaEngine {
    state: Mutex<MockState>,
    events: broadcast::Sender<EngineEvent>,
    capabilities: RtpCapabilities,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaEngine {
    /// A healthy engine with the fixture router capabilities.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(ENGINE_EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MockState::default()),
            events,
            capabilities: fixtures::router_capabilities(),
        }
    }

    /// Fail the next call of `op` with `error`. Queued errors are used in order.
    pub fn fail_next(&self, op: EngineOp, error: EngineError) {
        self.state
            .lock()
            .fail_next
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Fail every call of `op` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: EngineOp, error: EngineError) {
        self.state.lock().fail_always.insert(op, error);
    }

    pub fn clear_failures(&self, op: EngineOp) {
        let mut state = self.state.lock();
        state.fail_next.remove(&op);
        state.fail_always.remove(&op);
    }

    /// Complete `op` only after `delay` (the object is still created).
    pub fn delay(&self, op: EngineOp, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    /// Never complete `op`.
    pub fn hang(&self, op: EngineOp) {
        self.state.lock().hangs.insert(op);
    }

    /// Undo [`delay`](Self::delay) and [`hang`](Self::hang) for `op`.
    pub fn respond_normally(&self, op: EngineOp) {
        let mut state = self.state.lock();
        state.delays.remove(&op);
        state.hangs.remove(&op);
    }

    /// Close a transport as if DTLS failed, and report it.
    pub fn close_transport_out_of_band(&self, transport_id: &TransportId) {
        let removed = self.state.lock().remove_transport(transport_id);
        if removed {
            let _ = self.events.send(EngineEvent::TransportClosed {
                transport_id: transport_id.clone(),
            });
        }
    }

    /// Report a failed DTLS handshake. The transport and its media stay
    /// open until someone closes them, as with a real router.
    pub fn report_dtls_failure(&self, transport_id: &TransportId) {
        let _ = self.events.send(EngineEvent::TransportClosed {
            transport_id: transport_id.clone(),
        });
    }

    /// Report the worker as dead. Every later call fails with `Unavailable`.
    pub fn kill_worker(&self, reason: &str) {
        self.state.lock().worker_dead = true;
        let _ = self.events.send(EngineEvent::WorkerDied {
            reason: reason.to_string(),
        });
    }

    /// Number of times `op` was called (including failed calls).
    #[must_use]
    pub fn calls(&self, op: EngineOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn open_transports(&self) -> usize {
        self.state.lock().transports.len()
    }

    #[must_use]
    pub fn open_webrtc_transports(&self) -> usize {
        self.state
            .lock()
            .transports
            .values()
            .filter(|t| !t.plain)
            .count()
    }

    #[must_use]
    pub fn open_plain_transports(&self) -> usize {
        self.state
            .lock()
            .transports
            .values()
            .filter(|t| t.plain)
            .count()
    }

    #[must_use]
    pub fn open_producers(&self) -> usize {
        self.state.lock().producers.len()
    }

    #[must_use]
    pub fn open_consumers(&self) -> usize {
        self.state.lock().consumers.len()
    }

    #[must_use]
    pub fn has_transport(&self, transport_id: &TransportId) -> bool {
        self.state.lock().transports.contains_key(transport_id)
    }

    #[must_use]
    pub fn is_connected(&self, transport_id: &TransportId) -> bool {
        self.state
            .lock()
            .transports
            .get(transport_id)
            .is_some_and(|t| t.connected)
    }

    #[must_use]
    pub fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.state.lock().producers.contains_key(producer_id)
    }

    /// `Some(paused)` for a live consumer.
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.state.lock().consumers.get(consumer_id).map(|c| c.paused)
    }

    /// Consumers currently fed by `producer_id`.
    #[must_use]
    pub fn consumers_of(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        self.state
            .lock()
            .consumers
            .iter()
            .filter(|(_, c)| &c.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn plain_connections(&self) -> Vec<PlainConnection> {
        self.state.lock().plain_connections.clone()
    }

    #[must_use]
    pub fn closed_transports(&self) -> Vec<TransportId> {
        self.state.lock().closed_transports.clone()
    }

    #[must_use]
    pub fn closed_producers(&self) -> Vec<ProducerId> {
        self.state.lock().closed_producers.clone()
    }

    #[must_use]
    pub fn closed_consumers(&self) -> Vec<ConsumerId> {
        self.state.lock().closed_consumers.clone()
    }

    /// Count the call, then apply scripted latency and failures.
    async fn enter(&self, op: EngineOp) -> Result<(), EngineError> {
        let (delay, hang, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            if state.worker_dead {
                return Err(EngineError::Unavailable("worker died".to_string()));
            }
            let queued = state.fail_next.get_mut(&op).and_then(VecDeque::pop_front);
            let failure = queued.or_else(|| state.fail_always.get(&op).cloned());
            (
                state.delays.get(&op).copied(),
                state.hangs.contains(&op),
                failure,
            )
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn unknown(kind: &'static str, id: &impl ToString) -> EngineError {
    EngineError::UnknownResource {
        kind,
        id: id.to_string(),
    }
}

#[async_trait::async_trait]
impl MediaEngine for MockMediaEngine {
    async fn rtp_capabilities(&self) -> Result<RtpCapabilities, EngineError> {
        self.enter(EngineOp::RtpCapabilities).await?;
        Ok(self.capabilities.clone())
    }

    async fn create_webrtc_transport(&self) -> Result<WebRtcTransportInfo, EngineError> {
        self.enter(EngineOp::CreateWebRtcTransport).await?;
        let mut state = self.state.lock();
        let id = TransportId::from(state.next("transport"));
        let n = state.next_id;
        state.transports.insert(
            id.clone(),
            MockTransport {
                plain: false,
                connected: false,
            },
        );
        Ok(WebRtcTransportInfo {
            id,
            ice_parameters: fixtures::ice_parameters(n),
            ice_candidates: fixtures::ice_candidates(40_000),
            dtls_parameters: fixtures::server_dtls_parameters(),
        })
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: &TransportId,
        _dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::ConnectWebRtcTransport).await?;
        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| unknown("transport", transport_id))?;
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.enter(EngineOp::Produce).await?;
        if fixtures::primary_mime_type(&rtp_parameters).is_none() {
            return Err(EngineError::Rejected(
                "rtpParameters carry no codec".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if !state.transports.contains_key(transport_id) {
            return Err(unknown("transport", transport_id));
        }
        let id = ProducerId::from(state.next("producer"));
        state.producers.insert(
            id.clone(),
            MockProducer {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters,
            },
        );
        Ok(id)
    }

    async fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.enter(EngineOp::CanConsume).await?;
        let state = self.state.lock();
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| unknown("producer", producer_id))?;
        Ok(fixtures::primary_mime_type(&producer.rtp_parameters)
            .is_some_and(|mime| fixtures::supports_mime_type(rtp_capabilities, &mime)))
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        _rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        self.enter(EngineOp::Consume).await?;
        let mut state = self.state.lock();
        if !state.transports.contains_key(transport_id) {
            return Err(unknown("transport", transport_id));
        }
        let producer = state
            .producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| unknown("producer", producer_id))?;
        let id = ConsumerId::from(state.next("consumer"));
        state.consumers.insert(
            id.clone(),
            MockConsumer {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                paused,
            },
        );
        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.enter(EngineOp::ResumeConsumer).await?;
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| unknown("consumer", consumer_id))?;
        consumer.paused = false;
        Ok(())
    }

    async fn create_plain_transport(&self) -> Result<PlainTransportInfo, EngineError> {
        self.enter(EngineOp::CreatePlainTransport).await?;
        let mut state = self.state.lock();
        let id = TransportId::from(state.next("plain"));
        let offset = u16::try_from(state.next_id % 1_000).unwrap_or(0);
        state.transports.insert(
            id.clone(),
            MockTransport {
                plain: true,
                connected: false,
            },
        );
        Ok(PlainTransportInfo {
            id,
            local_port: PLAIN_TRANSPORT_BASE_PORT + offset * 2,
            local_rtcp_port: Some(PLAIN_TRANSPORT_BASE_PORT + offset * 2 + 1),
        })
    }

    async fn connect_plain_transport(
        &self,
        transport_id: &TransportId,
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::ConnectPlainTransport).await?;
        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| unknown("transport", transport_id))?;
        transport.connected = true;
        state.plain_connections.push(PlainConnection {
            transport_id: transport_id.clone(),
            ip,
            port,
            rtcp_port,
        });
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError> {
        self.enter(EngineOp::CloseTransport).await?;
        if self.state.lock().remove_transport(transport_id) {
            Ok(())
        } else {
            Err(unknown("transport", transport_id))
        }
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError> {
        self.enter(EngineOp::CloseProducer).await?;
        if self.state.lock().remove_producer(producer_id) {
            Ok(())
        } else {
            Err(unknown("producer", producer_id))
        }
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.enter(EngineOp::CloseConsumer).await?;
        let mut state = self.state.lock();
        if state.consumers.remove(consumer_id).is_some() {
            state.closed_consumers.push(consumer_id.clone());
            Ok(())
        } else {
            Err(unknown("consumer", consumer_id))
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closing_transport_drops_its_objects() {
        let engine = MockMediaEngine::new();
        let send = engine.create_webrtc_transport().await.unwrap();
        let recv = engine.create_webrtc_transport().await.unwrap();
        let producer = engine
            .produce(
                &send.id,
                MediaKind::Video,
                fixtures::rtp_parameters(MediaKind::Video),
            )
            .await
            .unwrap();
        engine
            .consume(&recv.id, &producer, fixtures::client_capabilities(), true)
            .await
            .unwrap();

        engine.close_transport(&send.id).await.unwrap();

        assert_eq!(engine.open_transports(), 1);
        assert_eq!(engine.open_producers(), 0);
        assert_eq!(engine.open_consumers(), 0);
    }

    #[tokio::test]
    async fn test_can_consume_follows_codecs() {
        let engine = MockMediaEngine::new();
        let send = engine.create_webrtc_transport().await.unwrap();
        let producer = engine
            .produce(
                &send.id,
                MediaKind::Video,
                fixtures::rtp_parameters(MediaKind::Video),
            )
            .await
            .unwrap();

        assert!(engine
            .can_consume(&producer, &fixtures::client_capabilities())
            .await
            .unwrap());
        assert!(!engine
            .can_consume(&producer, &fixtures::audio_only_capabilities())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fail_next_is_used_once() {
        let engine = MockMediaEngine::new();
        engine.fail_next(
            EngineOp::CreateWebRtcTransport,
            EngineError::Rejected("nope".to_string()),
        );

        assert!(engine.create_webrtc_transport().await.is_err());
        assert!(engine.create_webrtc_transport().await.is_ok());
        assert_eq!(engine.calls(EngineOp::CreateWebRtcTransport), 2);
    }

    #[tokio::test]
    async fn test_dead_worker_rejects_calls() {
        let engine = MockMediaEngine::new();
        let mut events = engine.subscribe_events();
        engine.kill_worker("segfault");

        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::WorkerDied { .. }
        ));
        assert!(matches!(
            engine.create_webrtc_transport().await,
            Err(EngineError::Unavailable(_))
        ));
    }
}
