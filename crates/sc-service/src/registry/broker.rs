//! Producer and consumer records and the produce/consume negotiation.

use super::{NotificationFanout, SessionDirectory, TransportRegistry};
use crate::egress::EgressBridgeHandle;
use crate::engine::{BoundedEngine, ConsumerInfo};
use crate::errors::ScError;
use crate::observability::metrics;
use common::types::{ConsumerId, Direction, MediaKind, ProducerId, SessionId, TransportId};
use parking_lot::Mutex;
use signaling_protocol::{Notification, RtpCapabilities, RtpParameters};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State of a live consumer. Closed consumers are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Paused,
    Active,
}

#[derive(Debug, Clone)]
struct ProducerRecord {
    owner: SessionId,
    kind: MediaKind,
    transport_id: TransportId,
}

#[derive(Debug, Clone)]
struct ConsumerRecord {
    owner: SessionId,
    producer_id: ProducerId,
    transport_id: TransportId,
    state: ConsumerState,
}

#[derive(Debug, Default)]
struct Media {
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

impl Media {
    fn publish_gauges(&self) {
        metrics::set_producers_active(self.producers.len());
        metrics::set_consumers_active(self.consumers.len());
    }

    /// Consumers of `producer_id` owned by sessions other than `except`.
    fn dependents(&self, producer_id: &ProducerId, except: SessionId) -> Vec<(SessionId, ConsumerId)> {
        self.consumers
            .iter()
            .filter(|(_, c)| &c.producer_id == producer_id && c.owner != except)
            .map(|(id, c)| (c.owner, id.clone()))
            .collect()
    }
}

/// Owns producer and consumer records.
///
/// Every mutation of a session's records runs on that session's actor;
/// effects on other sessions' records are delivered to their actors.
pub struct ProducerConsumerBroker {
    engine: BoundedEngine,
    sessions: Arc<SessionDirectory>,
    transports: Arc<TransportRegistry>,
    fanout: NotificationFanout,
    egress: EgressBridgeHandle,
    inner: Mutex<Media>,
}

impl ProducerConsumerBroker {
    #[must_use]
    pub fn new(
        engine: BoundedEngine,
        sessions: Arc<SessionDirectory>,
        transports: Arc<TransportRegistry>,
        fanout: NotificationFanout,
        egress: EgressBridgeHandle,
    ) -> Self {
        Self {
            engine,
            sessions,
            transports,
            fanout,
            egress,
            inner: Mutex::new(Media::default()),
        }
    }

    /// Register a new producer on the session's connected send transport.
    ///
    /// Notifies the scoped recipients with `new-producer` and, for video,
    /// activates the egress bridge.
    ///
    /// # Errors
    ///
    /// - `NotFound` without a connected send transport
    /// - `SessionClosed` if the session went away during the engine call
    /// - engine failures
    pub async fn produce(
        &self,
        session_id: SessionId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, ScError> {
        let transport_id = self
            .transports
            .connected(session_id, Direction::Send)
            .ok_or_else(|| ScError::NotFound("No connected send transport".to_string()))?;

        let producer_id = self
            .engine
            .produce(&transport_id, kind, rtp_parameters)
            .await?;

        if !self.sessions.is_live(session_id) {
            self.engine.close_producer(&producer_id).await;
            return Err(ScError::SessionClosed);
        }

        {
            let mut media = self.inner.lock();
            media.producers.insert(
                producer_id.clone(),
                ProducerRecord {
                    owner: session_id,
                    kind,
                    transport_id,
                },
            );
            media.publish_gauges();
        }

        info!(
            target: "sc.registry.broker",
            session_id = %session_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );

        self.fanout.broadcast(
            session_id,
            &Notification::NewProducer {
                producer_id: producer_id.clone(),
            },
        );

        if kind == MediaKind::Video {
            if let Err(e) = self.egress.activate(producer_id.clone()).await {
                warn!(
                    target: "sc.registry.broker",
                    producer_id = %producer_id,
                    error = %e,
                    "Failed to signal egress activation"
                );
            }
        }

        Ok(producer_id)
    }

    /// Create a paused consumer of `producer_id` on the session's connected
    /// receive transport.
    ///
    /// # Errors
    ///
    /// - `Incompatible` for unknown producers or when the engine's
    ///   compatibility predicate is false (nothing else is called)
    /// - `NotFound` without a connected receive transport
    /// - `SessionClosed` if the session went away during the engine call
    /// - engine failures
    pub async fn consume(
        &self,
        session_id: SessionId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, ScError> {
        if !self.inner.lock().producers.contains_key(&producer_id) {
            return Err(ScError::Incompatible);
        }

        match self.engine.can_consume(&producer_id, &rtp_capabilities).await {
            Ok(true) => {}
            Ok(false) | Err(ScError::NotFound(_)) => return Err(ScError::Incompatible),
            Err(e) => return Err(e),
        }

        let transport_id = self
            .transports
            .connected(session_id, Direction::Recv)
            .ok_or_else(|| ScError::NotFound("No connected recv transport".to_string()))?;

        let consumer = self
            .engine
            .consume(&transport_id, &producer_id, rtp_capabilities, true)
            .await?;

        if !self.sessions.is_live(session_id) {
            self.engine.close_consumer(&consumer.id).await;
            return Err(ScError::SessionClosed);
        }

        let inserted = {
            let mut media = self.inner.lock();
            // The source may have closed while the engine was consuming
            let source_live = media.producers.contains_key(&producer_id);
            if source_live {
                media.consumers.insert(
                    consumer.id.clone(),
                    ConsumerRecord {
                        owner: session_id,
                        producer_id: producer_id.clone(),
                        transport_id,
                        state: ConsumerState::Paused,
                    },
                );
                media.publish_gauges();
            }
            source_live
        };

        if !inserted {
            self.engine.close_consumer(&consumer.id).await;
            return Err(ScError::NotFound("Producer closed".to_string()));
        }

        info!(
            target: "sc.registry.broker",
            session_id = %session_id,
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            "Consumer created (paused)"
        );
        Ok(consumer)
    }

    /// Resume a consumer owned by `session_id`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the consumer is unknown or owned by another session
    /// - engine failures (the consumer keeps its state)
    pub async fn resume(&self, session_id: SessionId, consumer_id: &ConsumerId) -> Result<(), ScError> {
        let owned = self
            .inner
            .lock()
            .consumers
            .get(consumer_id)
            .is_some_and(|c| c.owner == session_id);
        if !owned {
            return Err(ScError::NotFound("Consumer not found".to_string()));
        }

        self.engine.resume_consumer(consumer_id).await?;

        if let Some(record) = self.inner.lock().consumers.get_mut(consumer_id) {
            record.state = ConsumerState::Active;
        }
        debug!(
            target: "sc.registry.broker",
            session_id = %session_id,
            consumer_id = %consumer_id,
            "Consumer resumed"
        );
        Ok(())
    }

    /// Close every producer and consumer owned by `session_id`.
    pub async fn close_all_for(&self, session_id: SessionId) {
        let (producers, consumers) = {
            let mut media = self.inner.lock();
            let producer_ids: Vec<ProducerId> = media
                .producers
                .iter()
                .filter(|(_, p)| p.owner == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            let consumer_ids: Vec<ConsumerId> = media
                .consumers
                .iter()
                .filter(|(_, c)| c.owner == session_id)
                .map(|(id, _)| id.clone())
                .collect();

            let producers: Vec<_> = producer_ids
                .into_iter()
                .filter_map(|id| media.producers.remove(&id).map(|p| (id, p)))
                .collect();
            for id in &consumer_ids {
                media.consumers.remove(id);
            }
            media.publish_gauges();
            (producers, consumer_ids)
        };

        for consumer_id in &consumers {
            self.engine.close_consumer(consumer_id).await;
        }
        for (producer_id, record) in producers {
            self.engine.close_producer(&producer_id).await;
            self.after_producer_closed(producer_id, record).await;
        }

        debug!(
            target: "sc.registry.broker",
            session_id = %session_id,
            consumers = consumers.len(),
            "Closed all media of session"
        );
    }

    /// Close the media carried by a transport the engine reported closed
    /// out-of-band, consumers first.
    pub async fn release_transport_media(&self, session_id: SessionId, transport_id: &TransportId) {
        let (producers, consumers) = {
            let mut media = self.inner.lock();
            let producer_ids: Vec<ProducerId> = media
                .producers
                .iter()
                .filter(|(_, p)| p.owner == session_id && &p.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            let consumer_ids: Vec<ConsumerId> = media
                .consumers
                .iter()
                .filter(|(_, c)| c.owner == session_id && &c.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();

            let producers: Vec<_> = producer_ids
                .into_iter()
                .filter_map(|id| media.producers.remove(&id).map(|p| (id, p)))
                .collect();
            for id in &consumer_ids {
                media.consumers.remove(id);
            }
            media.publish_gauges();
            (producers, consumer_ids)
        };

        for consumer_id in &consumers {
            self.engine.close_consumer(consumer_id).await;
        }
        if let Some(owner) = self.sessions.get(session_id) {
            for consumer_id in consumers {
                owner.notify(Notification::ConsumerClosed { consumer_id });
            }
        }
        for (producer_id, record) in producers {
            self.engine.close_producer(&producer_id).await;
            self.after_producer_closed(producer_id, record).await;
        }
    }

    /// Drop a consumer whose source producer closed, and tell its owner.
    ///
    /// Runs on the owner's actor. Returns false if the consumer was already gone.
    pub async fn close_orphaned_consumer(&self, session_id: SessionId, consumer_id: ConsumerId) -> bool {
        let removed = {
            let mut media = self.inner.lock();
            let owned = media
                .consumers
                .get(&consumer_id)
                .is_some_and(|c| c.owner == session_id);
            if owned {
                media.consumers.remove(&consumer_id);
                media.publish_gauges();
            }
            owned
        };
        if !removed {
            return false;
        }

        self.engine.close_consumer(&consumer_id).await;
        if let Some(owner) = self.sessions.get(session_id) {
            owner.notify(Notification::ConsumerClosed { consumer_id });
        }
        true
    }

    /// Notifications, egress teardown and dependent consumers of a closed producer.
    async fn after_producer_closed(&self, producer_id: ProducerId, record: ProducerRecord) {
        info!(
            target: "sc.registry.broker",
            session_id = %record.owner,
            producer_id = %producer_id,
            kind = record.kind.as_str(),
            "Producer closed"
        );

        self.fanout.broadcast(
            record.owner,
            &Notification::ProducerClosed {
                producer_id: producer_id.clone(),
            },
        );

        if record.kind == MediaKind::Video {
            if let Err(e) = self.egress.deactivate(producer_id.clone()).await {
                warn!(
                    target: "sc.registry.broker",
                    producer_id = %producer_id,
                    error = %e,
                    "Failed to signal egress deactivation"
                );
            }
        }

        let dependents = self.inner.lock().dependents(&producer_id, record.owner);
        for (owner, consumer_id) in dependents {
            if let Some(handle) = self.sessions.get(owner) {
                handle.source_producer_closed(consumer_id);
            }
        }
    }

    #[must_use]
    pub fn consumer_state(&self, consumer_id: &ConsumerId) -> Option<ConsumerState> {
        self.inner
            .lock()
            .consumers
            .get(consumer_id)
            .map(|c| c.state)
    }

    #[must_use]
    pub fn producer_owner(&self, producer_id: &ProducerId) -> Option<SessionId> {
        self.inner
            .lock()
            .producers
            .get(producer_id)
            .map(|p| p.owner)
    }

    #[must_use]
    pub fn producers_of(&self, session_id: SessionId) -> Vec<ProducerId> {
        self.inner
            .lock()
            .producers
            .iter()
            .filter(|(_, p)| p.owner == session_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn consumers_of(&self, session_id: SessionId) -> Vec<ConsumerId> {
        self.inner
            .lock()
            .consumers
            .iter()
            .filter(|(_, c)| c.owner == session_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.inner.lock().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }
}
