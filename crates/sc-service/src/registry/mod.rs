//! Process-wide session state.
//!
//! [`Registries`] bundles every registry behind one owner. Maps are held
//! behind short-lived mutexes; per-session ordering comes from the session
//! actors, which are the only callers that mutate a session's records.

mod broker;
mod fanout;
mod rooms;
mod sessions;
mod transports;

pub use broker::{ConsumerState, ProducerConsumerBroker};
pub use fanout::NotificationFanout;
pub use rooms::RoomRegistry;
pub use sessions::SessionDirectory;
pub use transports::{TransportRegistry, TransportState};

use crate::config::NotificationScope;
use crate::egress::EgressBridgeHandle;
use crate::engine::BoundedEngine;
use common::types::{Direction, SessionId, TransportId};
use signaling_protocol::RtpCapabilities;
use std::sync::Arc;
use tracing::info;

/// The coordinator's shared state.
pub struct Registries {
    sessions: Arc<SessionDirectory>,
    rooms: Arc<RoomRegistry>,
    transports: Arc<TransportRegistry>,
    broker: ProducerConsumerBroker,
    router_capabilities: RtpCapabilities,
}

impl Registries {
    #[must_use]
    pub fn new(
        engine: BoundedEngine,
        router_capabilities: RtpCapabilities,
        scope: NotificationScope,
        egress: EgressBridgeHandle,
    ) -> Self {
        let sessions = Arc::new(SessionDirectory::new());
        let rooms = Arc::new(RoomRegistry::new());
        let transports = Arc::new(TransportRegistry::new(
            engine.clone(),
            Arc::clone(&sessions),
        ));
        let fanout = NotificationFanout::new(Arc::clone(&sessions), Arc::clone(&rooms), scope);
        let broker = ProducerConsumerBroker::new(
            engine,
            Arc::clone(&sessions),
            Arc::clone(&transports),
            fanout,
            egress,
        );

        Self {
            sessions,
            rooms,
            transports,
            broker,
            router_capabilities,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionDirectory {
        &self.sessions
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    #[must_use]
    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    #[must_use]
    pub fn broker(&self) -> &ProducerConsumerBroker {
        &self.broker
    }

    /// The router's capability descriptor, fixed at startup.
    #[must_use]
    pub fn router_capabilities(&self) -> &RtpCapabilities {
        &self.router_capabilities
    }

    /// Release a transport the engine reported closed, with the media it
    /// carried.
    ///
    /// Returns the direction it served, or `None` if `session_id` does not
    /// own it (already released, or another session's).
    pub async fn release_closed_transport(
        &self,
        session_id: SessionId,
        transport_id: &TransportId,
    ) -> Option<Direction> {
        let direction = self.transports.remove_closed(session_id, transport_id)?;
        self.broker
            .release_transport_media(session_id, transport_id)
            .await;
        self.transports.close_released(transport_id).await;
        Some(direction)
    }

    /// Release everything `session_id` owns.
    ///
    /// Media first, then transports, then room membership, so that no
    /// registry entry outlives the session.
    pub async fn teardown_session(&self, session_id: SessionId) {
        self.broker.close_all_for(session_id).await;
        for direction in Direction::ALL {
            self.transports.close(session_id, direction).await;
        }
        self.rooms.leave(session_id);

        info!(
            target: "sc.registry",
            session_id = %session_id,
            "Session resources released"
        );
    }
}
