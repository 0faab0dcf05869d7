//! Per-session WebRTC transports, one per direction.

use super::SessionDirectory;
use crate::engine::{BoundedEngine, WebRtcTransportInfo};
use crate::errors::ScError;
use crate::observability::metrics;
use common::types::{Direction, SessionId, TransportId};
use parking_lot::Mutex;
use signaling_protocol::DtlsParameters;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection state of a live transport handle. Closed handles are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connected,
}

#[derive(Debug, Clone)]
struct TransportRecord {
    id: TransportId,
    state: TransportState,
}

#[derive(Debug, Default)]
struct Transports {
    handles: HashMap<(SessionId, Direction), TransportRecord>,
    owners: HashMap<TransportId, (SessionId, Direction)>,
}

impl Transports {
    fn insert(&mut self, key: (SessionId, Direction), id: TransportId) {
        self.owners.insert(id.clone(), key);
        self.handles.insert(
            key,
            TransportRecord {
                id,
                state: TransportState::Created,
            },
        );
        metrics::set_transports_active(self.handles.len());
    }

    fn remove(&mut self, key: (SessionId, Direction)) -> Option<TransportRecord> {
        let record = self.handles.remove(&key)?;
        self.owners.remove(&record.id);
        metrics::set_transports_active(self.handles.len());
        Some(record)
    }
}

/// Owns every session's transport handles, keyed by (session, direction).
///
/// Callers serialize operations per session; the map lock is never held
/// across an engine call.
pub struct TransportRegistry {
    engine: BoundedEngine,
    sessions: Arc<SessionDirectory>,
    inner: Mutex<Transports>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new(engine: BoundedEngine, sessions: Arc<SessionDirectory>) -> Self {
        Self {
            engine,
            sessions,
            inner: Mutex::new(Transports::default()),
        }
    }

    /// Create the `direction` transport of `session_id`.
    ///
    /// # Errors
    ///
    /// - `Conflict` if a handle already exists for the pair
    /// - `SessionClosed` if the session went away during the engine call
    /// - engine failures
    pub async fn create(
        &self,
        session_id: SessionId,
        direction: Direction,
    ) -> Result<WebRtcTransportInfo, ScError> {
        if self.inner.lock().handles.contains_key(&(session_id, direction)) {
            return Err(ScError::Conflict(format!(
                "A {direction} transport already exists"
            )));
        }

        let info = self.engine.create_webrtc_transport().await?;

        if !self.sessions.is_live(session_id) {
            self.engine.close_transport(&info.id).await;
            return Err(ScError::SessionClosed);
        }

        self.inner
            .lock()
            .insert((session_id, direction), info.id.clone());

        info!(
            target: "sc.registry.transports",
            session_id = %session_id,
            direction = direction.as_str(),
            transport_id = %info.id,
            "Transport created"
        );
        Ok(info)
    }

    /// Connect the `direction` transport of `session_id`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no handle exists
    /// - `Conflict` if it is already connected (the engine is not contacted)
    /// - engine failures (the handle stays `Created`)
    pub async fn connect(
        &self,
        session_id: SessionId,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ScError> {
        let transport_id = {
            let transports = self.inner.lock();
            match transports.handles.get(&(session_id, direction)) {
                None => {
                    return Err(ScError::NotFound(format!(
                        "No {direction} transport exists"
                    )))
                }
                Some(record) if record.state == TransportState::Connected => {
                    return Err(ScError::Conflict(
                        "Transport already connected".to_string(),
                    ))
                }
                Some(record) => record.id.clone(),
            }
        };

        self.engine
            .connect_webrtc_transport(&transport_id, dtls_parameters)
            .await?;

        let mut transports = self.inner.lock();
        match transports.handles.get_mut(&(session_id, direction)) {
            Some(record) if record.id == transport_id => {
                record.state = TransportState::Connected;
                debug!(
                    target: "sc.registry.transports",
                    session_id = %session_id,
                    direction = direction.as_str(),
                    transport_id = %transport_id,
                    "Transport connected"
                );
                Ok(())
            }
            // Closed out-of-band while connecting
            _ => Err(ScError::NotFound(format!(
                "No {direction} transport exists"
            ))),
        }
    }

    /// Remove and close the handle, if present.
    pub async fn close(&self, session_id: SessionId, direction: Direction) {
        let removed = self.inner.lock().remove((session_id, direction));
        if let Some(record) = removed {
            self.engine.close_transport(&record.id).await;
            debug!(
                target: "sc.registry.transports",
                session_id = %session_id,
                direction = direction.as_str(),
                transport_id = %record.id,
                "Transport closed"
            );
        }
    }

    /// Drop the handle of a transport the engine reported closed.
    ///
    /// Returns the direction it served, or `None` if `transport_id` is not
    /// (or no longer) owned by `session_id`. The engine side is released
    /// separately with [`close_released`](Self::close_released).
    pub fn remove_closed(
        &self,
        session_id: SessionId,
        transport_id: &TransportId,
    ) -> Option<Direction> {
        let mut transports = self.inner.lock();
        let (owner, direction) = *transports.owners.get(transport_id)?;
        if owner != session_id {
            return None;
        }
        transports.remove((owner, direction)).map(|_| direction)
    }

    /// Close the engine transport behind a handle dropped by
    /// [`remove_closed`](Self::remove_closed). A failed DTLS handshake
    /// leaves it open in the engine.
    pub async fn close_released(&self, transport_id: &TransportId) {
        self.engine.close_transport(transport_id).await;
        debug!(
            target: "sc.registry.transports",
            transport_id = %transport_id,
            "Released transport closed in engine"
        );
    }

    /// Owner of an engine transport id.
    #[must_use]
    pub fn owner_of(&self, transport_id: &TransportId) -> Option<(SessionId, Direction)> {
        self.inner.lock().owners.get(transport_id).copied()
    }

    /// Id of the `direction` transport if it is connected.
    #[must_use]
    pub fn connected(&self, session_id: SessionId, direction: Direction) -> Option<TransportId> {
        self.inner
            .lock()
            .handles
            .get(&(session_id, direction))
            .filter(|record| record.state == TransportState::Connected)
            .map(|record| record.id.clone())
    }

    #[must_use]
    pub fn state(&self, session_id: SessionId, direction: Direction) -> Option<TransportState> {
        self.inner
            .lock()
            .handles
            .get(&(session_id, direction))
            .map(|record| record.state)
    }

    #[must_use]
    pub fn transport_id(&self, session_id: SessionId, direction: Direction) -> Option<TransportId> {
        self.inner
            .lock()
            .handles
            .get(&(session_id, direction))
            .map(|record| record.id.clone())
    }

    /// Number of live handles across all sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().handles.is_empty()
    }
}
