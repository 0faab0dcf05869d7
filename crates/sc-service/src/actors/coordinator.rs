//! `SessionCoordinator`: top-level owner of sessions and the media stack.
//!
//! - Spawns one `SessionActor` per connection and supervises it (panic
//!   detection via `JoinHandle`)
//! - Tears a session down on disconnect: the session leaves the directory
//!   first, then teardown is queued behind its in-flight operation
//! - Watches the engine event stream, routing out-of-band transport closes
//!   to the owning session and treating worker death as fatal
//! - Owns the root `CancellationToken`
//!
//! # Graceful Shutdown
//!
//! 1. Mark the service not ready
//! 2. Tear down every session
//! 3. Stop the egress bridge
//! 4. Cancel the root token

use super::metrics::{ActorMetrics, ActorType};
use super::session::{SessionActor, SessionHandle};
use crate::config::Config;
use crate::egress::{EgressBridgeHandle, Transcoder};
use crate::engine::{BoundedEngine, EngineEvent, MediaEngine};
use crate::errors::ScError;
use crate::observability::HealthState;
use crate::registry::Registries;
use common::types::SessionId;
use signaling_protocol::ServerFrame;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct SessionCoordinator {
    sc_id: String,
    registries: Arc<Registries>,
    egress: EgressBridgeHandle,
    health: Arc<HealthState>,
    metrics: Arc<ActorMetrics>,
    cancel_token: CancellationToken,
    fatal: watch::Receiver<Option<String>>,
    supervisor: JoinHandle<()>,
}

impl SessionCoordinator {
    /// Build the registries and the egress bridge on top of `engine`, start
    /// watching engine events and mark the service ready.
    ///
    /// # Errors
    ///
    /// Fails if the router's capabilities cannot be fetched.
    pub async fn start(
        engine: Arc<dyn MediaEngine>,
        transcoder: Arc<dyn Transcoder>,
        config: &Config,
        health: Arc<HealthState>,
    ) -> Result<Self, ScError> {
        let engine = BoundedEngine::new(engine, config.engine.call_timeout);
        // Subscribe before anything can be created
        let events = engine.subscribe_events();
        let router_capabilities = engine.rtp_capabilities().await?;

        let cancel_token = CancellationToken::new();
        let egress = EgressBridgeHandle::spawn(
            engine.clone(),
            transcoder,
            router_capabilities.clone(),
            config.egress.clone(),
            cancel_token.child_token(),
        );
        let registries = Arc::new(Registries::new(
            engine,
            router_capabilities,
            config.notification_scope,
            egress.clone(),
        ));

        let (fatal_tx, fatal) = watch::channel(None);
        let supervisor = tokio::spawn(supervise_engine(
            config.sc_id.clone(),
            events,
            Arc::clone(&registries),
            Arc::clone(&health),
            cancel_token.clone(),
            fatal_tx,
        ));

        health.set_ready();
        info!(
            target: "sc.actor.coordinator",
            sc_id = %config.sc_id,
            notification_scope = config.notification_scope.as_str(),
            "SessionCoordinator started"
        );

        Ok(Self {
            sc_id: config.sc_id.clone(),
            registries,
            egress,
            health,
            metrics: ActorMetrics::new(),
            cancel_token,
            fatal,
            supervisor,
        })
    }

    /// Register a new session whose frames go to `outbound`.
    ///
    /// # Errors
    ///
    /// `EngineUnavailable` once the engine died or shutdown began.
    pub fn connect(&self, outbound: mpsc::Sender<ServerFrame>) -> Result<SessionHandle, ScError> {
        if self.cancel_token.is_cancelled() || self.health.is_engine_dead() {
            return Err(ScError::EngineUnavailable);
        }

        let session_id = SessionId::new();
        let (handle, task_handle) = SessionActor::spawn(
            session_id,
            Arc::clone(&self.registries),
            outbound,
            self.cancel_token.child_token(),
            self.metrics.session_mailbox(session_id.to_string()),
        );
        self.registries.sessions().insert(handle.clone());
        self.metrics.session_started();
        self.monitor_session(session_id, task_handle);

        info!(
            target: "sc.actor.coordinator",
            sc_id = %self.sc_id,
            session_id = %session_id,
            total_sessions = self.registries.sessions().len(),
            "Session connected"
        );
        Ok(handle)
    }

    /// Tear down a session after its client went away. No-op for unknown ids.
    pub async fn disconnect(&self, session_id: SessionId) {
        let Some(handle) = self.registries.sessions().remove(session_id) else {
            return;
        };

        if handle.teardown().await.is_err() {
            // Actor already gone: release its records from here
            self.registries.teardown_session(session_id).await;
        }
        handle.cancel();

        info!(
            target: "sc.actor.coordinator",
            sc_id = %self.sc_id,
            session_id = %session_id,
            total_sessions = self.registries.sessions().len(),
            "Session disconnected"
        );
    }

    /// Clean up after a session actor that panicked.
    fn monitor_session(&self, session_id: SessionId, task_handle: JoinHandle<()>) {
        let registries = Arc::clone(&self.registries);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let result = task_handle.await;
            metrics.session_stopped();
            if let Err(e) = result {
                if e.is_panic() {
                    metrics.record_panic(ActorType::Session);
                    if let Some(handle) = registries.sessions().remove(session_id) {
                        handle.cancel();
                    }
                    registries.teardown_session(session_id).await;
                }
            }
        });
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        info!(
            target: "sc.actor.coordinator",
            sc_id = %self.sc_id,
            sessions = self.registries.sessions().len(),
            "Initiating graceful shutdown"
        );
        self.health.set_not_ready();

        for handle in self.registries.sessions().drain() {
            if handle.teardown().await.is_err() {
                self.registries.teardown_session(handle.id()).await;
            }
            handle.cancel();
        }

        if let Err(e) = self.egress.shutdown().await {
            debug!(target: "sc.actor.coordinator", error = %e, "Egress bridge already stopped");
        }
        self.cancel_token.cancel();
        self.supervisor.abort();

        info!(
            target: "sc.actor.coordinator",
            sc_id = %self.sc_id,
            "Shutdown complete"
        );
    }

    /// Resolves with the reason once the media worker has died.
    pub async fn worker_died(&self) -> String {
        let mut fatal = self.fatal.clone();
        loop {
            if let Some(reason) = fatal.borrow_and_update().clone() {
                return reason;
            }
            if fatal.changed().await.is_err() {
                // Supervisor gone without reporting: the process is shutting down
                std::future::pending::<()>().await;
            }
        }
    }

    #[must_use]
    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    #[must_use]
    pub fn egress(&self) -> &EgressBridgeHandle {
        &self.egress
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registries.sessions().len()
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }
}

/// Engine event loop.
#[instrument(skip_all, name = "sc.actor.coordinator", fields(sc_id = %sc_id))]
async fn supervise_engine(
    sc_id: String,
    mut events: broadcast::Receiver<EngineEvent>,
    registries: Arc<Registries>,
    health: Arc<HealthState>,
    cancel_token: CancellationToken,
    fatal: watch::Sender<Option<String>>,
) {
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(EngineEvent::TransportClosed { transport_id }) => {
                let Some((owner, _)) = registries.transports().owner_of(&transport_id) else {
                    debug!(
                        target: "sc.actor.coordinator",
                        transport_id = %transport_id,
                        "Closed transport has no owner"
                    );
                    continue;
                };
                if let Some(handle) = registries.sessions().get(owner) {
                    handle.transport_closed(transport_id);
                }
            }

            Ok(EngineEvent::WorkerDied { reason }) => {
                error!(
                    target: "sc.actor.coordinator",
                    sc_id = %sc_id,
                    reason = %reason,
                    "Media engine worker died, service cannot continue"
                );
                health.set_engine_dead();
                let sessions = registries.sessions().drain();
                for handle in &sessions {
                    handle.cancel();
                }
                warn!(
                    target: "sc.actor.coordinator",
                    sc_id = %sc_id,
                    sessions = sessions.len(),
                    "Cancelled all sessions"
                );
                let _ = fatal.send(Some(reason));
                cancel_token.cancel();
                break;
            }

            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    target: "sc.actor.coordinator",
                    skipped,
                    "Engine event stream lagged"
                );
            }

            Err(broadcast::error::RecvError::Closed) => {
                debug!(target: "sc.actor.coordinator", "Engine event stream closed");
                break;
            }
        }
    }
}
