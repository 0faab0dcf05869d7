//! `EgressBridge`: taps one live video producer into the transcoder.
//!
//! The output directory is a single slot. The first video producer to
//! activate owns it; later ones wait as standbys (FIFO) and are promoted
//! when the active one is deactivated or abandoned.
//!
//! ```text
//!            activate
//!   (idle) ────────────► Starting ──Started──► Running
//!                          ▲   │                  │
//!              restart     │   │ error/end        │ error/end
//!              timer       │   ▼                  ▼
//!                          └── Failed ◄───────────┘
//!                                │ max attempts
//!                                ▼
//!                            Abandoned
//!
//!   deactivate (any state) ──► Stopped
//! ```
//!
//! Everything for every producer id runs on the bridge actor, so no two
//! transcoders ever write the output directory at once: a pipeline is fully
//! stopped before the next one starts.

mod sdp;
pub mod transcoder;

pub use transcoder::{
    FfmpegTranscoder, TranscodeJob, Transcoder, TranscoderEvent, TranscoderHandle,
    TranscoderProcess,
};

use crate::actors::metrics::{ActorType, MailboxMonitor};
use crate::config::EgressConfig;
use crate::engine::BoundedEngine;
use crate::errors::ScError;
use crate::observability::metrics;
use common::types::{ConsumerId, ProducerId, TransportId};
use signaling_protocol::RtpCapabilities;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Name of the live playlist inside the output directory.
pub const MANIFEST_FILE_NAME: &str = "stream.m3u8";

/// Segment file name pattern inside the output directory.
pub const SEGMENT_FILE_PATTERN: &str = "stream%03d.ts";

const EGRESS_CHANNEL_BUFFER: usize = 256;
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of an egress session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressState {
    Starting,
    Running,
    Failed,
    Stopped,
    Abandoned,
}

impl EgressState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EgressState::Starting => "starting",
            EgressState::Running => "running",
            EgressState::Failed => "failed",
            EgressState::Stopped => "stopped",
            EgressState::Abandoned => "abandoned",
        }
    }
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressTransition {
    pub producer_id: ProducerId,
    pub state: EgressState,
    /// Consecutive failures so far.
    pub failures: u32,
}

/// The session currently holding the output slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEgress {
    pub producer_id: ProducerId,
    pub state: EgressState,
    pub failures: u32,
    pub manifest_path: PathBuf,
}

/// Snapshot of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EgressStatus {
    pub active: Option<ActiveEgress>,
    /// Queued producers, next to be promoted first.
    pub standby: Vec<ProducerId>,
}

impl EgressStatus {
    /// Whether `producer_id` has an egress session (active or queued).
    #[must_use]
    pub fn tracks(&self, producer_id: &ProducerId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| &a.producer_id == producer_id)
            || self.standby.contains(producer_id)
    }
}

enum EgressMessage {
    Activate {
        producer_id: ProducerId,
    },
    Deactivate {
        producer_id: ProducerId,
    },
    Transcoder {
        generation: u64,
        event: TranscoderEvent,
    },
    Restart {
        generation: u64,
    },
    GetStatus {
        respond_to: oneshot::Sender<EgressStatus>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to the `EgressBridge` actor.
#[derive(Clone)]
pub struct EgressBridgeHandle {
    sender: mpsc::Sender<EgressMessage>,
    transitions: broadcast::Sender<EgressTransition>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl EgressBridgeHandle {
    /// Spawn the bridge actor.
    #[must_use]
    pub fn spawn(
        engine: BoundedEngine,
        transcoder: Arc<dyn Transcoder>,
        router_capabilities: RtpCapabilities,
        config: EgressConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(EGRESS_CHANNEL_BUFFER);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Egress, "egress"));

        let handle = Self {
            sender,
            transitions,
            cancel_token,
            mailbox,
        };

        let actor = EgressBridge {
            engine,
            transcoder,
            router_capabilities,
            config,
            receiver,
            handle: handle.clone(),
            active: None,
            standby: VecDeque::new(),
            next_generation: 0,
        };
        tokio::spawn(actor.run());

        handle
    }

    async fn send(&self, message: EgressMessage) -> Result<(), ScError> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|_| {
            self.mailbox.record_dequeue();
            ScError::Internal("egress bridge is not running".to_string())
        })
    }

    /// Start an egress session for a video producer (no-op if it has one).
    ///
    /// # Errors
    ///
    /// `Internal` if the bridge has stopped.
    pub async fn activate(&self, producer_id: ProducerId) -> Result<(), ScError> {
        self.send(EgressMessage::Activate { producer_id }).await
    }

    /// Tear down the egress session of a producer, if any.
    ///
    /// # Errors
    ///
    /// `Internal` if the bridge has stopped.
    pub async fn deactivate(&self, producer_id: ProducerId) -> Result<(), ScError> {
        self.send(EgressMessage::Deactivate { producer_id }).await
    }

    /// Current slot and standby queue, after everything queued before it.
    ///
    /// # Errors
    ///
    /// `Internal` if the bridge has stopped.
    pub async fn status(&self) -> Result<EgressStatus, ScError> {
        let (tx, rx) = oneshot::channel();
        self.send(EgressMessage::GetStatus { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop the active pipeline, drop the standbys and end the actor.
    ///
    /// # Errors
    ///
    /// `Internal` if the bridge has already stopped.
    pub async fn shutdown(&self) -> Result<(), ScError> {
        let (tx, rx) = oneshot::channel();
        self.send(EgressMessage::Shutdown { respond_to: tx }).await?;
        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Receive every state transition from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EgressTransition> {
        self.transitions.subscribe()
    }
}

/// Engine and transcoder resources of one start attempt.
struct Pipeline {
    transport_id: TransportId,
    consumer_id: ConsumerId,
    process: TranscoderProcess,
    pump: JoinHandle<()>,
}

struct Slot {
    producer_id: ProducerId,
    state: EgressState,
    failures: u32,
    generation: u64,
    pipeline: Option<Pipeline>,
}

/// What `record_failure` decided.
enum AfterFailure {
    RestartScheduled,
    Abandoned,
}

struct EgressBridge {
    engine: BoundedEngine,
    transcoder: Arc<dyn Transcoder>,
    router_capabilities: RtpCapabilities,
    config: EgressConfig,
    receiver: mpsc::Receiver<EgressMessage>,
    handle: EgressBridgeHandle,
    active: Option<Slot>,
    standby: VecDeque<ProducerId>,
    next_generation: u64,
}

impl EgressBridge {
    #[instrument(skip_all, name = "sc.actor.egress")]
    async fn run(mut self) {
        info!(
            target: "sc.egress",
            output_dir = %self.config.output_dir.display(),
            "EgressBridge started"
        );

        let cancel_token = self.handle.cancel_token.clone();
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    self.stop_all().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else { break };
                    let shutdown = self.handle_message(message).await;
                    self.handle.mailbox.record_dequeue();
                    if shutdown {
                        break;
                    }
                }
            }
        }

        info!(
            target: "sc.egress",
            messages_processed = self.handle.mailbox.messages_processed(),
            "EgressBridge stopped"
        );
    }

    /// Returns true once the bridge should stop.
    async fn handle_message(&mut self, message: EgressMessage) -> bool {
        match message {
            EgressMessage::Activate { producer_id } => self.activate(producer_id).await,
            EgressMessage::Deactivate { producer_id } => self.deactivate(&producer_id).await,
            EgressMessage::Transcoder { generation, event } => {
                self.on_transcoder_event(generation, event).await;
            }
            EgressMessage::Restart { generation } => self.on_restart(generation).await,
            EgressMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            EgressMessage::Shutdown { respond_to } => {
                self.stop_all().await;
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    fn status(&self) -> EgressStatus {
        EgressStatus {
            active: self.active.as_ref().map(|slot| ActiveEgress {
                producer_id: slot.producer_id.clone(),
                state: slot.state,
                failures: slot.failures,
                manifest_path: self.config.manifest_path(),
            }),
            standby: self.standby.iter().cloned().collect(),
        }
    }

    async fn activate(&mut self, producer_id: ProducerId) {
        if self.status().tracks(&producer_id) {
            debug!(
                target: "sc.egress",
                producer_id = %producer_id,
                "Egress already tracks producer"
            );
            return;
        }

        if self.active.is_some() {
            info!(
                target: "sc.egress",
                producer_id = %producer_id,
                queue_position = self.standby.len() + 1,
                "Output in use, producer queued as standby"
            );
            self.standby.push_back(producer_id);
            return;
        }

        self.active = Some(self.new_slot(producer_id));
        self.start_active().await;
    }

    async fn deactivate(&mut self, producer_id: &ProducerId) {
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|slot| &slot.producer_id == producer_id);

        if !is_active {
            let before = self.standby.len();
            self.standby.retain(|id| id != producer_id);
            if self.standby.len() != before {
                debug!(
                    target: "sc.egress",
                    producer_id = %producer_id,
                    "Standby producer removed"
                );
            }
            return;
        }

        if let Some(mut slot) = self.active.take() {
            self.release(&mut slot).await;
            slot.state = EgressState::Stopped;
            self.publish(&slot);
        }
        self.promote_next();
        self.start_active().await;
    }

    async fn on_transcoder_event(&mut self, generation: u64, event: TranscoderEvent) {
        let current = self
            .active
            .as_ref()
            .is_some_and(|slot| slot.generation == generation && slot.pipeline.is_some());
        if !current {
            debug!(
                target: "sc.egress",
                generation,
                event = ?event,
                "Ignoring stale transcoder event"
            );
            return;
        }

        let reason = match event {
            TranscoderEvent::Started => match self.mark_running().await {
                Ok(()) => return,
                Err(e) => format!("bridge consumer could not be resumed: {e}"),
            },
            TranscoderEvent::Error(reason) => reason,
            TranscoderEvent::Ended => "transcoder ended unexpectedly".to_string(),
        };

        if let AfterFailure::Abandoned = self.record_failure(&reason).await {
            self.start_active().await;
        }
    }

    async fn mark_running(&mut self) -> Result<(), ScError> {
        let Some(slot) = self.active.as_mut() else {
            return Ok(());
        };
        if slot.state != EgressState::Starting {
            return Ok(());
        }
        if let Some(pipeline) = &slot.pipeline {
            self.engine.resume_consumer(&pipeline.consumer_id).await?;
        }
        slot.state = EgressState::Running;
        slot.failures = 0;

        if let Some(slot) = &self.active {
            self.publish(slot);
        }
        Ok(())
    }

    async fn on_restart(&mut self, generation: u64) {
        let due = self.active.as_ref().is_some_and(|slot| {
            slot.generation == generation && slot.state == EgressState::Failed
        });
        if due {
            self.start_active().await;
        } else {
            debug!(target: "sc.egress", generation, "Ignoring stale restart timer");
        }
    }

    /// Start the active slot. If it is abandoned on the spot, move on to the
    /// next standby until one starts or the queue is empty.
    async fn start_active(&mut self) {
        loop {
            let generation = self.bump_generation();
            let Some(slot) = self.active.as_mut() else {
                return;
            };
            slot.generation = generation;
            slot.state = EgressState::Starting;
            let producer_id = slot.producer_id.clone();
            if let Some(slot) = &self.active {
                self.publish(slot);
            }

            match self.start_pipeline(&producer_id, generation).await {
                Ok(pipeline) => {
                    if let Some(slot) = self.active.as_mut() {
                        slot.pipeline = Some(pipeline);
                    }
                    return;
                }
                Err(e) => {
                    if let AfterFailure::RestartScheduled =
                        self.record_failure(&e.to_string()).await
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Plain transport, paused consumer, transcoder, event pump.
    async fn start_pipeline(
        &self,
        producer_id: &ProducerId,
        generation: u64,
    ) -> Result<Pipeline, ScError> {
        let transport = self.engine.create_plain_transport().await?;

        let consumer = match self
            .engine
            .consume(
                &transport.id,
                producer_id,
                self.router_capabilities.clone(),
                true,
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                self.engine.close_transport(&transport.id).await;
                return Err(e);
            }
        };

        let rtp_port = self.config.rtp_port;
        let started = async {
            self.engine
                .connect_plain_transport(
                    &transport.id,
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    rtp_port,
                    Some(rtp_port.saturating_add(1)),
                )
                .await?;
            let sdp = sdp::describe(&consumer.rtp_parameters, rtp_port)?;
            self.transcoder
                .spawn(TranscodeJob {
                    sdp,
                    output_dir: self.config.output_dir.clone(),
                    segment_seconds: self.config.segment_seconds,
                    list_size: self.config.list_size,
                })
                .await
        }
        .await;

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                self.engine.close_consumer(&consumer.id).await;
                self.engine.close_transport(&transport.id).await;
                return Err(e);
            }
        };

        info!(
            target: "sc.egress",
            producer_id = %producer_id,
            transport_id = %transport.id,
            local_port = transport.local_port,
            generation,
            "Egress pipeline launched"
        );

        Ok(Pipeline {
            transport_id: transport.id,
            consumer_id: consumer.id,
            process: handle.process,
            pump: self.spawn_event_pump(handle.events, generation),
        })
    }

    /// Forward transcoder events into the mailbox, tagged with `generation`.
    fn spawn_event_pump(
        &self,
        mut events: mpsc::Receiver<TranscoderEvent>,
        generation: u64,
    ) -> JoinHandle<()> {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if handle
                    .send(EgressMessage::Transcoder { generation, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    /// Release the active pipeline and decide between restart and abandon.
    async fn record_failure(&mut self, reason: &str) -> AfterFailure {
        let Some(mut slot) = self.active.take() else {
            return AfterFailure::Abandoned;
        };

        self.release(&mut slot).await;
        slot.failures += 1;
        slot.state = EgressState::Failed;
        warn!(
            target: "sc.egress",
            producer_id = %slot.producer_id,
            failures = slot.failures,
            max_attempts = self.config.max_attempts,
            reason,
            "Egress session failed"
        );
        self.publish(&slot);

        if slot.failures >= self.config.max_attempts {
            slot.state = EgressState::Abandoned;
            error!(
                target: "sc.egress",
                producer_id = %slot.producer_id,
                failures = slot.failures,
                "Egress session abandoned"
            );
            self.publish(&slot);
            self.promote_next();
            return AfterFailure::Abandoned;
        }

        let delay = self.config.backoff_for(slot.failures);
        slot.generation = self.bump_generation();
        self.schedule_restart(slot.generation, delay);
        debug!(
            target: "sc.egress",
            producer_id = %slot.producer_id,
            delay_ms = delay.as_millis(),
            "Egress restart scheduled"
        );
        self.active = Some(slot);
        AfterFailure::RestartScheduled
    }

    fn schedule_restart(&self, generation: u64, delay: std::time::Duration) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = handle.cancel_token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = handle.send(EgressMessage::Restart { generation }).await;
                }
            }
        });
    }

    /// Stop the transcoder (waiting for it), then close the consumer and transport.
    async fn release(&self, slot: &mut Slot) {
        let Some(pipeline) = slot.pipeline.take() else {
            return;
        };
        pipeline.pump.abort();
        pipeline.process.stop().await;
        self.engine.close_consumer(&pipeline.consumer_id).await;
        self.engine.close_transport(&pipeline.transport_id).await;
        debug!(
            target: "sc.egress",
            producer_id = %slot.producer_id,
            transport_id = %pipeline.transport_id,
            "Egress pipeline released"
        );
    }

    async fn stop_all(&mut self) {
        self.standby.clear();
        if let Some(mut slot) = self.active.take() {
            self.release(&mut slot).await;
            slot.state = EgressState::Stopped;
            self.publish(&slot);
        }
    }

    fn promote_next(&mut self) {
        if self.active.is_none() {
            if let Some(next) = self.standby.pop_front() {
                info!(
                    target: "sc.egress",
                    producer_id = %next,
                    "Promoting standby producer"
                );
                self.active = Some(self.new_slot(next));
            }
        }
    }

    fn new_slot(&mut self, producer_id: ProducerId) -> Slot {
        Slot {
            producer_id,
            state: EgressState::Starting,
            failures: 0,
            generation: self.bump_generation(),
            pipeline: None,
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn publish(&self, slot: &Slot) {
        metrics::record_egress_transition(slot.state.as_str());
        info!(
            target: "sc.egress",
            producer_id = %slot.producer_id,
            state = slot.state.as_str(),
            failures = slot.failures,
            "Egress state changed"
        );
        let _ = self.handle.transitions.send(EgressTransition {
            producer_id: slot.producer_id.clone(),
            state: slot.state,
            failures: slot.failures,
        });
    }
}
