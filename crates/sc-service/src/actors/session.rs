//! `SessionActor`: one per connected client.
//!
//! Every operation that touches a session's transports, producers or
//! consumers runs on that session's actor, one message at a time:
//!
//! - client requests (typed calls from the handle, or raw signaling frames
//!   whose response goes straight to the client's outbound channel)
//! - cross-session effects: a source producer closed under one of our
//!   consumers, the engine closed one of our transports
//! - teardown, queued behind whatever is in flight
//!
//! Notifications bypass the mailbox and go straight to the outbound
//! channel; a full channel drops them with a warning.

use super::metrics::MailboxMonitor;
use crate::errors::ScError;
use crate::observability::metrics;
use crate::registry::Registries;
use common::types::{ConsumerId, Direction, MediaKind, ProducerId, RoomId, SessionId, TransportId};
use signaling_protocol::{
    ClientFrame, ClientRequest, ConsumerParams, DtlsParameters, Notification, ResponsePayload,
    RtpCapabilities, RtpParameters, ServerFrame, TransportParams,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Mailbox size of a session actor.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Capacity of the per-client outbound frame channel.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

enum SessionMessage {
    /// Typed request, answered on `respond_to`.
    Request {
        request: ClientRequest,
        respond_to: oneshot::Sender<Result<ResponsePayload, ScError>>,
    },
    /// Signaling frame, answered on the outbound channel.
    Signal {
        frame: ClientFrame,
        received_at: Instant,
    },
    SourceProducerClosed {
        consumer_id: ConsumerId,
    },
    TransportClosed {
        transport_id: TransportId,
    },
    Teardown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    sender: mpsc::Sender<SessionMessage>,
    outbound: mpsc::Sender<ServerFrame>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session_id
    }

    async fn send(&self, message: SessionMessage) -> Result<(), ScError> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|_| {
            self.mailbox.record_dequeue();
            ScError::SessionClosed
        })
    }

    /// Queue a message without waiting; falls back to a background send
    /// when the mailbox is full so the effect is never lost.
    fn post(&self, message: SessionMessage) {
        self.mailbox.record_enqueue();
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                let sender = self.sender.clone();
                let mailbox = Arc::clone(&self.mailbox);
                tokio::spawn(async move {
                    if sender.send(message).await.is_err() {
                        mailbox.record_dequeue();
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.mailbox.record_dequeue(),
        }
    }

    /// Run `request` on the actor and return its response payload.
    ///
    /// # Errors
    ///
    /// The operation's error, or `SessionClosed` if the actor is gone.
    pub async fn request(&self, request: ClientRequest) -> Result<ResponsePayload, ScError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Request {
            request,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ScError::SessionClosed)?
    }

    /// Join (or move to) a room.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the actor is gone.
    pub async fn join_room(&self, room_id: impl Into<RoomId>) -> Result<(), ScError> {
        self.request(ClientRequest::JoinRoom {
            room_id: room_id.into(),
        })
        .await
        .map(|_| ())
    }

    /// The router's capability descriptor.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the actor is gone.
    pub async fn rtp_capabilities(&self) -> Result<RtpCapabilities, ScError> {
        match self.request(ClientRequest::GetRouterRtpCapabilities).await? {
            ResponsePayload::RtpCapabilities(caps) => Ok(caps),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`TransportRegistry::create`](crate::registry::TransportRegistry::create).
    pub async fn create_transport(&self, direction: Direction) -> Result<TransportParams, ScError> {
        match self
            .request(ClientRequest::CreateWebRtcTransport { direction })
            .await?
        {
            ResponsePayload::Transport { params } => Ok(params),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`TransportRegistry::connect`](crate::registry::TransportRegistry::connect).
    pub async fn connect_transport(
        &self,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ScError> {
        self.request(ClientRequest::ConnectTransport {
            direction,
            dtls_parameters,
        })
        .await
        .map(|_| ())
    }

    /// # Errors
    ///
    /// See [`ProducerConsumerBroker::produce`](crate::registry::ProducerConsumerBroker::produce).
    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, ScError> {
        match self
            .request(ClientRequest::Produce {
                kind,
                rtp_parameters,
            })
            .await?
        {
            ResponsePayload::Produced { id } => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`ProducerConsumerBroker::consume`](crate::registry::ProducerConsumerBroker::consume).
    pub async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams, ScError> {
        match self
            .request(ClientRequest::Consume {
                producer_id,
                rtp_capabilities,
            })
            .await?
        {
            ResponsePayload::Consumer { params } => Ok(params),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`ProducerConsumerBroker::resume`](crate::registry::ProducerConsumerBroker::resume).
    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), ScError> {
        self.request(ClientRequest::ResumeConsumer { consumer_id })
            .await
            .map(|_| ())
    }

    /// Queue a decoded signaling frame. Its response (if any) is written to
    /// the outbound channel.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the actor is gone.
    pub async fn dispatch(&self, frame: ClientFrame) -> Result<(), ScError> {
        self.send(SessionMessage::Signal {
            frame,
            received_at: Instant::now(),
        })
        .await
    }

    /// Answer callback `id` directly, without going through the actor.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the client's writer is gone.
    pub async fn reply(&self, id: u64, data: ResponsePayload) -> Result<(), ScError> {
        self.outbound
            .send(ServerFrame::Response { id, data })
            .await
            .map_err(|_| ScError::SessionClosed)
    }

    /// Push a notification to the client. Returns false if it was dropped.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.outbound.try_send(ServerFrame::Notification(notification)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// The producer behind `consumer_id` closed.
    pub fn source_producer_closed(&self, consumer_id: ConsumerId) {
        self.post(SessionMessage::SourceProducerClosed { consumer_id });
    }

    /// The engine closed `transport_id` on its own.
    pub fn transport_closed(&self, transport_id: TransportId) {
        self.post(SessionMessage::TransportClosed { transport_id });
    }

    /// Release everything the session owns and stop the actor.
    ///
    /// Runs after any operation already queued.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the actor was already gone.
    pub async fn teardown(&self) -> Result<(), ScError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Teardown { respond_to: tx })
            .await?;
        rx.await.map_err(|_| ScError::SessionClosed)
    }

    /// Cancel the session (closes the client's socket).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token cancelled when the session ends.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Messages waiting in the mailbox.
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }
}

fn unexpected(payload: &ResponsePayload) -> ScError {
    ScError::Internal(format!("unexpected response payload: {payload:?}"))
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: SessionId,
    receiver: mpsc::Receiver<SessionMessage>,
    outbound: mpsc::Sender<ServerFrame>,
    cancel_token: CancellationToken,
    registries: Arc<Registries>,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionActor {
    /// Spawn a session actor writing to `outbound`.
    ///
    /// The caller registers the returned handle and supervises the task.
    #[must_use]
    pub fn spawn(
        session_id: SessionId,
        registries: Arc<Registries>,
        outbound: mpsc::Sender<ServerFrame>,
        cancel_token: CancellationToken,
        mailbox: MailboxMonitor,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let mailbox = Arc::new(mailbox);

        let actor = Self {
            session_id,
            receiver,
            outbound: outbound.clone(),
            cancel_token: cancel_token.clone(),
            registries,
            mailbox: Arc::clone(&mailbox),
        };
        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            session_id,
            sender,
            outbound,
            cancel_token,
            mailbox,
        };
        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sc.actor.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        debug!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            "SessionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sc.actor.session",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    self.registries.teardown_session(self.session_id).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        self.registries.teardown_session(self.session_id).await;
                        break;
                    };
                    let done = self.handle_message(message).await;
                    self.mailbox.record_dequeue();
                    if done {
                        break;
                    }
                }
            }
        }

        self.mailbox.release_remaining();
        debug!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_depth = self.mailbox.peak_depth(),
            "SessionActor stopped"
        );
    }

    /// Returns true after teardown.
    async fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Request {
                request,
                respond_to,
            } => {
                let result = self.execute(request).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Signal { frame, received_at } => {
                self.handle_signal(frame, received_at).await;
            }

            SessionMessage::SourceProducerClosed { consumer_id } => {
                self.registries
                    .broker()
                    .close_orphaned_consumer(self.session_id, consumer_id)
                    .await;
            }

            SessionMessage::TransportClosed { transport_id } => {
                self.on_transport_closed(&transport_id).await;
            }

            SessionMessage::Teardown { respond_to } => {
                self.registries.teardown_session(self.session_id).await;
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    async fn execute(&self, request: ClientRequest) -> Result<ResponsePayload, ScError> {
        let session_id = self.session_id;
        match request {
            ClientRequest::JoinRoom { room_id } => {
                let previous = self.registries.rooms().join(session_id, room_id.clone());
                info!(
                    target: "sc.actor.session",
                    session_id = %session_id,
                    room_id = %room_id,
                    previous_room = ?previous.as_ref().map(RoomId::as_str),
                    "Joined room"
                );
                Ok(ResponsePayload::success())
            }

            ClientRequest::GetRouterRtpCapabilities => Ok(ResponsePayload::RtpCapabilities(
                self.registries.router_capabilities().clone(),
            )),

            ClientRequest::CreateWebRtcTransport { direction } => {
                let info = self
                    .registries
                    .transports()
                    .create(session_id, direction)
                    .await?;
                Ok(ResponsePayload::Transport {
                    params: info.into(),
                })
            }

            ClientRequest::ConnectTransport {
                direction,
                dtls_parameters,
            } => {
                self.registries
                    .transports()
                    .connect(session_id, direction, dtls_parameters)
                    .await?;
                Ok(ResponsePayload::success())
            }

            ClientRequest::Produce {
                kind,
                rtp_parameters,
            } => {
                let id = self
                    .registries
                    .broker()
                    .produce(session_id, kind, rtp_parameters)
                    .await?;
                Ok(ResponsePayload::Produced { id })
            }

            ClientRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let consumer = self
                    .registries
                    .broker()
                    .consume(session_id, producer_id, rtp_capabilities)
                    .await?;
                Ok(ResponsePayload::Consumer {
                    params: ConsumerParams {
                        id: consumer.id,
                        producer_id: consumer.producer_id,
                        kind: consumer.kind,
                        rtp_parameters: consumer.rtp_parameters,
                    },
                })
            }

            ClientRequest::ResumeConsumer { consumer_id } => {
                self.registries
                    .broker()
                    .resume(session_id, &consumer_id)
                    .await?;
                Ok(ResponsePayload::success())
            }
        }
    }

    async fn handle_signal(&self, frame: ClientFrame, received_at: Instant) {
        let event = frame.request.event_name();
        let expects_response = frame.request.expects_response();

        let result = self.execute(frame.request).await;
        let status = match &result {
            Ok(_) => "success",
            Err(e) => e.status_label(),
        };
        metrics::record_signaling_request(event, status, received_at.elapsed());

        let data = match result {
            Ok(payload) => payload,
            Err(e) => {
                debug!(
                    target: "sc.actor.session",
                    session_id = %self.session_id,
                    event,
                    error = %e,
                    code = e.error_code(),
                    "Request failed"
                );
                ResponsePayload::error(e.client_message())
            }
        };

        if !expects_response {
            return;
        }
        let Some(id) = frame.id else {
            return;
        };
        if self
            .outbound
            .send(ServerFrame::Response { id, data })
            .await
            .is_err()
        {
            debug!(
                target: "sc.actor.session",
                session_id = %self.session_id,
                event,
                "Client writer gone, response dropped"
            );
        }
    }

    async fn on_transport_closed(&self, transport_id: &TransportId) {
        let Some(direction) = self
            .registries
            .release_closed_transport(self.session_id, transport_id)
            .await
        else {
            return;
        };

        warn!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            transport_id = %transport_id,
            direction = direction.as_str(),
            "Transport closed by media engine"
        );
    }
}
