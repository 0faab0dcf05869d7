//! Media engine seam.
//!
//! The coordinator drives a selective-forwarding media engine through the
//! id-based [`MediaEngine`] trait. Negotiation parameters are opaque JSON
//! relayed verbatim between clients and the engine. Every call made on
//! behalf of a client goes through [`BoundedEngine`], which applies the
//! configured call timeout and closes resources created by calls that
//! completed too late.
//!
//! The production implementation over `mediasoup` lives in
//! [`mediasoup`] behind the `mediasoup` cargo feature.

mod bounded;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;

pub use bounded::BoundedEngine;

use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use signaling_protocol::{
    DtlsParameters, IceCandidates, IceParameters, RtpCapabilities, RtpParameters,
    TransportParams,
};
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the engine event broadcast channel.
pub const ENGINE_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Failure reported by a media engine implementation.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine refused the request (bad or incompatible parameters).
    #[error("{0}")]
    Rejected(String),

    /// The referenced engine object does not exist (already closed).
    #[error("Unknown {kind}: {id}")]
    UnknownResource { kind: &'static str, id: String },

    /// The engine cannot serve requests at all.
    #[error("Media engine unavailable: {0}")]
    Unavailable(String),
}

/// Asynchronous notifications from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A transport closed without being asked to (DTLS failure, ICE timeout).
    TransportClosed { transport_id: TransportId },
    /// The engine worker process terminated. Unrecoverable.
    WorkerDied { reason: String },
}

/// A freshly created WebRTC transport.
#[derive(Debug, Clone, PartialEq)]
pub struct WebRtcTransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

impl From<WebRtcTransportInfo> for TransportParams {
    fn from(info: WebRtcTransportInfo) -> Self {
        TransportParams {
            id: info.id,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
        }
    }
}

/// A freshly created consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// A plain RTP transport used to tap media out of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainTransportInfo {
    pub id: TransportId,
    /// Local RTP port the engine sends from.
    pub local_port: u16,
    /// Local RTCP port, when RTCP is not multiplexed.
    pub local_rtcp_port: Option<u16>,
}

/// Selective forwarding media engine, addressed by engine-issued ids.
///
/// Implementations must be cheap to call concurrently; the coordinator
/// serializes calls per session, not globally.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Capability descriptor of the router (read-only after startup).
    async fn rtp_capabilities(&self) -> Result<RtpCapabilities, EngineError>;

    /// Create a WebRTC transport on the router.
    async fn create_webrtc_transport(&self) -> Result<WebRtcTransportInfo, EngineError>;

    /// Complete the DTLS handshake parameters of a WebRTC transport.
    async fn connect_webrtc_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    /// Start receiving a track on a transport.
    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    /// Whether a peer with `rtp_capabilities` can receive `producer_id`.
    async fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    /// Start forwarding a producer over a transport.
    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError>;

    /// Resume a paused consumer.
    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    /// Create a plain RTP transport (no RTCP mux, no comedia).
    async fn create_plain_transport(&self) -> Result<PlainTransportInfo, EngineError>;

    /// Point a plain transport at a remote RTP (and RTCP) endpoint.
    async fn connect_plain_transport(
        &self,
        transport_id: &TransportId,
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    ) -> Result<(), EngineError>;

    /// Close a transport and everything created on it.
    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    /// Subscribe to out-of-band engine events.
    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent>;
}
