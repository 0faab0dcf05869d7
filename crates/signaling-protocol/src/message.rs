//! Signaling frame types.
//!
//! Client frame (one JSON object per WebSocket text message):
//! - `id`: callback correlation id (absent for fire-and-forget events)
//! - `event`: event name, e.g. `create-webrtc-transport`
//! - `data`: event payload (absent for events without one)
//!
//! Server frames are tagged by `type`: `response` answers a client `id`,
//! `notification` is pushed without a request.

use crate::params::{
    DtlsParameters, IceCandidates, IceParameters, RtpCapabilities, RtpParameters,
};
use common::types::{ConsumerId, Direction, MediaKind, ProducerId, RoomId, TransportId};
use serde::{Deserialize, Serialize};

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    /// Callback id to answer, if the client expects a response.
    pub id: Option<u64>,
    /// The request itself.
    pub request: ClientRequest,
}

/// Requests a client may issue on the signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// `join-room {roomId}` (fire-and-forget).
    JoinRoom { room_id: RoomId },
    /// `get-router-rtp-capabilities`.
    GetRouterRtpCapabilities,
    /// `create-webrtc-transport {direction}`.
    CreateWebRtcTransport { direction: Direction },
    /// `connect-transport {direction, dtlsParameters}`.
    ConnectTransport {
        direction: Direction,
        dtls_parameters: DtlsParameters,
    },
    /// `produce {kind, rtpParameters}`.
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// `consume {producerId, rtpCapabilities}`.
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    /// `resume-consumer {consumerId}`.
    ResumeConsumer { consumer_id: ConsumerId },
}

impl ClientRequest {
    /// Wire name of the event (also the bounded `event` metric label).
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom { .. } => "join-room",
            ClientRequest::GetRouterRtpCapabilities => "get-router-rtp-capabilities",
            ClientRequest::CreateWebRtcTransport { .. } => "create-webrtc-transport",
            ClientRequest::ConnectTransport { .. } => "connect-transport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::ResumeConsumer { .. } => "resume-consumer",
        }
    }

    /// Whether the event is answered through the callback.
    #[must_use]
    pub const fn expects_response(&self) -> bool {
        !matches!(self, ClientRequest::JoinRoom { .. })
    }
}

/// Connection parameters of a freshly created WebRTC transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

/// Parameters a client needs to build the local end of a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Payload of a `response` frame.
///
/// Serialized untagged so the `data` object has exactly the documented
/// shape, e.g. `{"params": {...}}` or `{"error": "Cannot consume"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// The router's capability descriptor, sent as-is.
    RtpCapabilities(RtpCapabilities),
    /// `{params: {id, iceParameters, iceCandidates, dtlsParameters}}`.
    Transport { params: TransportParams },
    /// `{id}` of a new producer.
    Produced { id: ProducerId },
    /// `{params: {id, producerId, kind, rtpParameters}}`.
    Consumer { params: ConsumerParams },
    /// `{success: true}`.
    Success { success: bool },
    /// `{error}`.
    Error { error: String },
}

impl ResponsePayload {
    /// `{success: true}`.
    #[must_use]
    pub const fn success() -> Self {
        ResponsePayload::Success { success: true }
    }

    /// `{error: message}`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ResponsePayload::Error {
            error: message.into(),
        }
    }

    /// Whether this payload reports a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, ResponsePayload::Error { .. })
    }
}

/// Server-initiated notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Notification {
    /// Another session started producing.
    #[serde(rename_all = "camelCase")]
    NewProducer { producer_id: ProducerId },
    /// A producer announced earlier is gone.
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
    /// One of the recipient's consumers was closed by the server.
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: ConsumerId },
}

/// A frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Answer to the client request carrying `id`.
    Response { id: u64, data: ResponsePayload },
    /// Push notification.
    Notification(Notification),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_response_shape() {
        let frame = ServerFrame::Response {
            id: 3,
            data: ResponsePayload::error("Cannot consume"),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "response", "id": 3, "data": {"error": "Cannot consume"}})
        );
    }

    #[test]
    fn test_transport_response_shape() {
        let payload = ResponsePayload::Transport {
            params: TransportParams {
                id: TransportId::from("t-1"),
                ice_parameters: IceParameters(json!({"usernameFragment": "u"})),
                ice_candidates: IceCandidates(json!([])),
                dtls_parameters: DtlsParameters(json!({"role": "auto"})),
            },
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"params": {
                "id": "t-1",
                "iceParameters": {"usernameFragment": "u"},
                "iceCandidates": [],
                "dtlsParameters": {"role": "auto"}
            }})
        );
    }

    #[test]
    fn test_capabilities_sent_as_is() {
        let caps = json!({"codecs": [{"mimeType": "audio/opus"}]});
        let payload = ResponsePayload::RtpCapabilities(RtpCapabilities(caps.clone()));
        assert_eq!(serde_json::to_value(&payload).unwrap(), caps);
    }

    #[test]
    fn test_notification_shape() {
        let frame = ServerFrame::Notification(Notification::NewProducer {
            producer_id: ProducerId::from("p-9"),
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "notification", "event": "new-producer", "data": {"producerId": "p-9"}})
        );
    }

    #[test]
    fn test_join_room_is_fire_and_forget() {
        let request = ClientRequest::JoinRoom {
            room_id: RoomId::from("main"),
        };
        assert!(!request.expects_response());
        assert!(ClientRequest::GetRouterRtpCapabilities.expects_response());
    }
}
