//! Codec for encoding and decoding signaling frames.

use crate::message::{ClientFrame, ClientRequest, ServerFrame};
use crate::params::{DtlsParameters, RtpCapabilities, RtpParameters};
use common::types::{ConsumerId, Direction, MediaKind, ProducerId, RoomId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Not a JSON object with an `event` string
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Event name not part of the protocol
    #[error("Unknown event: {event}")]
    UnknownEvent { id: Option<u64>, event: String },

    /// Known event with a payload that does not match its schema
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload {
        id: Option<u64>,
        event: &'static str,
        reason: String,
    },

    /// Frame could not be serialized
    #[error("Encoding failed: {0}")]
    Encode(String),
}

impl CodecError {
    /// Callback id recovered from the offending frame, if any, so the
    /// failure can still be answered.
    #[must_use]
    pub const fn callback_id(&self) -> Option<u64> {
        match self {
            CodecError::UnknownEvent { id, .. } | CodecError::InvalidPayload { id, .. } => *id,
            CodecError::Malformed(_) | CodecError::Encode(_) => None,
        }
    }
}

/// Outer shape shared by all client frames.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<u64>,
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomData {
    room_id: RoomId,
}

#[derive(Deserialize)]
struct CreateTransportData {
    direction: Direction,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportData {
    direction: Direction,
    dtls_parameters: DtlsParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    producer_id: ProducerId,
    rtp_capabilities: RtpCapabilities,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeConsumerData {
    consumer_id: ConsumerId,
}

fn payload<T: DeserializeOwned>(
    id: Option<u64>,
    event: &'static str,
    data: Value,
) -> Result<T, CodecError> {
    serde_json::from_value(data).map_err(|e| CodecError::InvalidPayload {
        id,
        event,
        reason: e.to_string(),
    })
}

/// Decode a client frame from a WebSocket text message
///
/// # Errors
///
/// Returns an error if the text is not a frame, names an unknown event,
/// or carries a payload that does not match the event.
pub fn decode_request(text: &str) -> Result<ClientFrame, CodecError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let Envelope { id, event, data } = envelope;

    let request = match event.as_str() {
        "join-room" => {
            let JoinRoomData { room_id } = payload(id, "join-room", data)?;
            ClientRequest::JoinRoom { room_id }
        }
        "get-router-rtp-capabilities" => ClientRequest::GetRouterRtpCapabilities,
        "create-webrtc-transport" => {
            let CreateTransportData { direction } =
                payload(id, "create-webrtc-transport", data)?;
            ClientRequest::CreateWebRtcTransport { direction }
        }
        "connect-transport" => {
            let ConnectTransportData {
                direction,
                dtls_parameters,
            } = payload(id, "connect-transport", data)?;
            ClientRequest::ConnectTransport {
                direction,
                dtls_parameters,
            }
        }
        "produce" => {
            let ProduceData {
                kind,
                rtp_parameters,
            } = payload(id, "produce", data)?;
            ClientRequest::Produce {
                kind,
                rtp_parameters,
            }
        }
        "consume" => {
            let ConsumeData {
                producer_id,
                rtp_capabilities,
            } = payload(id, "consume", data)?;
            ClientRequest::Consume {
                producer_id,
                rtp_capabilities,
            }
        }
        "resume-consumer" => {
            let ResumeConsumerData { consumer_id } = payload(id, "resume-consumer", data)?;
            ClientRequest::ResumeConsumer { consumer_id }
        }
        _ => return Err(CodecError::UnknownEvent { id, event }),
    };

    tracing::trace!(
        target: "sc.signaling.codec",
        event = request.event_name(),
        id = ?id,
        "Decoded client frame"
    );

    Ok(ClientFrame { id, request })
}

/// Encode a server frame to a WebSocket text message
///
/// # Errors
///
/// Returns an error if encoding fails
pub fn encode_frame(frame: &ServerFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Encode(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::{Notification, ResponsePayload};
    use serde_json::json;

    #[test]
    fn test_decode_produce() {
        let frame = decode_request(
            r#"{"id": 4, "event": "produce", "data": {"kind": "video", "rtpParameters": {"mid": "0"}}}"#,
        )
        .unwrap();

        assert_eq!(frame.id, Some(4));
        assert_eq!(
            frame.request,
            ClientRequest::Produce {
                kind: MediaKind::Video,
                rtp_parameters: RtpParameters(json!({"mid": "0"})),
            }
        );
    }

    #[test]
    fn test_decode_event_without_data() {
        let frame = decode_request(r#"{"id": 1, "event": "get-router-rtp-capabilities"}"#).unwrap();
        assert_eq!(frame.request, ClientRequest::GetRouterRtpCapabilities);
    }

    #[test]
    fn test_decode_join_room_without_id() {
        let frame =
            decode_request(r#"{"event": "join-room", "data": {"roomId": "main"}}"#).unwrap();
        assert_eq!(frame.id, None);
        assert_eq!(
            frame.request,
            ClientRequest::JoinRoom {
                room_id: RoomId::from("main")
            }
        );
    }

    #[test]
    fn test_decode_connect_transport() {
        let frame = decode_request(
            r#"{"id": 2, "event": "connect-transport", "data": {"direction": "recv", "dtlsParameters": {"role": "client"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            frame.request,
            ClientRequest::ConnectTransport {
                direction: Direction::Recv,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_event_keeps_callback_id() {
        let err = decode_request(r#"{"id": 9, "event": "teleport"}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownEvent { ref event, .. } if event == "teleport"));
        assert_eq!(err.callback_id(), Some(9));
    }

    #[test]
    fn test_invalid_direction_is_invalid_payload() {
        let err = decode_request(
            r#"{"id": 5, "event": "create-webrtc-transport", "data": {"direction": "sideways"}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidPayload {
                event: "create-webrtc-transport",
                ..
            }
        ));
        assert_eq!(err.callback_id(), Some(5));
    }

    #[test]
    fn test_malformed_frame() {
        let err = decode_request("not json").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
        assert_eq!(err.callback_id(), None);
    }

    #[test]
    fn test_encode_response_and_notification() {
        let response = encode_frame(&ServerFrame::Response {
            id: 1,
            data: ResponsePayload::success(),
        })
        .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&response).unwrap(),
            json!({"type": "response", "id": 1, "data": {"success": true}})
        );

        let notification = encode_frame(&ServerFrame::Notification(
            Notification::ConsumerClosed {
                consumer_id: ConsumerId::from("c-1"),
            },
        ))
        .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&notification).unwrap(),
            json!({"type": "notification", "event": "consumer-closed", "data": {"consumerId": "c-1"}})
        );
    }
}
