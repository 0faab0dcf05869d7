//! Negotiation parameter fixtures.
//!
//! Shapes follow what a browser client and the media engine exchange, but
//! only the fields the coordinator and the mocks look at are meaningful.

use common::types::MediaKind;
use serde_json::json;
use signaling_protocol::{
    DtlsParameters, IceCandidates, IceParameters, RtpCapabilities, RtpParameters,
};

/// Router capabilities: Opus audio and VP8 video.
#[must_use]
pub fn router_capabilities() -> RtpCapabilities {
    RtpCapabilities(json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000
            }
        ],
        "headerExtensions": []
    }))
}

/// Capabilities of a client that can receive everything the router sends.
#[must_use]
pub fn client_capabilities() -> RtpCapabilities {
    router_capabilities()
}

/// Capabilities of a client that only decodes audio.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities(json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2
            }
        ],
        "headerExtensions": []
    }))
}

/// Sending parameters for one track of `kind`.
#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => RtpParameters(json!({
            "mid": "0",
            "codecs": [
                {
                    "mimeType": "audio/opus",
                    "payloadType": 100,
                    "clockRate": 48000,
                    "channels": 2,
                    "parameters": { "useinbandfec": 1 }
                }
            ],
            "encodings": [{ "ssrc": 11_111_111 }]
        })),
        MediaKind::Video => RtpParameters(json!({
            "mid": "1",
            "codecs": [
                {
                    "mimeType": "video/VP8",
                    "payloadType": 101,
                    "clockRate": 90000,
                    "parameters": {}
                },
                {
                    "mimeType": "video/rtx",
                    "payloadType": 102,
                    "clockRate": 90000,
                    "parameters": { "apt": 101 }
                }
            ],
            "encodings": [{ "ssrc": 22_222_222, "rtx": { "ssrc": 22_222_223 } }]
        })),
    }
}

/// Parameters the mock engine refuses to produce with.
#[must_use]
pub fn invalid_rtp_parameters() -> RtpParameters {
    RtpParameters(json!({ "mid": "0", "codecs": [] }))
}

#[must_use]
pub fn dtls_parameters() -> DtlsParameters {
    DtlsParameters(json!({
        "role": "client",
        "fingerprints": [
            {
                "algorithm": "sha-256",
                "value": "AF:3B:7C:02:9E:11:54:D8:6A:C2:90:33:1F:E4:08:7D:52:BB:C9:01:6E:4A:F7:38:20:DD:95:0C:13:A6:5E:71"
            }
        ]
    }))
}

#[must_use]
pub fn ice_parameters(n: u64) -> IceParameters {
    IceParameters(json!({
        "usernameFragment": format!("ufrag{n}"),
        "password": format!("pwd{n}"),
        "iceLite": true
    }))
}

#[must_use]
pub fn ice_candidates(port: u16) -> IceCandidates {
    IceCandidates(json!([
        {
            "foundation": "udpcandidate",
            "priority": 1_076_302_079,
            "ip": "127.0.0.1",
            "protocol": "udp",
            "port": port,
            "type": "host"
        }
    ]))
}

/// Server-side DTLS parameters of a transport.
#[must_use]
pub fn server_dtls_parameters() -> DtlsParameters {
    DtlsParameters(json!({
        "role": "auto",
        "fingerprints": [
            {
                "algorithm": "sha-256",
                "value": "12:9F:30:AB:44:C1:E7:08:5D:26:B3:9A:7E:F0:61:CC:85:4B:D2:10:3F:A8:E9:57:06:7B:C4:92:1D:E5:38:60"
            }
        ]
    }))
}

/// Mime type of the first codec of `rtp_parameters`, lowercased.
#[must_use]
pub fn primary_mime_type(rtp_parameters: &RtpParameters) -> Option<String> {
    rtp_parameters
        .0
        .get("codecs")?
        .as_array()?
        .first()?
        .get("mimeType")?
        .as_str()
        .map(str::to_ascii_lowercase)
}

/// Whether `capabilities` list a codec with `mime_type` (case-insensitive).
#[must_use]
pub fn supports_mime_type(capabilities: &RtpCapabilities, mime_type: &str) -> bool {
    capabilities
        .0
        .get("codecs")
        .and_then(|codecs| codecs.as_array())
        .is_some_and(|codecs| {
            codecs.iter().any(|codec| {
                codec
                    .get("mimeType")
                    .and_then(|m| m.as_str())
                    .is_some_and(|m| m.eq_ignore_ascii_case(mime_type))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_only_capabilities_reject_vp8() {
        let video = rtp_parameters(MediaKind::Video);
        let mime = primary_mime_type(&video).unwrap();
        assert_eq!(mime, "video/vp8");
        assert!(supports_mime_type(&client_capabilities(), &mime));
        assert!(!supports_mime_type(&audio_only_capabilities(), &mime));
    }

    #[test]
    fn test_invalid_parameters_have_no_codec() {
        assert!(primary_mime_type(&invalid_rtp_parameters()).is_none());
    }
}
