//! Session description for the transcoder's RTP input.

use crate::errors::ScError;
use serde::Deserialize;
use serde_json::{Map, Value};
use signaling_protocol::RtpParameters;
use std::fmt::Write;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Codec {
    mime_type: String,
    payload_type: u8,
    clock_rate: u32,
    #[serde(default)]
    channels: Option<u8>,
    #[serde(default)]
    parameters: Map<String, Value>,
}

#[derive(Deserialize)]
struct Parameters {
    #[serde(default)]
    codecs: Vec<Codec>,
}

/// Describe the stream a bridge consumer sends to `127.0.0.1:rtp_port`
/// (RTCP on `rtp_port + 1`).
///
/// Uses the first non-retransmission codec of the consumer's parameters.
///
/// # Errors
///
/// `ScError::Transcoder` if the parameters carry no usable codec.
pub fn describe(rtp_parameters: &RtpParameters, rtp_port: u16) -> Result<String, ScError> {
    let parameters: Parameters = serde_json::from_value(rtp_parameters.0.clone())
        .map_err(|e| ScError::Transcoder(format!("unreadable consumer parameters: {e}")))?;

    let codec = parameters
        .codecs
        .iter()
        .find(|c| !c.mime_type.to_ascii_lowercase().ends_with("/rtx"))
        .ok_or_else(|| ScError::Transcoder("consumer has no media codec".to_string()))?;

    let (media, encoding) = codec
        .mime_type
        .split_once('/')
        .ok_or_else(|| ScError::Transcoder(format!("bad mime type {}", codec.mime_type)))?;

    let pt = codec.payload_type;
    let mut sdp = String::new();
    // Writing to a String cannot fail
    let _ = write!(
        sdp,
        "v=0\r\n\
         o=- 0 0 IN IP4 127.0.0.1\r\n\
         s=sc-egress\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n\
         m={media} {rtp_port} RTP/AVP {pt}\r\n\
         a=rtcp:{}\r\n",
        rtp_port.saturating_add(1)
    );

    let _ = write!(sdp, "a=rtpmap:{pt} {encoding}/{}", codec.clock_rate);
    if let Some(channels) = codec.channels.filter(|c| *c > 1) {
        let _ = write!(sdp, "/{channels}");
    }
    sdp.push_str("\r\n");

    if !codec.parameters.is_empty() {
        let fmtp = codec
            .parameters
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}={s}"),
                other => format!("{key}={other}"),
            })
            .collect::<Vec<_>>()
            .join(";");
        let _ = write!(sdp, "a=fmtp:{pt} {fmtp}\r\n");
    }
    sdp.push_str("a=recvonly\r\n");

    Ok(sdp)
}
