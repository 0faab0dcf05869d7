//! Signaling protocol for Stagehand.
//!
//! This crate implements the JSON frames exchanged over the signaling
//! channel: client requests carrying a callback id, server responses
//! answering that id, and server-initiated notifications.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod message;
pub mod params;

pub use codec::{decode_request, encode_frame, CodecError};
pub use message::{
    ClientFrame, ClientRequest, ConsumerParams, Notification, ResponsePayload, ServerFrame,
    TransportParams,
};
pub use params::{
    DtlsParameters, IceCandidates, IceParameters, RtpCapabilities, RtpParameters,
};
