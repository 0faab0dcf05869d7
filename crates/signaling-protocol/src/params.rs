//! Negotiation parameters relayed between clients and the media engine.
//!
//! The coordinator never interprets these objects; it hands them to the
//! engine and back to the client verbatim. Each is a transparent wrapper
//! around a JSON value so the wire shape is exactly what the engine issued.

use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! opaque_params {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);

        impl $name {
            /// Borrow the underlying JSON value.
            #[must_use]
            pub fn as_value(&self) -> &Value {
                &self.0
            }

            /// Unwrap into the underlying JSON value.
            #[must_use]
            pub fn into_value(self) -> Value {
                self.0
            }
        }

        impl From<Value> for $name {
            fn from(value: Value) -> Self {
                Self(value)
            }
        }
    };
}

opaque_params!(
    /// DTLS role and fingerprints of one endpoint.
    DtlsParameters
);
opaque_params!(
    /// ICE username fragment and password of a server transport.
    IceParameters
);
opaque_params!(
    /// ICE candidates of a server transport (a JSON array).
    IceCandidates
);
opaque_params!(
    /// RTP send/receive parameters of one track.
    RtpParameters
);
opaque_params!(
    /// Codec and header-extension capabilities of a router or a client.
    RtpCapabilities
);
