#![no_main]

use libfuzzer_sys::fuzz_target;
use signaling_protocol::{decode_request, encode_frame, ResponsePayload, ServerFrame};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Whatever the decoder rejects with a callback id must be answerable
    if let Err(e) = decode_request(text) {
        if let Some(id) = e.callback_id() {
            let reply = ServerFrame::Response {
                id,
                data: ResponsePayload::error(e.to_string()),
            };
            assert!(encode_frame(&reply).is_ok());
        }
    }
});
