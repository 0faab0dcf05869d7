#![no_main]

use libfuzzer_sys::fuzz_target;
use signaling_protocol::decode_request;

fuzz_target!(|data: &[u8]| {
    // WebSocket text messages are always UTF-8
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Must never panic, only return Err for invalid input
    if let Ok(frame) = decode_request(text) {
        assert!(!frame.request.event_name().is_empty());
    }
});
