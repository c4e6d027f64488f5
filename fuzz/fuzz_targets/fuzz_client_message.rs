#![no_main]

use libfuzzer_sys::fuzz_target;
use round_client::protocol::ClientMessage;

fuzz_target!(|data: &[u8]| {
    // Whatever decodes must encode again.
    if let Ok(msg) = serde_json::from_slice::<ClientMessage>(data) {
        let _ = serde_json::to_string(&msg);
    }
});
