#![no_main]

use libfuzzer_sys::fuzz_target;
use round_client::protocol::ServerMessage;

fuzz_target!(|data: &[u8]| {
    // Raw-byte path, including serde_json's own UTF-8 validation.
    if let Ok(msg) = serde_json::from_slice::<ServerMessage>(data) {
        // Anything that decodes must map to a phase update without panicking.
        let _ = msg.phase_snapshot();
    }

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = serde_json::from_str::<ServerMessage>(s);
    }
});
