#![no_main]

use lansend::core::types::Announcement;
use libfuzzer_sys::fuzz_target;

// The UDP channel is hostile by definition: decoding must never panic and
// an accepted message must re-encode.
fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = Announcement::decode(data) {
        let _ = msg.encode();
        let _ = msg.is_solicitation();
    }
});
