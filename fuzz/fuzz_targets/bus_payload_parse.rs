#![no_main]

use libfuzzer_sys::fuzz_target;
use vigil_triage::{classify, parse_system_event, Tier};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let Some(event) = parse_system_event(&raw) else {
        return;
    };
    assert!(!event.id.trim().is_empty());
    assert!(!event.event_type.trim().is_empty());

    let kind = event.kind();
    if kind.mode_control().is_some() {
        assert_eq!(classify(&kind), Tier::Immediate);
    }
    if let Some(message) = event.direct_message() {
        assert!(!message.is_empty());
    }
    let _ = event.message_text();
    let _ = event.origin();
});
