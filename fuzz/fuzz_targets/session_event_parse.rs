#![no_main]

use libfuzzer_sys::fuzz_target;
use vigil_core::{parse_session_event_line, SessionEvent};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    for line in raw.lines() {
        let Some(event) = parse_session_event_line(line) else {
            continue;
        };
        assert!(!event.kind().is_empty());
        assert_eq!(
            event.is_terminal(),
            matches!(event, SessionEvent::TurnEnd | SessionEvent::Error { .. })
        );
        let encoded = serde_json::to_string(&event).expect("session events serialize");
        assert_eq!(parse_session_event_line(&encoded), Some(event));
    }
});
