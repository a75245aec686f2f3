use std::collections::BTreeMap;

use serde::Serialize;

use crate::SystemEvent;

/// Buffer of batched events, reduced to counts per type.
#[derive(Debug, Clone, Default)]
pub struct BatchDigest {
    counts: BTreeMap<String, u64>,
    oldest_ts: Option<u64>,
    newest_ts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestSummary {
    pub total: u64,
    pub counts: BTreeMap<String, u64>,
    pub oldest_ts: Option<u64>,
    pub newest_ts: Option<u64>,
}

impl BatchDigest {
    pub fn push(&mut self, event: &SystemEvent) {
        *self.counts.entry(event.event_type.clone()).or_default() += 1;
        if event.ts > 0 {
            self.oldest_ts = Some(self.oldest_ts.map_or(event.ts, |ts| ts.min(event.ts)));
            self.newest_ts = Some(self.newest_ts.map_or(event.ts, |ts| ts.max(event.ts)));
        }
    }

    pub fn len(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Empties the buffer; `None` when nothing was batched.
    pub fn take_summary(&mut self) -> Option<DigestSummary> {
        if self.is_empty() {
            return None;
        }
        let taken = std::mem::take(self);
        Some(DigestSummary {
            total: taken.len(),
            counts: taken.counts,
            oldest_ts: taken.oldest_ts,
            newest_ts: taken.newest_ts,
        })
    }
}

impl DigestSummary {
    /// Grouped summary text: counts per type, never event content.
    pub fn render(&self) -> String {
        let mut lines = vec![format!(
            "[event digest] {} batched event{} since the last digest:",
            self.total,
            if self.total == 1 { "" } else { "s" }
        )];
        lines.extend(
            self.counts
                .iter()
                .map(|(event_type, count)| format!("- {event_type}: {count}")),
        );
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::BatchDigest;
    use crate::parse_system_event;

    #[test]
    fn functional_summary_counts_per_type_and_resets_buffer() {
        let mut digest = BatchDigest::default();
        for (id, event_type) in [
            ("1", "email.received"),
            ("2", "deploy.succeeded"),
            ("3", "email.received"),
        ] {
            let raw = format!(
                r#"{{"id":"{id}","type":"{event_type}","payload":{{"message":"secret"}},"ts":1700000000000}}"#
            );
            digest.push(&parse_system_event(&raw).expect("event"));
        }
        let summary = digest.take_summary().expect("summary");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.counts["email.received"], 2);
        let text = summary.render();
        assert!(text.starts_with("[event digest] 3 batched events"));
        assert!(text.contains("- deploy.succeeded: 1"));
        assert!(!text.contains("secret"));
        assert!(digest.take_summary().is_none());
    }
}
