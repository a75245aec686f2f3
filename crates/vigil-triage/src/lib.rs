//! Three-tier triage for the secondary system-event stream.
//!
//! Every bus wake drains the pending list, drops malformed and recently-seen
//! events, classifies the rest as immediate, batched, or suppressed, applies
//! the sleep/wake mode rules, and forwards one merged prompt. Batched events
//! accumulate into a periodic digest of counts per type.

mod classify;
mod digest;
mod event;
mod seen;
mod triage;

pub use classify::{classify, Tier};
pub use digest::{BatchDigest, DigestSummary};
pub use event::{parse_system_event, EventKind, SystemEvent};
pub use seen::RecentlySeen;
pub use triage::{EventTriage, TriageConfig, TriageReport, TriageSink};
