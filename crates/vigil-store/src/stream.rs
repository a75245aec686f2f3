use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use vigil_core::{current_unix_timestamp_ms, InboundItem, LogRecord};

use crate::{LogError, StoreResult};

const DEFAULT_STREAM_NAME: &str = "vigil:inbound";
const DEFAULT_GROUP_NAME: &str = "vigil-gateway";
const DEFAULT_CONSUMER_NAME: &str = "vigil-1";

/// Log entry id: milliseconds plus a per-millisecond sequence, ordered by time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    /// Next id after `last`, never going backwards even if the clock does.
    pub fn next_after(last: Option<StreamId>, now_unix_ms: u64) -> StreamId {
        match last {
            Some(last) if now_unix_ms <= last.ms => StreamId {
                ms: last.ms,
                seq: last.seq.saturating_add(1),
            },
            _ => StreamId {
                ms: now_unix_ms,
                seq: 0,
            },
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = LogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || LogError::InvalidStreamId(value.to_string());
        let (ms, seq) = value.trim().split_once('-').ok_or_else(invalid)?;
        Ok(StreamId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Names of the stream, its single consumer group, and our consumer.
pub struct StreamConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream: DEFAULT_STREAM_NAME.to_string(),
            group: DEFAULT_GROUP_NAME.to_string(),
            consumer: DEFAULT_CONSUMER_NAME.to_string(),
        }
    }
}

/// Append-only inbound log with one logical consumer group.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Creates the consumer group if missing; an existing group is not an error.
    async fn ensure_group(&self) -> StoreResult<()>;
    /// Appends the item and records it as delivered to our consumer; returns the ack token.
    async fn persist(&self, item: &InboundItem) -> StoreResult<String>;
    /// Acknowledges an entry; returns false when it was not pending.
    async fn ack(&self, log_id: &str) -> StoreResult<bool>;
    /// Reclaims every pending entry and reads every never-delivered entry, oldest first.
    async fn get_unacked(&self) -> StoreResult<Vec<InboundItem>>;
    /// Same set as [`DurableLog::get_unacked`] without claiming or delivering anything.
    async fn peek_unacked(&self) -> StoreResult<Vec<InboundItem>>;
    /// Deletes entries older than `max_age` that are neither pending nor undelivered.
    async fn trim_old(&self, max_age: Duration) -> StoreResult<usize>;
    async fn ping(&self) -> StoreResult<()>;
}

pub(crate) fn record_to_item(id: StreamId, record: &LogRecord) -> InboundItem {
    InboundItem {
        source: record.source.clone(),
        prompt: record.prompt.clone(),
        metadata: record.metadata.clone(),
        stream_id: Some(id.to_string()),
    }
}

pub(crate) fn trim_cutoff_unix_ms(max_age: Duration, now_unix_ms: u64) -> u64 {
    let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
    now_unix_ms.saturating_sub(max_age_ms)
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    record: LogRecord,
    delivered: bool,
}

#[derive(Debug, Clone)]
struct MemoryPending {
    consumer: String,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    group_created: bool,
    last_id: Option<StreamId>,
    entries: BTreeMap<StreamId, MemoryEntry>,
    pending: BTreeMap<StreamId, MemoryPending>,
}

impl MemoryLogInner {
    fn ensure_group(&mut self) {
        if self.group_created {
            return;
        }
        // A group created on a non-empty stream starts at the tail.
        for entry in self.entries.values_mut() {
            entry.delivered = true;
        }
        self.group_created = true;
    }

    fn append(&mut self, record: LogRecord, delivered_to: Option<&str>) -> StreamId {
        let id = StreamId::next_after(self.last_id, current_unix_timestamp_ms());
        self.last_id = Some(id);
        self.entries.insert(
            id,
            MemoryEntry {
                record,
                delivered: delivered_to.is_some(),
            },
        );
        if let Some(consumer) = delivered_to {
            self.pending.insert(
                id,
                MemoryPending {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                },
            );
        }
        id
    }
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryDurableLog {
    config: StreamConfig,
    inner: RwLock<MemoryLogInner>,
}

impl InMemoryDurableLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StreamConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(MemoryLogInner::default()),
        }
    }

    /// Appends an entry the way an outside producer would: never delivered to the group.
    pub async fn append_undelivered(&self, item: &InboundItem) -> String {
        let mut inner = self.inner.write().await;
        inner
            .append(item.to_log_record(current_unix_timestamp_ms()), None)
            .to_string()
    }

    /// Delivery count of a pending entry, `None` when it is not pending.
    pub async fn delivery_count(&self, log_id: &str) -> StoreResult<Option<u64>> {
        let id = StreamId::from_str(log_id)?;
        let inner = self.inner.read().await;
        Ok(inner.pending.get(&id).map(|pending| pending.delivery_count))
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DurableLog for InMemoryDurableLog {
    async fn ensure_group(&self) -> StoreResult<()> {
        self.inner.write().await.ensure_group();
        Ok(())
    }

    async fn persist(&self, item: &InboundItem) -> StoreResult<String> {
        let mut inner = self.inner.write().await;
        inner.ensure_group();
        let id = inner.append(
            item.to_log_record(current_unix_timestamp_ms()),
            Some(&self.config.consumer),
        );
        Ok(id.to_string())
    }

    async fn ack(&self, log_id: &str) -> StoreResult<bool> {
        let id = StreamId::from_str(log_id)?;
        let mut inner = self.inner.write().await;
        Ok(inner.pending.remove(&id).is_some())
    }

    async fn get_unacked(&self) -> StoreResult<Vec<InboundItem>> {
        let mut inner = self.inner.write().await;
        inner.ensure_group();
        let MemoryLogInner {
            entries, pending, ..
        } = &mut *inner;

        let mut merged = BTreeMap::new();
        pending.retain(|id, claim| {
            let Some(entry) = entries.get(id) else {
                return false;
            };
            claim.consumer = self.config.consumer.clone();
            claim.delivery_count = claim.delivery_count.saturating_add(1);
            merged.insert(*id, record_to_item(*id, &entry.record));
            true
        });
        for (id, entry) in entries.iter_mut().filter(|(_, entry)| !entry.delivered) {
            entry.delivered = true;
            pending.insert(
                *id,
                MemoryPending {
                    consumer: self.config.consumer.clone(),
                    delivery_count: 1,
                },
            );
            merged.insert(*id, record_to_item(*id, &entry.record));
        }
        Ok(merged.into_values().collect())
    }

    async fn peek_unacked(&self) -> StoreResult<Vec<InboundItem>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .filter(|(id, entry)| {
                (inner.group_created && !entry.delivered) || inner.pending.contains_key(id)
            })
            .map(|(id, entry)| record_to_item(*id, &entry.record))
            .collect())
    }

    async fn trim_old(&self, max_age: Duration) -> StoreResult<usize> {
        let cutoff = trim_cutoff_unix_ms(max_age, current_unix_timestamp_ms());
        let mut inner = self.inner.write().await;
        let MemoryLogInner {
            entries, pending, ..
        } = &mut *inner;
        let before = entries.len();
        entries.retain(|id, entry| {
            entry.record.timestamp_unix_ms > cutoff || !entry.delivered || pending.contains_key(id)
        });
        Ok(before - entries.len())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DurableLog, InMemoryDurableLog, StreamId};
    use std::str::FromStr;
    use std::time::Duration;
    use vigil_core::InboundItem;

    #[test]
    fn unit_stream_id_orders_by_ms_then_seq() {
        let first = StreamId::next_after(None, 1_000);
        let second = StreamId::next_after(Some(first), 1_000);
        let third = StreamId::next_after(Some(second), 999);
        let fourth = StreamId::next_after(Some(third), 1_001);
        assert_eq!(first.to_string(), "1000-0");
        assert_eq!(second.to_string(), "1000-1");
        assert_eq!(third.to_string(), "1000-2");
        assert_eq!(fourth.to_string(), "1001-0");
        assert!(first < second && second < third && third < fourth);
        assert_eq!(StreamId::from_str("1000-2").expect("parse"), third);
        assert!(StreamId::from_str("1000").is_err());
        assert!(StreamId::from_str("a-b").is_err());
    }

    #[tokio::test]
    async fn functional_unacked_merges_claimed_and_undelivered_without_duplicates() {
        let log = InMemoryDurableLog::new();
        let a = log
            .persist(&InboundItem::new("telegram:1", "A"))
            .await
            .expect("persist a");
        let b = log
            .append_undelivered(&InboundItem::new("telegram:1", "B"))
            .await;

        let first = log.get_unacked().await.expect("first read");
        let ids: Vec<_> = first.iter().filter_map(|item| item.stream_id.clone()).collect();
        assert_eq!(ids, vec![a.clone(), b.clone()]);

        let second = log.get_unacked().await.expect("second read");
        assert_eq!(second.len(), 2);
        assert_eq!(log.delivery_count(&a).await.expect("count"), Some(3));
        assert_eq!(log.delivery_count(&b).await.expect("count"), Some(2));
    }

    #[tokio::test]
    async fn functional_trim_keeps_pending_entries() {
        let log = InMemoryDurableLog::new();
        let a = log.persist(&InboundItem::new("s", "A")).await.expect("a");
        let b = log.persist(&InboundItem::new("s", "B")).await.expect("b");
        assert!(log.ack(&b).await.expect("ack b"));
        assert!(!log.ack(&b).await.expect("second ack"));

        let deleted = log.trim_old(Duration::ZERO).await.expect("trim");
        assert_eq!(deleted, 1);
        let remaining = log.peek_unacked().await.expect("peek");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stream_id.as_deref(), Some(a.as_str()));
    }

    #[tokio::test]
    async fn regression_group_created_late_starts_at_tail() {
        let log = InMemoryDurableLog::new();
        log.append_undelivered(&InboundItem::new("s", "before group"))
            .await;
        log.ensure_group().await.expect("group");
        log.ensure_group().await.expect("group is idempotent");
        assert!(log.get_unacked().await.expect("read").is_empty());
    }
}
