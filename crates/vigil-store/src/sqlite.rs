//! SQLite-backed durable log, event bus, and mode flag sharing one database file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info};
use vigil_core::{current_unix_timestamp_ms, GatewayMode, InboundItem, LogRecord};

use crate::stream::{record_to_item, trim_cutoff_unix_ms};
use crate::{DurableLog, EventBus, LogError, ModeStore, StoreResult, StreamConfig, StreamId};

const MODE_KEY: &str = "gateway_mode";
const ENTRY_COLUMNS: &str = "ms, seq, source, prompt, metadata_json, timestamp_ms";

type RawEntryRow = (i64, i64, String, String, String, i64);

/// Persistent store used by the gateway process.
#[derive(Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
    config: StreamConfig,
    group_ready: AtomicBool,
    bus_notify: Notify,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and its schema.
    pub fn open(path: impl AsRef<Path>, config: StreamConfig) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            db_path,
            config,
            group_ready: AtomicBool::new(false),
            bus_notify: Notify::new(),
        };
        let connection = store.open_connection()?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    /// Creates the consumer group, failing with [`LogError::GroupExists`] when present.
    fn create_group(&self, connection: &Connection) -> StoreResult<()> {
        let exists = connection
            .query_row(
                "SELECT 1 FROM consumer_groups WHERE stream = ?1 AND group_name = ?2",
                params![self.config.stream, self.config.group],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(LogError::GroupExists(self.config.group.clone()));
        }
        connection.execute(
            "INSERT INTO consumer_groups (stream, group_name, created_ms) VALUES (?1, ?2, ?3)",
            params![
                self.config.stream,
                self.config.group,
                u64_to_i64(current_unix_timestamp_ms())
            ],
        )?;
        // Start at the tail: whatever is already in the stream predates the group.
        let skipped = connection.execute(
            "UPDATE stream_entries SET delivered = 1 WHERE stream = ?1 AND delivered = 0",
            params![self.config.stream],
        )?;
        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            skipped,
            "created consumer group"
        );
        Ok(())
    }

    fn ensure_group_on(&self, connection: &Connection) -> StoreResult<()> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.create_group(connection) {
            Ok(()) | Err(LogError::GroupExists(_)) => {}
            Err(error) => return Err(error),
        }
        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Appends an entry the way an outside producer would: never delivered to the group.
    pub fn append_undelivered(&self, item: &InboundItem) -> StoreResult<String> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = append_entry(
            &transaction,
            &self.config.stream,
            &item.to_log_record(current_unix_timestamp_ms()),
            false,
        )?;
        transaction.commit()?;
        Ok(id.to_string())
    }

    /// Delivery count of a pending entry, `None` when it is not pending.
    pub fn delivery_count(&self, log_id: &str) -> StoreResult<Option<u64>> {
        let connection = self.open_connection()?;
        let count = connection
            .query_row(
                r#"
                SELECT delivery_count FROM pending_entries
                WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3
                "#,
                params![self.config.stream, self.config.group, log_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        count.map(|value| i64_to_u64("delivery_count", value)).transpose()
    }

    pub fn entry_count(&self) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
            params![self.config.stream],
            |row| row.get(0),
        )?;
        i64_to_usize("entry_count", count)
    }
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS streams (
            name TEXT PRIMARY KEY,
            last_ms INTEGER NOT NULL,
            last_seq INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stream_entries (
            stream TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            ms INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            source TEXT NOT NULL,
            prompt TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            delivered INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (stream, entry_id)
        );

        CREATE INDEX IF NOT EXISTS idx_stream_entries_order
            ON stream_entries (stream, ms, seq);

        CREATE TABLE IF NOT EXISTS consumer_groups (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            created_ms INTEGER NOT NULL,
            PRIMARY KEY (stream, group_name)
        );

        CREATE TABLE IF NOT EXISTS pending_entries (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            consumer TEXT NOT NULL,
            delivery_count INTEGER NOT NULL,
            last_delivered_ms INTEGER NOT NULL,
            PRIMARY KEY (stream, group_name, entry_id)
        );

        CREATE TABLE IF NOT EXISTS bus_events (
            event_row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            pushed_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn append_entry(
    transaction: &Transaction<'_>,
    stream: &str,
    record: &LogRecord,
    delivered: bool,
) -> StoreResult<StreamId> {
    let last = transaction
        .query_row(
            "SELECT last_ms, last_seq FROM streams WHERE name = ?1",
            params![stream],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?
        .map(|(ms, seq)| -> StoreResult<StreamId> {
            Ok(StreamId {
                ms: i64_to_u64("last_ms", ms)?,
                seq: i64_to_u64("last_seq", seq)?,
            })
        })
        .transpose()?;
    let id = StreamId::next_after(last, current_unix_timestamp_ms());

    transaction.execute(
        r#"
        INSERT INTO streams (name, last_ms, last_seq) VALUES (?1, ?2, ?3)
        ON CONFLICT(name) DO UPDATE SET
            last_ms = excluded.last_ms,
            last_seq = excluded.last_seq
        "#,
        params![stream, u64_to_i64(id.ms), u64_to_i64(id.seq)],
    )?;
    transaction.execute(
        r#"
        INSERT INTO stream_entries (
            stream, entry_id, ms, seq, source, prompt, metadata_json, timestamp_ms, delivered
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            stream,
            id.to_string(),
            u64_to_i64(id.ms),
            u64_to_i64(id.seq),
            record.source,
            record.prompt,
            serde_json::to_string(&record.metadata)?,
            u64_to_i64(record.timestamp_unix_ms),
            i64::from(delivered),
        ],
    )?;
    Ok(id)
}

fn upsert_pending(
    transaction: &Transaction<'_>,
    config: &StreamConfig,
    entry_id: &str,
    now_unix_ms: u64,
) -> StoreResult<()> {
    transaction.execute(
        r#"
        INSERT INTO pending_entries (
            stream, group_name, entry_id, consumer, delivery_count, last_delivered_ms
        ) VALUES (?1, ?2, ?3, ?4, 1, ?5)
        ON CONFLICT(stream, group_name, entry_id) DO UPDATE SET
            consumer = excluded.consumer,
            delivery_count = pending_entries.delivery_count + 1,
            last_delivered_ms = excluded.last_delivered_ms
        "#,
        params![
            config.stream,
            config.group,
            entry_id,
            config.consumer,
            u64_to_i64(now_unix_ms)
        ],
    )?;
    Ok(())
}

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn entry_from_raw(raw: RawEntryRow) -> StoreResult<(StreamId, LogRecord)> {
    let (ms, seq, source, prompt, metadata_json, timestamp_ms) = raw;
    let metadata: Value = serde_json::from_str(&metadata_json)?;
    Ok((
        StreamId {
            ms: i64_to_u64("ms", ms)?,
            seq: i64_to_u64("seq", seq)?,
        },
        LogRecord {
            source,
            prompt,
            metadata,
            timestamp_unix_ms: i64_to_u64("timestamp_ms", timestamp_ms)?,
        },
    ))
}

fn query_entries(
    connection: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<(StreamId, LogRecord)>> {
    let mut statement = connection.prepare(sql)?;
    let rows = statement
        .query_map(params, read_entry_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(entry_from_raw).collect()
}

#[async_trait]
impl DurableLog for SqliteStore {
    async fn ensure_group(&self) -> StoreResult<()> {
        let connection = self.open_connection()?;
        self.ensure_group_on(&connection)
    }

    async fn persist(&self, item: &InboundItem) -> StoreResult<String> {
        let mut connection = self.open_connection()?;
        self.ensure_group_on(&connection)?;
        let now_unix_ms = current_unix_timestamp_ms();
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = append_entry(
            &transaction,
            &self.config.stream,
            &item.to_log_record(now_unix_ms),
            true,
        )?;
        let entry_id = id.to_string();
        upsert_pending(&transaction, &self.config, &entry_id, now_unix_ms)?;
        transaction.commit()?;
        debug!(entry_id = %entry_id, source = %item.source, "persisted inbound item");
        Ok(entry_id)
    }

    async fn ack(&self, log_id: &str) -> StoreResult<bool> {
        StreamId::from_str(log_id)?;
        let connection = self.open_connection()?;
        let removed = connection.execute(
            r#"
            DELETE FROM pending_entries
            WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3
            "#,
            params![self.config.stream, self.config.group, log_id],
        )?;
        Ok(removed > 0)
    }

    async fn get_unacked(&self) -> StoreResult<Vec<InboundItem>> {
        let mut connection = self.open_connection()?;
        self.ensure_group_on(&connection)?;
        let now_unix_ms = current_unix_timestamp_ms();
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut merged = BTreeMap::new();

        let pending_ids: Vec<String> = {
            let mut statement = transaction.prepare(
                "SELECT entry_id FROM pending_entries WHERE stream = ?1 AND group_name = ?2",
            )?;
            let rows = statement
                .query_map(params![self.config.stream, self.config.group], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for entry_id in pending_ids {
            let raw = transaction
                .query_row(
                    &format!(
                        "SELECT {ENTRY_COLUMNS} FROM stream_entries WHERE stream = ?1 AND entry_id = ?2"
                    ),
                    params![self.config.stream, entry_id],
                    read_entry_row,
                )
                .optional()?;
            let Some(raw) = raw else {
                // Claiming an entry that was deleted underneath the group drops it.
                transaction.execute(
                    r#"
                    DELETE FROM pending_entries
                    WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3
                    "#,
                    params![self.config.stream, self.config.group, entry_id],
                )?;
                continue;
            };
            let (id, record) = entry_from_raw(raw)?;
            upsert_pending(&transaction, &self.config, &entry_id, now_unix_ms)?;
            merged.insert(id, record_to_item(id, &record));
        }

        let undelivered = query_entries(
            &transaction,
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM stream_entries WHERE stream = ?1 AND delivered = 0 ORDER BY ms, seq"
            ),
            params![self.config.stream],
        )?;
        for (id, record) in undelivered {
            let entry_id = id.to_string();
            transaction.execute(
                "UPDATE stream_entries SET delivered = 1 WHERE stream = ?1 AND entry_id = ?2",
                params![self.config.stream, entry_id],
            )?;
            upsert_pending(&transaction, &self.config, &entry_id, now_unix_ms)?;
            merged.insert(id, record_to_item(id, &record));
        }

        transaction.commit()?;
        Ok(merged.into_values().collect())
    }

    async fn peek_unacked(&self) -> StoreResult<Vec<InboundItem>> {
        let connection = self.open_connection()?;
        let entries = query_entries(
            &connection,
            &format!(
                r#"
                SELECT {ENTRY_COLUMNS} FROM stream_entries e
                WHERE e.stream = ?1 AND (
                    (e.delivered = 0 AND EXISTS (
                        SELECT 1 FROM consumer_groups g
                        WHERE g.stream = e.stream AND g.group_name = ?2
                    ))
                    OR EXISTS (
                        SELECT 1 FROM pending_entries p
                        WHERE p.stream = e.stream AND p.group_name = ?2 AND p.entry_id = e.entry_id
                    )
                )
                ORDER BY ms, seq
                "#
            ),
            params![self.config.stream, self.config.group],
        )?;
        Ok(entries
            .iter()
            .map(|(id, record)| record_to_item(*id, record))
            .collect())
    }

    async fn trim_old(&self, max_age: Duration) -> StoreResult<usize> {
        let cutoff = trim_cutoff_unix_ms(max_age, current_unix_timestamp_ms());
        let connection = self.open_connection()?;
        let deleted = connection.execute(
            r#"
            DELETE FROM stream_entries
            WHERE stream = ?1
              AND timestamp_ms <= ?2
              AND delivered = 1
              AND NOT EXISTS (
                  SELECT 1 FROM pending_entries p
                  WHERE p.stream = stream_entries.stream AND p.entry_id = stream_entries.entry_id
              )
            "#,
            params![self.config.stream, u64_to_i64(cutoff)],
        )?;
        if deleted > 0 {
            info!(stream = %self.config.stream, deleted, "trimmed acknowledged log entries");
        }
        Ok(deleted)
    }

    async fn ping(&self) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for SqliteStore {
    async fn push(&self, raw: &str) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "INSERT INTO bus_events (payload, pushed_ms) VALUES (?1, ?2)",
            params![raw, u64_to_i64(current_unix_timestamp_ms())],
        )?;
        self.bus_notify.notify_one();
        Ok(())
    }

    async fn drain_pending(&self) -> StoreResult<Vec<String>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows: Vec<(i64, String)> = {
            let mut statement = transaction
                .prepare("SELECT event_row_id, payload FROM bus_events ORDER BY event_row_id")?;
            let rows = statement
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        if let Some((last_row_id, _)) = rows.last() {
            transaction.execute(
                "DELETE FROM bus_events WHERE event_row_id <= ?1",
                params![last_row_id],
            )?;
        }
        transaction.commit()?;
        Ok(rows.into_iter().map(|(_, payload)| payload).collect())
    }

    async fn pending_len(&self) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let count: i64 =
            connection.query_row("SELECT COUNT(*) FROM bus_events", [], |row| row.get(0))?;
        i64_to_usize("bus_events", count)
    }

    async fn wait_for_push(&self) {
        self.bus_notify.notified().await;
    }

    async fn ping(&self) -> StoreResult<()> {
        DurableLog::ping(self).await
    }
}

#[async_trait]
impl ModeStore for SqliteStore {
    async fn load_mode(&self) -> StoreResult<GatewayMode> {
        let connection = self.open_connection()?;
        let flag = connection
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![MODE_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(GatewayMode::from_flag(flag.as_deref()))
    }

    async fn store_mode(&self, mode: GatewayMode) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO kv (key, value, updated_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ms = excluded.updated_ms
            "#,
            params![
                MODE_KEY,
                mode.as_flag(),
                u64_to_i64(current_unix_timestamp_ms())
            ],
        )?;
        Ok(())
    }
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| LogError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn i64_to_usize(field: &'static str, value: i64) -> StoreResult<usize> {
    usize::try_from(value).map_err(|_| LogError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
