//! Durable, bounded, prioritized offline queue backed by `rusqlite` (bundled SQLite) in WAL
//! mode. Absorbs metrics, events, and command results while the control channel is down and
//! drains them when it recovers.
//!
//! The queue holds its one connection behind a `Mutex` because the embedded engine
//! serializes writes best that way; all methods are synchronous and blocking — callers on
//! the async side should run them via `tokio::task::spawn_blocking`.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying SQLite connection returned an error.
    #[error("queue sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The queue is at capacity and the new item could not be admitted even after evicting.
    #[error("queue at capacity for {table}")]
    Full {
        /// The table that rejected the insert.
        table: &'static str,
    },
    /// Compressing or decompressing a payload failed.
    #[error("payload (de)compression failed: {0}")]
    Compression(#[source] std::io::Error),
}

/// Relative urgency of a queued item; also the drain order within a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Background telemetry, evicted first under pressure.
    Low = 0,
    /// Default priority for most events and results.
    Normal = 1,
    /// Operator-visible or safety-relevant items, evicted last.
    High = 2,
}

impl Priority {
    fn from_i64(v: i64) -> Self {
        match v {
            2 => Priority::High,
            0 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

/// Which table a queued item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// `metrics_queue`.
    Metric,
    /// `event_queue`.
    Event,
    /// `command_queue`.
    CommandResult,
}

impl QueueKind {
    fn table(self) -> &'static str {
        match self {
            QueueKind::Metric => "metrics_queue",
            QueueKind::Event => "event_queue",
            QueueKind::CommandResult => "command_queue",
        }
    }

    fn has_synced_column(self) -> bool {
        !matches!(self, QueueKind::Metric)
    }
}

/// A single queued item read back from the store, with its payload already decompressed if
/// it was gzip-compressed on write.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    /// Monotonic SQLite rowid.
    pub id: i64,
    /// Insert time, Unix seconds.
    pub timestamp: i64,
    /// Priority used for drain ordering and eviction.
    pub priority: Priority,
    /// Decompressed payload bytes.
    pub payload: Vec<u8>,
    /// Number of times this item has been handed to a drain attempt.
    pub attempts: i32,
}

/// Snapshot of queue occupancy used for operator visibility.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Live row count per table.
    pub metrics_count: i64,
    /// Live row count per table.
    pub events_count: i64,
    /// Live row count per table.
    pub results_count: i64,
    /// Oldest timestamp still live in `metrics_queue`, if any.
    pub oldest_metric_timestamp: Option<i64>,
    /// Sum of payload lengths across all three tables.
    pub total_bytes: i64,
    /// Last successful drain timestamp, if any.
    pub last_sync: Option<i64>,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Caps applied to each table. Oldest items are evicted first when an insert would exceed
/// the cap, inside the same transaction as the insert.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    /// Maximum live rows in `metrics_queue`.
    pub max_metrics: i64,
    /// Maximum live rows in `event_queue`.
    pub max_events: i64,
    /// Maximum live rows in `command_queue`.
    pub max_results: i64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_metrics: 10_000,
            max_events: 5_000,
            max_results: 5_000,
        }
    }
}

/// The offline queue. Cheap to clone — internally an `Arc`-free handle is not provided;
/// wrap in `Arc<Queue>` at the call site if shared across tasks.
pub struct Queue {
    conn: Mutex<Connection>,
    limits: QueueLimits,
}

impl Queue {
    /// Opens (creating if absent) the SQLite file at `path`, applies WAL pragmas, and runs
    /// the schema migration.
    pub fn open(path: &Path, limits: QueueLimits) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Mutex::new(conn),
            limits,
        })
    }

    /// Opens an in-memory queue, primarily for tests.
    pub fn open_in_memory(limits: QueueLimits) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            limits,
        })
    }

    fn max_for(&self, kind: QueueKind) -> i64 {
        match kind {
            QueueKind::Metric => self.limits.max_metrics,
            QueueKind::Event => self.limits.max_events,
            QueueKind::CommandResult => self.limits.max_results,
        }
    }

    fn insert(
        &self,
        kind: QueueKind,
        priority: Priority,
        payload: &[u8],
        compress: bool,
    ) -> Result<i64, QueueError> {
        let stored = if compress {
            compress_payload(payload).map_err(QueueError::Compression)?
        } else {
            payload.to_vec()
        };

        let mut conn = self.conn.lock().expect("queue connection mutex poisoned");
        let tx = conn.transaction()?;
        let table = kind.table();
        let max = self.max_for(kind);

        let count: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {table}"),
            [],
            |row| row.get(0),
        )?;

        if count >= max {
            let evict_sql = if kind.has_synced_column() {
                format!(
                    "DELETE FROM {table} WHERE id IN (
                        SELECT id FROM {table} WHERE synced = 1 ORDER BY timestamp ASC LIMIT 1
                    )"
                )
            } else {
                format!(
                    "DELETE FROM {table} WHERE id IN (
                        SELECT id FROM {table} ORDER BY timestamp ASC LIMIT 1
                    )"
                )
            };
            let evicted = tx.execute(&evict_sql, [])?;
            if evicted == 0 {
                return Err(QueueError::Full { table });
            }
        }

        let now = now_unix();
        let id = if kind.has_synced_column() {
            tx.execute(
                &format!(
                    "INSERT INTO {table} (timestamp, priority, payload, attempts, synced)
                     VALUES (?1, ?2, ?3, 0, 0)"
                ),
                rusqlite::params![now, priority as i64, stored],
            )?;
            tx.last_insert_rowid()
        } else {
            tx.execute(
                &format!(
                    "INSERT INTO {table} (timestamp, priority, payload, attempts)
                     VALUES (?1, ?2, ?3, 0)"
                ),
                rusqlite::params![now, priority as i64, stored],
            )?;
            tx.last_insert_rowid()
        };

        tx.commit()?;
        Ok(id)
    }

    /// Enqueues a metric payload, optionally gzip-compressed.
    pub fn enqueue_metric(
        &self,
        payload: &[u8],
        priority: Priority,
        compress: bool,
    ) -> Result<i64, QueueError> {
        self.insert(QueueKind::Metric, priority, payload, compress)
    }

    /// Enqueues an event payload, optionally gzip-compressed. `kind`/`severity` are expected
    /// to already be folded into `payload` by the caller (a JSON envelope).
    pub fn enqueue_event(&self, payload: &[u8], compress: bool) -> Result<i64, QueueError> {
        self.insert(QueueKind::Event, Priority::Normal, payload, compress)
    }

    /// Enqueues a command-result payload, optionally gzip-compressed.
    pub fn enqueue_command_result(
        &self,
        payload: &[u8],
        priority: Priority,
        compress: bool,
    ) -> Result<i64, QueueError> {
        self.insert(QueueKind::CommandResult, priority, payload, compress)
    }

    fn pending(&self, kind: QueueKind, limit: i64) -> Result<Vec<QueuedItem>, QueueError> {
        let conn = self.conn.lock().expect("queue connection mutex poisoned");
        let table = kind.table();
        let sql = if kind.has_synced_column() {
            format!(
                "SELECT id, timestamp, priority, payload, attempts FROM {table}
                 WHERE synced = 0 ORDER BY priority DESC, timestamp ASC LIMIT ?1"
            )
        } else {
            format!(
                "SELECT id, timestamp, priority, payload, attempts FROM {table}
                 ORDER BY priority DESC, timestamp ASC LIMIT ?1"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], |row| {
            let raw_payload: Vec<u8> = row.get(3)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                raw_payload,
                row.get::<_, i32>(4)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, timestamp, priority, raw_payload, attempts) = row?;
            let payload = decompress_if_gzipped(&raw_payload).map_err(QueueError::Compression)?;
            items.push(QueuedItem {
                id,
                timestamp,
                priority: Priority::from_i64(priority),
                payload,
                attempts,
            });
        }
        Ok(items)
    }

    /// Reads up to `limit` pending metrics in priority-then-age order without marking them
    /// consumed.
    pub fn pending_metrics(&self, limit: i64) -> Result<Vec<QueuedItem>, QueueError> {
        self.pending(QueueKind::Metric, limit)
    }

    /// Reads up to `limit` pending events in priority-then-age order without marking them
    /// consumed.
    pub fn pending_events(&self, limit: i64) -> Result<Vec<QueuedItem>, QueueError> {
        self.pending(QueueKind::Event, limit)
    }

    /// Reads up to `limit` pending command results in priority-then-age order without
    /// marking them consumed.
    pub fn pending_command_results(&self, limit: i64) -> Result<Vec<QueuedItem>, QueueError> {
        self.pending(QueueKind::CommandResult, limit)
    }

    /// Marks `ids` consumed: metrics are deleted, events/results flip `synced`. Atomic
    /// across the whole id set. Also bumps `sync_state.last_sync`.
    pub fn ack(&self, kind: QueueKind, ids: &[i64]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("queue connection mutex poisoned");
        let tx = conn.transaction()?;
        let table = kind.table();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");

        if kind.has_synced_column() {
            let sql = format!("UPDATE {table} SET synced = 1 WHERE id IN ({placeholders})");
            let params: Vec<&dyn rusqlite::ToSql> =
                ids.iter().map(|i| i as &dyn rusqlite::ToSql).collect();
            tx.execute(&sql, params.as_slice())?;
        } else {
            let sql = format!("DELETE FROM {table} WHERE id IN ({placeholders})");
            let params: Vec<&dyn rusqlite::ToSql> =
                ids.iter().map(|i| i as &dyn rusqlite::ToSql).collect();
            tx.execute(&sql, params.as_slice())?;
        }

        tx.execute(
            "UPDATE sync_state SET last_sync = ?1 WHERE id = 0",
            [now_unix()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drops items older than `max_age_secs` regardless of sync state, across all three
    /// tables, then reclaims storage.
    pub fn prune(&self, max_age_secs: i64) -> Result<(), QueueError> {
        let conn = self.conn.lock().expect("queue connection mutex poisoned");
        let cutoff = now_unix() - max_age_secs;
        for table in ["metrics_queue", "event_queue", "command_queue"] {
            conn.execute(
                &format!("DELETE FROM {table} WHERE timestamp < ?1"),
                [cutoff],
            )?;
        }
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE); VACUUM;")?;
        Ok(())
    }

    /// Returns current occupancy across all tables.
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.conn.lock().expect("queue connection mutex poisoned");

        let metrics_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM metrics_queue", [], |r| r.get(0))?;
        let events_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM event_queue WHERE synced = 0",
            [],
            |r| r.get(0),
        )?;
        let results_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM command_queue WHERE synced = 0",
            [],
            |r| r.get(0),
        )?;
        let oldest_metric_timestamp: Option<i64> = conn
            .query_row("SELECT MIN(timestamp) FROM metrics_queue", [], |r| {
                r.get(0)
            })
            .optional()?
            .flatten();
        let total_bytes: i64 = conn.query_row(
            "SELECT
                (SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM metrics_queue) +
                (SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM event_queue) +
                (SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM command_queue)",
            [],
            |r| r.get(0),
        )?;
        let last_sync: Option<i64> = conn
            .query_row("SELECT last_sync FROM sync_state WHERE id = 0", [], |r| {
                r.get(0)
            })
            .optional()?
            .flatten();

        Ok(QueueStats {
            metrics_count,
            events_count,
            results_count,
            oldest_metric_timestamp,
            total_bytes,
            last_sync,
        })
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn compress_payload(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

fn decompress_if_gzipped(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    if payload.len() >= 2 && payload[0..2] == GZIP_MAGIC {
        use flate2::read::GzDecoder;
        let mut decoder = GzDecoder::new(payload);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_pending_ack_round_trip() {
        let queue = Queue::open_in_memory(QueueLimits::default()).unwrap();
        let id = queue
            .enqueue_metric(b"cpu=10", Priority::Normal, false)
            .unwrap();

        let pending = queue.pending_metrics(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].payload, b"cpu=10");

        queue.ack(QueueKind::Metric, &[id]).unwrap();
        let pending_after = queue.pending_metrics(10).unwrap();
        assert!(pending_after.is_empty());

        let stats = queue.stats().unwrap();
        assert_eq!(stats.metrics_count, 0);
        assert!(stats.last_sync.is_some());
    }

    #[test]
    fn gzip_round_trip_is_transparent() {
        let queue = Queue::open_in_memory(QueueLimits::default()).unwrap();
        let payload = b"a very compressible payload ".repeat(50);
        queue
            .enqueue_event(&payload, true)
            .unwrap();

        let pending = queue.pending_events(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, payload);
    }

    #[test]
    fn eviction_keeps_metrics_queue_bounded() {
        let limits = QueueLimits {
            max_metrics: 3,
            ..QueueLimits::default()
        };
        let queue = Queue::open_in_memory(limits).unwrap();
        for i in 0..5 {
            queue
                .enqueue_metric(format!("m{i}").as_bytes(), Priority::Normal, false)
                .unwrap();
        }

        let stats = queue.stats().unwrap();
        assert_eq!(stats.metrics_count, 3);
    }

    #[test]
    fn events_evict_synced_before_unsynced() {
        let limits = QueueLimits {
            max_events: 2,
            ..QueueLimits::default()
        };
        let queue = Queue::open_in_memory(limits).unwrap();
        let synced_id = queue.enqueue_event(b"old-synced", false).unwrap();
        queue.ack(QueueKind::Event, &[synced_id]).unwrap();
        queue.enqueue_event(b"unsynced-1", false).unwrap();

        // This insert should evict the already-synced row rather than the unsynced one.
        queue.enqueue_event(b"unsynced-2", false).unwrap();

        let pending = queue.pending_events(10).unwrap();
        let payloads: Vec<_> = pending.iter().map(|i| i.payload.clone()).collect();
        assert!(payloads.contains(&b"unsynced-1".to_vec()));
        assert!(payloads.contains(&b"unsynced-2".to_vec()));
    }

    #[test]
    fn full_queue_with_no_synced_rows_refuses_insert() {
        let limits = QueueLimits {
            max_events: 2,
            ..QueueLimits::default()
        };
        let queue = Queue::open_in_memory(limits).unwrap();
        queue.enqueue_event(b"unsynced-1", false).unwrap();
        queue.enqueue_event(b"unsynced-2", false).unwrap();

        let err = queue.enqueue_event(b"unsynced-3", false).unwrap_err();
        assert!(matches!(err, QueueError::Full { .. }));

        let pending = queue.pending_events(10).unwrap();
        let payloads: Vec<_> = pending.iter().map(|i| i.payload.clone()).collect();
        assert!(payloads.contains(&b"unsynced-1".to_vec()));
        assert!(payloads.contains(&b"unsynced-2".to_vec()));
        assert!(!payloads.contains(&b"unsynced-3".to_vec()));
    }
}
