// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::StoreError;
use crate::schema::{ensure_schema, MetricsTable};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior,
};
use scopelog::metrics::{DimensionKey, LevelCounts, MetricsBatch, MetricsWriter};
use scopelog::{Severity, SharedEvent, SinkError};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task;
use tracing::debug;
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Keys per `IN (...)` lookup. Stays well below SQLite's variable limit.
const LOOKUP_CHUNK: usize = 500;

/// Outcome of one merge transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// A row of `log_entries`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub message: String,
    pub severity: Severity,
    pub exception: Option<String>,
    pub service_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub operation: Option<String>,
    pub tenant_id: String,
}

/// SQLite storage for trace-correlated log entries and per-dimension metrics.
///
/// All statements run on the blocking pool behind one connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    /// Inserts `events` in one transaction. Returns the number of rows written.
    pub async fn insert_logs(&self, events: Vec<SharedEvent>) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let started = Instant::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO log_entries
                        (id, timestamp, category, message, level, exception,
                         service_id, trace_id, operation, tenant_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?;
                for event in &events {
                    stmt.execute(params![
                        Uuid::new_v4().to_string(),
                        event.timestamp.timestamp_millis(),
                        event.category,
                        event.message,
                        event.severity.as_i32(),
                        event.exception,
                        event.service_id().map(|id| id.to_string()),
                        event.trace_id(),
                        event.operation(),
                        event.tenant_id,
                    ])?;
                }
            }
            tx.commit()?;
            debug!(
                "DB_SINK | inserted {} log entries in {}ms",
                events.len(),
                started.elapsed().as_millis()
            );
            Ok(events.len())
        })
        .await
    }

    /// Adds the batch counts to stored rows, creating rows that do not exist.
    ///
    /// Every dimension is merged in a single transaction, so a failure leaves
    /// the tables as they were.
    pub async fn merge_metrics(&self, batch: MetricsBatch) -> Result<MergeSummary, StoreError> {
        if batch.is_empty() {
            return Ok(MergeSummary::default());
        }
        self.with_conn(move |conn| {
            let bucket = batch.bucket.timestamp_millis();
            let mut by_table: BTreeMap<&'static str, (MetricsTable, Vec<(String, LevelCounts)>)> =
                BTreeMap::new();
            for (key, counts) in batch.merged() {
                let table = MetricsTable::for_dimension(key.dimension());
                by_table
                    .entry(table.name())
                    .or_insert_with(|| (table, Vec::new()))
                    .1
                    .push((key.name(), counts));
            }

            // write lock is held before existing rows are read
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut summary = MergeSummary::default();
            for (table, rows) in by_table.into_values() {
                let merged = merge_table(&tx, table, bucket, rows)?;
                summary.inserted += merged.inserted;
                summary.updated += merged.updated;
            }
            tx.commit()?;
            debug!(
                "METRICS | merged bucket {}: {} inserted, {} updated",
                batch.bucket, summary.inserted, summary.updated
            );
            Ok(summary)
        })
        .await
    }

    pub async fn metric_row(
        &self,
        key: DimensionKey,
        bucket: DateTime<Utc>,
    ) -> Result<Option<LevelCounts>, StoreError> {
        self.with_conn(move |conn| {
            let table = MetricsTable::for_dimension(key.dimension());
            let sql = format!(
                "SELECT dbg_count, inf_count, wrn_count, err_count, cri_count
                 FROM {} WHERE {} = ?1 AND timestamp = ?2",
                table.name(),
                table.key_column()
            );
            let row = conn
                .query_row(&sql, params![key.name(), bucket.timestamp_millis()], |row| {
                    read_counts(row, 0)
                })
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Every stored bucket for `key`, oldest first.
    pub async fn metric_rows(
        &self,
        key: DimensionKey,
    ) -> Result<Vec<(DateTime<Utc>, LevelCounts)>, StoreError> {
        self.with_conn(move |conn| {
            let table = MetricsTable::for_dimension(key.dimension());
            let sql = format!(
                "SELECT timestamp, dbg_count, inf_count, wrn_count, err_count, cri_count
                 FROM {} WHERE {} = ?1 ORDER BY timestamp",
                table.name(),
                table.key_column()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![key.name()], |row| {
                    Ok((row.get::<_, i64>(0)?, read_counts(row, 1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(millis, counts)| {
                    Utc.timestamp_millis_opt(millis)
                        .single()
                        .map(|bucket| (bucket, counts))
                        .ok_or_else(|| StoreError::InvalidValue {
                            column: "timestamp",
                            value: millis.to_string(),
                        })
                })
                .collect()
        })
        .await
    }

    pub async fn logs_for_trace(&self, trace_id: &str) -> Result<Vec<StoredLog>, StoreError> {
        let trace_id = trace_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, category, message, level, exception,
                        service_id, trace_id, operation, tenant_id
                 FROM log_entries WHERE trace_id = ?1 ORDER BY timestamp, rowid",
            )?;
            let raw = stmt
                .query_map(params![trace_id], |row| {
                    Ok(RawLog {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        category: row.get(2)?,
                        message: row.get(3)?,
                        level: row.get(4)?,
                        exception: row.get(5)?,
                        service_id: row.get(6)?,
                        trace_id: row.get(7)?,
                        operation: row.get(8)?,
                        tenant_id: row.get(9)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            raw.into_iter().map(RawLog::into_stored).collect()
        })
        .await
    }

    pub async fn count_logs(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM log_entries", [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }
}

fn merge_table(
    tx: &Transaction<'_>,
    table: MetricsTable,
    bucket: i64,
    rows: Vec<(String, LevelCounts)>,
) -> Result<MergeSummary, StoreError> {
    let existing = load_existing(tx, table, bucket, &rows)?;
    let mut summary = MergeSummary::default();

    let mut update = tx.prepare_cached(&format!(
        "UPDATE {} SET dbg_count = ?3, inf_count = ?4, wrn_count = ?5, err_count = ?6, cri_count = ?7
         WHERE {} = ?1 AND timestamp = ?2",
        table.name(),
        table.key_column()
    ))?;
    let mut insert = tx.prepare_cached(&format!(
        "INSERT INTO {} ({}, timestamp, dbg_count, inf_count, wrn_count, err_count, cri_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        table.name(),
        table.key_column()
    ))?;

    for (key, counts) in rows {
        match existing.get(&key) {
            Some(stored) => {
                let mut sum = *stored;
                sum += counts;
                update.execute(params![
                    key,
                    bucket,
                    sum.debug,
                    sum.info,
                    sum.warning,
                    sum.error,
                    sum.critical
                ])?;
                summary.updated += 1;
            }
            None => {
                insert.execute(params![
                    key,
                    bucket,
                    counts.debug,
                    counts.info,
                    counts.warning,
                    counts.error,
                    counts.critical
                ])?;
                summary.inserted += 1;
            }
        }
    }
    Ok(summary)
}

/// Reads the stored rows for every key of `rows` at `bucket`, a chunk of keys
/// per query.
fn load_existing(
    tx: &Transaction<'_>,
    table: MetricsTable,
    bucket: i64,
    rows: &[(String, LevelCounts)],
) -> Result<HashMap<String, LevelCounts>, StoreError> {
    let mut existing = HashMap::new();
    for chunk in rows.chunks(LOOKUP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT {key}, dbg_count, inf_count, wrn_count, err_count, cri_count
             FROM {table} WHERE timestamp = ? AND {key} IN ({placeholders})",
            key = table.key_column(),
            table = table.name(),
        );
        let values = std::iter::once(Value::Integer(bucket))
            .chain(chunk.iter().map(|(key, _)| Value::Text(key.clone())));
        let mut stmt = tx.prepare(&sql)?;
        let found = stmt.query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, String>(0)?, read_counts(row, 1)?))
        })?;
        for row in found {
            let (key, counts) = row?;
            existing.insert(key, counts);
        }
    }
    Ok(existing)
}

fn read_counts(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<LevelCounts> {
    let count = |i: usize| -> rusqlite::Result<u32> {
        let value: i64 = row.get(offset + i)?;
        Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
    };
    Ok(LevelCounts {
        debug: count(0)?,
        info: count(1)?,
        warning: count(2)?,
        error: count(3)?,
        critical: count(4)?,
    })
}

struct RawLog {
    id: String,
    timestamp: i64,
    category: String,
    message: String,
    level: i32,
    exception: Option<String>,
    service_id: Option<String>,
    trace_id: Option<String>,
    operation: Option<String>,
    tenant_id: String,
}

impl RawLog {
    fn into_stored(self) -> Result<StoredLog, StoreError> {
        let invalid = |column: &'static str, value: String| StoreError::InvalidValue { column, value };
        let id = Uuid::parse_str(&self.id).map_err(|_| invalid("id", self.id.clone()))?;
        let timestamp = Utc
            .timestamp_millis_opt(self.timestamp)
            .single()
            .ok_or_else(|| invalid("timestamp", self.timestamp.to_string()))?;
        let severity =
            Severity::from_i32(self.level).ok_or_else(|| invalid("level", self.level.to_string()))?;
        Ok(StoredLog {
            id,
            timestamp,
            category: self.category,
            message: self.message,
            severity,
            exception: self.exception,
            service_id: self.service_id.and_then(|s| Uuid::parse_str(&s).ok()),
            trace_id: self.trace_id,
            operation: self.operation,
            tenant_id: self.tenant_id,
        })
    }
}

#[async_trait]
impl MetricsWriter for SqliteStore {
    async fn write_metrics(&self, batch: MetricsBatch) -> Result<(), SinkError> {
        self.merge_metrics(batch).await?;
        Ok(())
    }
}
