// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rusqlite::Connection;
use scopelog::metrics::Dimension;

/// One table per metric dimension, unique per (key, timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsTable {
    Category,
    Operation,
    Service,
}

impl MetricsTable {
    pub const ALL: [MetricsTable; 3] = [
        MetricsTable::Category,
        MetricsTable::Operation,
        MetricsTable::Service,
    ];

    pub fn for_dimension(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Category => MetricsTable::Category,
            Dimension::Operation => MetricsTable::Operation,
            Dimension::Service => MetricsTable::Service,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MetricsTable::Category => "category_log_metrics",
            MetricsTable::Operation => "operation_log_metrics",
            MetricsTable::Service => "service_log_metrics",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self {
            MetricsTable::Category => "category",
            MetricsTable::Operation => "operation",
            MetricsTable::Service => "service_id",
        }
    }

    fn create_sql(self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                {key} TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                dbg_count INTEGER NOT NULL DEFAULT 0,
                inf_count INTEGER NOT NULL DEFAULT 0,
                wrn_count INTEGER NOT NULL DEFAULT 0,
                err_count INTEGER NOT NULL DEFAULT 0,
                cri_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY ({key}, timestamp)
            );",
            table = self.name(),
            key = self.key_column()
        )
    }
}

const LOG_ENTRIES: &str = "
CREATE TABLE IF NOT EXISTS log_entries (
    id TEXT PRIMARY KEY NOT NULL,
    timestamp INTEGER NOT NULL,
    category TEXT NOT NULL,
    message TEXT NOT NULL,
    level INTEGER NOT NULL,
    exception TEXT,
    service_id TEXT,
    trace_id TEXT,
    operation TEXT,
    tenant_id TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS ix_log_entries_trace_id ON log_entries (trace_id);
CREATE INDEX IF NOT EXISTS ix_log_entries_timestamp ON log_entries (timestamp);
";

/// Creates any missing table. Existing tables are left untouched.
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(LOG_ENTRIES)?;
    for table in MetricsTable::ALL {
        conn.execute_batch(&table.create_sql())?;
    }
    Ok(())
}
