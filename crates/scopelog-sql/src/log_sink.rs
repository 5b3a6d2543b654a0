// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::store::SqliteStore;
use async_trait::async_trait;
use scopelog::config::deserialize_duration_from_millis;
use scopelog::sink::{BatchWriter, BufferedSink, BufferedSinkConfig, Sink, SinkStatus};
use scopelog::{SharedEvent, SinkError};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DbSinkOptions {
    /// SQLite database file. Without one the sink never starts.
    pub path: Option<PathBuf>,
    #[serde(
        rename = "buffer_time_ms",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub buffer_time: Duration,
    pub disabled: bool,
}

impl Default for DbSinkOptions {
    fn default() -> Self {
        Self {
            path: None,
            buffer_time: Duration::from_secs(5),
            disabled: false,
        }
    }
}

/// Opens the store on the worker the first time the sink starts.
pub struct DbLogWriter {
    path: PathBuf,
    store: Option<SqliteStore>,
}

impl DbLogWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path, store: None }
    }

    /// Writes through an already opened store.
    pub fn with_store(store: SqliteStore) -> Self {
        Self {
            path: PathBuf::new(),
            store: Some(store),
        }
    }
}

#[async_trait]
impl BatchWriter for DbLogWriter {
    type Item = SharedEvent;

    async fn open(&mut self) -> Result<(), SinkError> {
        if self.store.is_none() {
            debug!("DB_SINK | opening {}", self.path.display());
            self.store = Some(SqliteStore::open(&self.path)?);
        }
        Ok(())
    }

    async fn write_batch(&mut self, batch: Vec<SharedEvent>) -> Result<(), SinkError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| SinkError::Storage("store is not open".to_string()))?;
        store.insert_logs(batch).await?;
        Ok(())
    }
}

/// Stores trace-correlated events in the `log_entries` table. Events without a
/// trace id are ignored.
pub struct DbSink {
    inner: Option<BufferedSink<DbLogWriter>>,
    disabled: AtomicBool,
}

impl DbSink {
    pub fn new(options: DbSinkOptions) -> Self {
        let Some(path) = options.path.filter(|p| !p.as_os_str().is_empty()) else {
            warn!("DB_SINK | no database path configured, database logging is disabled");
            return Self {
                inner: None,
                disabled: AtomicBool::new(true),
            };
        };
        Self::with_writer(options.buffer_time, options.disabled, DbLogWriter::new(path))
    }

    pub fn with_writer(buffer_time: Duration, disabled: bool, writer: DbLogWriter) -> Self {
        let config = BufferedSinkConfig::new("DB_SINK", buffer_time);
        let inner = if disabled {
            BufferedSink::new_disabled(config, writer)
        } else {
            BufferedSink::new(config, writer)
        };
        Self {
            inner: Some(inner),
            disabled: AtomicBool::new(disabled),
        }
    }
}

#[async_trait]
impl Sink for DbSink {
    fn name(&self) -> &str {
        "db"
    }

    fn write(&self, event: &SharedEvent) {
        if event.trace_id().is_none() {
            return;
        }
        if let Some(inner) = &self.inner {
            inner.enqueue(Arc::clone(event));
        }
    }

    async fn start(&self) -> Result<(), SinkError> {
        match &self.inner {
            Some(inner) if !self.disabled.load(Ordering::Relaxed) => inner.start(),
            _ => Ok(()),
        }
    }

    async fn stop(&self, grace: Duration) {
        if let Some(inner) = &self.inner {
            inner.stop(grace).await;
        }
    }

    async fn set_disabled(&self, disabled: bool) {
        let Some(inner) = &self.inner else {
            return;
        };
        self.disabled.store(disabled, Ordering::Relaxed);
        if let Err(e) = inner.set_disabled(disabled).await {
            warn!("DB_SINK | failed to toggle sink: {}", e);
        }
    }

    fn status(&self) -> SinkStatus {
        self.inner
            .as_ref()
            .map_or(SinkStatus::Stopped, BufferedSink::status)
    }
}
