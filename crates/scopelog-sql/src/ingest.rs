// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector side of remote metrics: batches received from other processes are
//! queued and merged into the store, one transaction per received batch.

use crate::store::SqliteStore;
use async_trait::async_trait;
use scopelog::metrics::{MetricsBatch, MetricsWriter};
use scopelog::sink::{BatchWriter, BufferedSink, BufferedSinkConfig, SinkStatus};
use scopelog::SinkError;
use std::time::Duration;
use tracing::error;

struct IngestWriter {
    store: SqliteStore,
}

#[async_trait]
impl BatchWriter for IngestWriter {
    type Item = MetricsBatch;

    async fn write_batch(&mut self, batch: Vec<MetricsBatch>) -> Result<(), SinkError> {
        for request in batch {
            let bucket = request.bucket;
            if let Err(e) = self.store.merge_metrics(request).await {
                error!("METRICS | failed to merge received bucket {}: {}", bucket, e);
            }
        }
        Ok(())
    }
}

pub struct MetricsIngest {
    inner: BufferedSink<IngestWriter>,
}

impl MetricsIngest {
    pub fn new(store: SqliteStore, buffer_time: Duration) -> Self {
        Self {
            inner: BufferedSink::new(
                BufferedSinkConfig::new("METRICS_INGEST", buffer_time),
                IngestWriter { store },
            ),
        }
    }

    pub fn start(&self) -> Result<(), SinkError> {
        self.inner.start()
    }

    /// Queues a received batch. Never blocks.
    pub fn submit(&self, batch: MetricsBatch) {
        if !batch.is_empty() {
            self.inner.enqueue(batch);
        }
    }

    pub async fn stop(&self, grace: Duration) {
        self.inner.stop(grace).await;
    }

    pub fn status(&self) -> SinkStatus {
        self.inner.status()
    }
}

#[async_trait]
impl MetricsWriter for MetricsIngest {
    async fn write_metrics(&self, batch: MetricsBatch) -> Result<(), SinkError> {
        self.submit(batch);
        Ok(())
    }
}
