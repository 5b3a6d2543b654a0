// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::SinkError;
use crate::metrics::{DimensionKey, LevelCounts, MetricsBatch, MetricsWriter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

type Rows = BTreeMap<(DimensionKey, DateTime<Utc>), LevelCounts>;

/// Process-local metrics store with the same merge semantics as the SQL store.
#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    rows: Mutex<Rows>,
}

impl InMemoryMetricsStore {
    fn lock(&self) -> MutexGuard<'_, Rows> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &DimensionKey, bucket: DateTime<Utc>) -> Option<LevelCounts> {
        self.lock().get(&(key.clone(), bucket)).copied()
    }

    /// Rows stored for `key`, oldest bucket first.
    pub fn rows_for(&self, key: &DimensionKey) -> Vec<(DateTime<Utc>, LevelCounts)> {
        self.lock()
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|((_, bucket), counts)| (*bucket, *counts))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl MetricsWriter for InMemoryMetricsStore {
    async fn write_metrics(&self, batch: MetricsBatch) -> Result<(), SinkError> {
        let merged = batch.merged();
        let mut rows = self.lock();
        for (key, counts) in merged {
            *rows.entry((key, batch.bucket)).or_default() += counts;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSnapshot;

    fn batch(bucket: DateTime<Utc>, error: u32, warning: u32) -> MetricsBatch {
        MetricsBatch {
            bucket,
            snapshots: vec![MetricSnapshot {
                key: DimensionKey::Category("Auth".into()),
                bucket,
                counts: LevelCounts {
                    error,
                    warning,
                    ..LevelCounts::default()
                },
            }],
        }
    }

    #[tokio::test]
    async fn test_second_snapshot_adds_to_row() {
        let store = InMemoryMetricsStore::default();
        let bucket = Utc::now();
        store.write_metrics(batch(bucket, 2, 1)).await.unwrap();
        store.write_metrics(batch(bucket, 1, 0)).await.unwrap();

        assert_eq!(store.len(), 1);
        let row = store
            .get(&DimensionKey::Category("Auth".into()), bucket)
            .unwrap();
        assert_eq!(row.error, 3);
        assert_eq!(row.warning, 1);
    }

    #[tokio::test]
    async fn test_distinct_buckets_are_distinct_rows() {
        let store = InMemoryMetricsStore::default();
        let first = Utc::now();
        let second = first + chrono::TimeDelta::seconds(5);
        store.write_metrics(batch(first, 1, 0)).await.unwrap();
        store.write_metrics(batch(second, 1, 0)).await.unwrap();
        assert_eq!(
            store
                .rows_for(&DimensionKey::Category("Auth".into()))
                .len(),
            2
        );
    }
}
