// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-level log counters.
//!
//! ```text
//!  Sink::write ─► Counters (DashMap<key, AtomicU32 x5>)
//!                     │  swap to zero every sample_rate, aligned to the clock
//!                     ▼
//!               MetricsBatch { bucket, snapshots }
//!                     │
//!                     ▼
//!               MetricsWriter::write_metrics   (merge-upsert, failures dropped)
//! ```

pub mod aggregator;
pub mod bucket;
pub mod counter;
pub mod memory;

pub use aggregator::{Counters, MetricsAggregator};
pub use bucket::{truncate, until_next_boundary};
pub use counter::{LevelCounts, MetricCounter};
pub use memory::InMemoryMetricsStore;

use crate::error::SinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dimension {
    Category,
    Operation,
    Service,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Category => write!(f, "category"),
            Dimension::Operation => write!(f, "operation"),
            Dimension::Service => write!(f, "service"),
        }
    }
}

/// A dimension value. The empty string and the nil UUID hold the totals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DimensionKey {
    Category(String),
    Operation(String),
    Service(Uuid),
}

impl DimensionKey {
    pub fn total(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Category => DimensionKey::Category(String::new()),
            Dimension::Operation => DimensionKey::Operation(String::new()),
            Dimension::Service => DimensionKey::Service(Uuid::nil()),
        }
    }

    pub fn dimension(&self) -> Dimension {
        match self {
            DimensionKey::Category(_) => Dimension::Category,
            DimensionKey::Operation(_) => Dimension::Operation,
            DimensionKey::Service(_) => Dimension::Service,
        }
    }

    pub fn name(&self) -> String {
        match self {
            DimensionKey::Category(name) | DimensionKey::Operation(name) => name.clone(),
            DimensionKey::Service(id) => id.to_string(),
        }
    }

    pub fn is_total(&self) -> bool {
        match self {
            DimensionKey::Category(name) | DimensionKey::Operation(name) => name.is_empty(),
            DimensionKey::Service(id) => id.is_nil(),
        }
    }
}

/// Counts captured for one key at the end of a sampling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub key: DimensionKey,
    pub bucket: DateTime<Utc>,
    pub counts: LevelCounts,
}

/// All snapshots of one sampling cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBatch {
    pub bucket: DateTime<Utc>,
    pub snapshots: Vec<MetricSnapshot>,
}

impl MetricsBatch {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Sums snapshots sharing a key.
    pub fn merged(&self) -> BTreeMap<DimensionKey, LevelCounts> {
        let mut merged: BTreeMap<DimensionKey, LevelCounts> = BTreeMap::new();
        for snapshot in &self.snapshots {
            *merged.entry(snapshot.key.clone()).or_default() += snapshot.counts;
        }
        merged
    }
}

/// Durable destination for sampled counts. Implementations add to rows that
/// already exist for a (key, bucket) rather than replacing them.
#[async_trait]
pub trait MetricsWriter: Send + Sync {
    async fn write_metrics(&self, batch: MetricsBatch) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals() {
        assert!(DimensionKey::total(Dimension::Category).is_total());
        assert!(DimensionKey::total(Dimension::Service).is_total());
        assert!(!DimensionKey::Operation("Import".into()).is_total());
        assert_eq!(
            DimensionKey::total(Dimension::Service).name(),
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_merged_sums_duplicate_keys() {
        let bucket = Utc::now();
        let auth = DimensionKey::Category("Auth".into());
        let snapshot = |error| MetricSnapshot {
            key: auth.clone(),
            bucket,
            counts: LevelCounts {
                error,
                ..LevelCounts::default()
            },
        };
        let batch = MetricsBatch {
            bucket,
            snapshots: vec![snapshot(2), snapshot(3)],
        };
        let merged = batch.merged();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[&auth].error, 5);
    }
}
