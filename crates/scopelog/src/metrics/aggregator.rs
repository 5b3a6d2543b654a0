// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::MetricsOptions;
use crate::error::SinkError;
use crate::event::{LogEvent, Severity, SharedEvent};
use crate::metrics::bucket::{truncate, until_next_boundary};
use crate::metrics::{
    Dimension, DimensionKey, LevelCounts, MetricCounter, MetricSnapshot, MetricsBatch,
    MetricsWriter,
};
use crate::sink::{Sink, SinkStatus, Worker, DEFAULT_SHUTDOWN_GRACE};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

fn bump<K>(map: &DashMap<K, Arc<MetricCounter>>, key: &K, severity: Severity)
where
    K: Eq + Hash + Clone,
{
    // tracked under the shard lock so `drain` never evicts a counter mid-increment
    if let Some(counter) = map.get(key) {
        counter.track(severity);
        return;
    }
    map.entry(key.clone()).or_default().track(severity);
}

fn drain<K, F>(
    map: &DashMap<K, Arc<MetricCounter>>,
    bucket: DateTime<Utc>,
    dimension: Dimension,
    to_key: F,
    out: &mut Vec<MetricSnapshot>,
) where
    K: Eq + Hash,
    F: Fn(&K) -> DimensionKey,
{
    let mut total = LevelCounts::default();
    // keys idle for a whole window are evicted
    map.retain(|key, counter| {
        let counts = counter.take();
        if counts.is_zero() {
            return false;
        }
        total += counts;
        out.push(MetricSnapshot {
            key: to_key(key),
            bucket,
            counts,
        });
        true
    });
    if !total.is_zero() {
        out.push(MetricSnapshot {
            key: DimensionKey::total(dimension),
            bucket,
            counts: total,
        });
    }
}

/// Live counters for the current sampling window.
#[derive(Debug, Default)]
pub struct Counters {
    categories: DashMap<String, Arc<MetricCounter>>,
    operations: DashMap<String, Arc<MetricCounter>>,
    services: DashMap<Uuid, Arc<MetricCounter>>,
}

impl Counters {
    pub fn track(&self, event: &LogEvent) {
        if event.severity == Severity::Trace {
            return;
        }
        bump(&self.categories, &event.category, event.severity);
        if let Some(operation) = event.operation().filter(|o| !o.is_empty()) {
            bump(&self.operations, &operation.to_string(), event.severity);
        }
        if let Some(service) = event.service_id().filter(|id| !id.is_nil()) {
            bump(&self.services, &service, event.severity);
        }
    }

    /// Swaps every counter to zero and returns the non-zero counts, plus one
    /// total per dimension that saw any event. Counters that were already zero
    /// are removed.
    pub fn snapshot(&self, bucket: DateTime<Utc>) -> MetricsBatch {
        let mut snapshots = Vec::new();
        drain(
            &self.categories,
            bucket,
            Dimension::Category,
            |name| DimensionKey::Category(name.clone()),
            &mut snapshots,
        );
        drain(
            &self.operations,
            bucket,
            Dimension::Operation,
            |name| DimensionKey::Operation(name.clone()),
            &mut snapshots,
        );
        drain(
            &self.services,
            bucket,
            Dimension::Service,
            |id| DimensionKey::Service(*id),
            &mut snapshots,
        );
        MetricsBatch { bucket, snapshots }
    }
}

/// Sink that counts events per level and periodically hands the counts to a
/// [`MetricsWriter`].
pub struct MetricsAggregator {
    options: MetricsOptions,
    counters: Arc<Counters>,
    writer: Arc<dyn MetricsWriter>,
    worker: Worker,
    disabled: AtomicBool,
}

impl MetricsAggregator {
    pub fn new(options: MetricsOptions, writer: Arc<dyn MetricsWriter>) -> Self {
        let disabled = options.disabled;
        Self {
            options,
            counters: Arc::new(Counters::default()),
            writer,
            worker: Worker::new("METRICS"),
            disabled: AtomicBool::new(disabled),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    fn launch(&self, runtime: &Handle) {
        let counters = Arc::clone(&self.counters);
        let writer = Arc::clone(&self.writer);
        let rate = self.options.sample_rate;
        self.worker
            .launch(runtime, move |cancel| sample(counters, writer, rate, cancel));
    }
}

/// Writes one cycle. A failed write is logged and its counts are lost.
pub async fn collect(counters: &Counters, writer: &dyn MetricsWriter, bucket: DateTime<Utc>) {
    let batch = counters.snapshot(bucket);
    if batch.is_empty() {
        debug!("METRICS | nothing to collect for {}", bucket);
        return;
    }
    let count = batch.snapshots.len();
    let started = Instant::now();
    match writer.write_metrics(batch).await {
        Ok(()) => debug!(
            "METRICS | wrote {} snapshots for {} in {}ms",
            count,
            bucket,
            started.elapsed().as_millis()
        ),
        Err(e) => error!(
            "METRICS | failed to write {} snapshots for {}, dropping them: {}",
            count, bucket, e
        ),
    }
}

async fn sample(
    counters: Arc<Counters>,
    writer: Arc<dyn MetricsWriter>,
    rate: Duration,
    cancel: CancellationToken,
) {
    let rate = rate.max(Duration::from_millis(1));
    let step = TimeDelta::from_std(rate).unwrap_or(TimeDelta::seconds(5));
    let mut window = truncate(Utc::now(), rate);
    debug!("METRICS | sampling every {:?}", rate);

    loop {
        let wait = until_next_boundary(Utc::now(), rate);
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
        let bucket = window;
        window = (bucket + step).max(truncate(Utc::now(), rate));
        collect(&counters, writer.as_ref(), bucket).await;
    }

    collect(&counters, writer.as_ref(), window).await;
    debug!("METRICS | sampler stopped");
}

#[async_trait]
impl Sink for MetricsAggregator {
    fn name(&self) -> &str {
        "metrics"
    }

    fn write(&self, event: &SharedEvent) {
        if !self.disabled.load(Ordering::Relaxed) {
            self.counters.track(event);
        }
    }

    async fn start(&self) -> Result<(), SinkError> {
        let runtime = Handle::try_current().map_err(|_| SinkError::NoRuntime)?;
        if !self.disabled.load(Ordering::Relaxed) {
            self.launch(&runtime);
        }
        Ok(())
    }

    async fn stop(&self, grace: Duration) {
        self.worker.shutdown(grace).await;
    }

    async fn set_disabled(&self, disabled: bool) {
        if self.disabled.swap(disabled, Ordering::Relaxed) == disabled {
            return;
        }
        if disabled {
            self.worker.shutdown(DEFAULT_SHUTDOWN_GRACE).await;
        } else if let Ok(runtime) = Handle::try_current() {
            self.launch(&runtime);
        }
    }

    fn status(&self) -> SinkStatus {
        self.worker.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Correlation;
    use crate::metrics::InMemoryMetricsStore;

    fn event(category: &str, severity: Severity) -> LogEvent {
        LogEvent::new(category, severity, "m")
    }

    fn find<'a>(batch: &'a MetricsBatch, key: &DimensionKey) -> Option<&'a MetricSnapshot> {
        batch.snapshots.iter().find(|s| &s.key == key)
    }

    #[test]
    fn test_snapshot_counts_every_dimension_and_totals() {
        let counters = Counters::default();
        let service = Uuid::new_v4();
        let correlated = event("Auth", Severity::Error).with_correlation(Correlation {
            service_id: Some(service),
            operation: Some("Login".into()),
            ..Correlation::default()
        });
        counters.track(&correlated);
        counters.track(&event("Auth", Severity::Warning));
        counters.track(&event("Db", Severity::Information));
        counters.track(&event("Db", Severity::Trace));

        let bucket = Utc::now();
        let batch = counters.snapshot(bucket);

        let auth = find(&batch, &DimensionKey::Category("Auth".into())).unwrap();
        assert_eq!(auth.counts.error, 1);
        assert_eq!(auth.counts.warning, 1);
        assert_eq!(auth.bucket, bucket);

        let total = find(&batch, &DimensionKey::total(Dimension::Category)).unwrap();
        assert_eq!(total.counts.total(), 3);

        let login = find(&batch, &DimensionKey::Operation("Login".into())).unwrap();
        assert_eq!(login.counts.error, 1);
        let service_row = find(&batch, &DimensionKey::Service(service)).unwrap();
        assert_eq!(service_row.counts.error, 1);
        assert!(find(&batch, &DimensionKey::total(Dimension::Service)).is_some());
    }

    #[test]
    fn test_snapshot_resets_and_skips_silent_keys() {
        let counters = Counters::default();
        counters.track(&event("Auth", Severity::Error));
        assert!(!counters.snapshot(Utc::now()).is_empty());
        assert!(counters.snapshot(Utc::now()).is_empty());
    }

    #[test]
    fn test_idle_keys_are_evicted_after_a_silent_window() {
        let counters = Counters::default();
        for i in 0..50 {
            counters.track(&event(&format!("Job-{i}"), Severity::Information));
        }
        counters.track(&event("Auth", Severity::Error));
        assert_eq!(counters.snapshot(Utc::now()).snapshots.len(), 52);
        assert_eq!(counters.categories.len(), 51);

        counters.track(&event("Auth", Severity::Error));
        let batch = counters.snapshot(Utc::now());
        assert_eq!(counters.categories.len(), 1);
        let auth = find(&batch, &DimensionKey::Category("Auth".into())).unwrap();
        assert_eq!(auth.counts.error, 1);

        counters.snapshot(Utc::now());
        assert!(counters.categories.is_empty());
    }

    #[test]
    fn test_eviction_does_not_lose_concurrent_counts() {
        let counters = Arc::new(Counters::default());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..5_000 {
                        counters.track(&event("Hot", Severity::Warning));
                    }
                })
            })
            .collect();

        let key = DimensionKey::Category("Hot".into());
        let mut seen = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            let batch = counters.snapshot(Utc::now());
            seen += find(&batch, &key).map_or(0, |s| s.counts.warning);
        }
        for writer in writers {
            writer.join().unwrap();
        }
        let batch = counters.snapshot(Utc::now());
        seen += find(&batch, &key).map_or(0, |s| s.counts.warning);
        assert_eq!(seen, 20_000);
    }

    #[test]
    fn test_trace_only_produces_nothing() {
        let counters = Counters::default();
        counters.track(&event("Auth", Severity::Trace));
        assert!(counters.snapshot(Utc::now()).is_empty());
    }

    struct FailingWriter;

    #[async_trait]
    impl MetricsWriter for FailingWriter {
        async fn write_metrics(&self, _batch: MetricsBatch) -> Result<(), SinkError> {
            Err(SinkError::Storage("database is locked".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_write_loses_only_that_cycle() {
        let counters = Counters::default();
        counters.track(&event("Auth", Severity::Error));
        collect(&counters, &FailingWriter, Utc::now()).await;

        let store = InMemoryMetricsStore::default();
        counters.track(&event("Auth", Severity::Warning));
        let bucket = Utc::now();
        collect(&counters, &store, bucket).await;

        let row = store
            .get(&DimensionKey::Category("Auth".into()), bucket)
            .unwrap();
        assert_eq!(row.error, 0);
        assert_eq!(row.warning, 1);
    }

    #[tokio::test]
    async fn test_sampling_loop_persists_each_cycle() {
        let store = Arc::new(InMemoryMetricsStore::default());
        let aggregator = MetricsAggregator::new(
            MetricsOptions {
                sample_rate: Duration::from_millis(100),
                disabled: false,
            },
            store.clone(),
        );
        aggregator.start().await.unwrap();
        assert_eq!(aggregator.status(), SinkStatus::Running);

        aggregator.write(&Arc::new(event("Auth", Severity::Error)));
        aggregator.write(&Arc::new(event("Auth", Severity::Error)));
        aggregator.write(&Arc::new(event("Auth", Severity::Warning)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        aggregator.stop(Duration::from_secs(1)).await;

        let rows = store.rows_for(&DimensionKey::Category("Auth".into()));
        let mut sum = LevelCounts::default();
        for (bucket, counts) in &rows {
            assert_eq!(truncate(*bucket, Duration::from_millis(100)), *bucket);
            sum += *counts;
        }
        assert_eq!(
            sum,
            LevelCounts {
                error: 2,
                warning: 1,
                ..LevelCounts::default()
            }
        );
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_counts() {
        let store = Arc::new(InMemoryMetricsStore::default());
        let aggregator = MetricsAggregator::new(
            MetricsOptions {
                sample_rate: Duration::from_secs(3600),
                disabled: false,
            },
            store.clone(),
        );
        aggregator.start().await.unwrap();
        aggregator.write(&Arc::new(event("Shutdown", Severity::Critical)));
        aggregator.stop(Duration::from_secs(1)).await;

        let rows = store.rows_for(&DimensionKey::Category("Shutdown".into()));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.critical, 1);
    }

    #[tokio::test]
    async fn test_disabled_aggregator_ignores_events() {
        let store = Arc::new(InMemoryMetricsStore::default());
        let aggregator = MetricsAggregator::new(
            MetricsOptions {
                sample_rate: Duration::from_millis(50),
                disabled: true,
            },
            store.clone(),
        );
        aggregator.start().await.unwrap();
        aggregator.write(&Arc::new(event("Auth", Severity::Error)));
        assert_eq!(aggregator.status(), SinkStatus::Stopped);

        aggregator.set_disabled(false).await;
        assert_eq!(aggregator.status(), SinkStatus::Running);
        aggregator.stop(Duration::from_secs(1)).await;
        assert!(store.rows_for(&DimensionKey::Category("Auth".into())).is_empty());
    }
}
