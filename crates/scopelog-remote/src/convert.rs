// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::proto::{GrpcLogEntry, GrpcMetric, GrpcMetricType, LogEntries, MetricsRequest};
use chrono::{DateTime, TimeZone, Utc};
use prost_types::Timestamp;
use scopelog::metrics::{DimensionKey, LevelCounts, MetricSnapshot, MetricsBatch};
use scopelog::{Correlation, LogEvent, Severity};
use tracing::debug;
use uuid::Uuid;

pub fn to_timestamp(time: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: time.timestamp(),
        nanos: i32::try_from(time.timestamp_subsec_nanos()).unwrap_or(0),
    }
}

/// Missing or out of range timestamps read as the epoch.
pub fn from_timestamp(timestamp: Option<&Timestamp>) -> DateTime<Utc> {
    timestamp
        .and_then(|ts| {
            let nanos = u32::try_from(ts.nanos).ok()?;
            Utc.timestamp_opt(ts.seconds, nanos).single()
        })
        .unwrap_or_default()
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

impl From<&LogEvent> for GrpcLogEntry {
    fn from(event: &LogEvent) -> Self {
        GrpcLogEntry {
            timestamp: Some(to_timestamp(event.timestamp)),
            category: event.category.clone(),
            message: event.message.clone(),
            level: event.severity.as_i32(),
            exception: event.exception.clone(),
            service_id: event
                .service_id()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            trace_id: event.trace_id().unwrap_or_default().to_string(),
            operation: event.operation().unwrap_or_default().to_string(),
            tenant_id: event.tenant_id.clone(),
        }
    }
}

impl GrpcLogEntry {
    /// Rebuilds the event on the collector side. A service id that does not
    /// parse leaves the event without a service.
    pub fn into_event(self) -> LogEvent {
        let severity = Severity::from_i32(self.level).unwrap_or(Severity::Information);
        let service_id = Uuid::parse_str(&self.service_id).ok().filter(|id| !id.is_nil());
        let mut event = LogEvent::new(self.category, severity, self.message).with_correlation(
            Correlation {
                service_id,
                trace_id: non_empty(self.trace_id),
                operation: non_empty(self.operation),
                ..Correlation::default()
            },
        );
        event.timestamp = from_timestamp(self.timestamp.as_ref());
        event.exception = self.exception;
        event.tenant_id = self.tenant_id;
        event
    }
}

impl LogEntries {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a LogEvent>) -> Self {
        LogEntries {
            entries: events.into_iter().map(GrpcLogEntry::from).collect(),
        }
    }
}

fn metric(key: &DimensionKey, counts: LevelCounts) -> GrpcMetric {
    let metric_type = match key {
        DimensionKey::Category(_) => GrpcMetricType::Category,
        DimensionKey::Operation(_) => GrpcMetricType::Operation,
        DimensionKey::Service(_) => GrpcMetricType::Service,
    };
    GrpcMetric {
        metric_type: metric_type as i32,
        key: key.name(),
        dbg_count: counts.debug,
        inf_count: counts.info,
        wrn_count: counts.warning,
        err_count: counts.error,
        cri_count: counts.critical,
    }
}

impl From<&MetricsBatch> for MetricsRequest {
    fn from(batch: &MetricsBatch) -> Self {
        MetricsRequest {
            timestamp: Some(to_timestamp(batch.bucket)),
            metrics: batch
                .merged()
                .iter()
                .map(|(key, counts)| metric(key, *counts))
                .collect(),
        }
    }
}

impl GrpcMetric {
    /// `None` for an unknown metric type or a service key that is not a UUID.
    pub fn key(&self) -> Option<DimensionKey> {
        match GrpcMetricType::try_from(self.metric_type).ok()? {
            GrpcMetricType::Category => Some(DimensionKey::Category(self.key.clone())),
            GrpcMetricType::Operation => Some(DimensionKey::Operation(self.key.clone())),
            GrpcMetricType::Service => Uuid::parse_str(&self.key).ok().map(DimensionKey::Service),
        }
    }

    pub fn counts(&self) -> LevelCounts {
        LevelCounts {
            debug: self.dbg_count,
            info: self.inf_count,
            warning: self.wrn_count,
            error: self.err_count,
            critical: self.cri_count,
        }
    }
}

impl MetricsRequest {
    /// Converts a received request into a batch. Metrics with an unusable key
    /// are skipped.
    pub fn into_batch(self) -> MetricsBatch {
        let bucket = from_timestamp(self.timestamp.as_ref());
        let snapshots = self
            .metrics
            .iter()
            .filter_map(|metric| match metric.key() {
                Some(key) => Some(MetricSnapshot {
                    key,
                    bucket,
                    counts: metric.counts(),
                }),
                None => {
                    debug!("METRICS | skipping metric with unusable key {:?}", metric.key);
                    None
                }
            })
            .collect();
        MetricsBatch { bucket, snapshots }
    }
}
