// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::client::CollectorClient;
use crate::proto::{LogEntries, MetricsRequest};
use async_trait::async_trait;
use scopelog::config::deserialize_duration_from_millis;
use scopelog::metrics::{MetricsBatch, MetricsWriter};
use scopelog::sink::{BatchWriter, BufferedSink, BufferedSinkConfig, Sink, SinkStatus};
use scopelog::{SharedEvent, SinkError};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GrpcSinkOptions {
    /// Collector address, for example `http://collector:50051`.
    pub endpoint: Option<String>,
    #[serde(
        rename = "buffer_time_ms",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub buffer_time: Duration,
    pub disabled: bool,
}

impl Default for GrpcSinkOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            buffer_time: Duration::from_secs(3),
            disabled: false,
        }
    }
}

impl GrpcSinkOptions {
    fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().filter(|e| !e.trim().is_empty())
    }
}

pub struct GrpcLogWriter {
    endpoint: String,
    client: Option<CollectorClient>,
}

impl GrpcLogWriter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: None,
        }
    }
}

#[async_trait]
impl BatchWriter for GrpcLogWriter {
    type Item = SharedEvent;

    async fn open(&mut self) -> Result<(), SinkError> {
        if self.client.is_none() {
            debug!("GRPC_SINK | connecting to {}", self.endpoint);
            self.client = Some(CollectorClient::connect_lazy(&self.endpoint)?);
        }
        Ok(())
    }

    async fn write_batch(&mut self, batch: Vec<SharedEvent>) -> Result<(), SinkError> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| SinkError::Transport("client is not connected".to_string()))?;
        let entries = LogEntries::from_events(batch.iter().map(|event| event.as_ref()));
        client.write_logs(entries).await?;
        Ok(())
    }
}

/// Ships trace-correlated events to a remote collector. Each flush is one
/// unary call; a failed call drops the whole batch.
pub struct GrpcSink {
    inner: Option<BufferedSink<GrpcLogWriter>>,
    disabled: AtomicBool,
}

impl GrpcSink {
    pub fn new(options: GrpcSinkOptions) -> Self {
        let Some(endpoint) = options.endpoint() else {
            warn!("GRPC_SINK | no endpoint configured, remote logging is disabled");
            return Self {
                inner: None,
                disabled: AtomicBool::new(true),
            };
        };
        let config = BufferedSinkConfig::new("GRPC_SINK", options.buffer_time);
        let writer = GrpcLogWriter::new(endpoint);
        let inner = if options.disabled {
            BufferedSink::new_disabled(config, writer)
        } else {
            BufferedSink::new(config, writer)
        };
        Self {
            inner: Some(inner),
            disabled: AtomicBool::new(options.disabled),
        }
    }
}

#[async_trait]
impl Sink for GrpcSink {
    fn name(&self) -> &str {
        "grpc"
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
            warn!("GRPC_SINK | failed to toggle sink: {}", e);
        }
    }

    fn status(&self) -> SinkStatus {
        self.inner
            .as_ref()
            .map_or(SinkStatus::Stopped, BufferedSink::status)
    }
}

/// Sends sampled metrics to the collector's `MetricsWriter` service.
pub struct GrpcMetricsWriter {
    endpoint: String,
    client: OnceCell<CollectorClient>,
}

impl GrpcMetricsWriter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<CollectorClient, SinkError> {
        let client = self
            .client
            .get_or_try_init(|| async { CollectorClient::connect_lazy(&self.endpoint) })
            .await?;
        Ok(client.clone())
    }
}

#[async_trait]
impl MetricsWriter for GrpcMetricsWriter {
    async fn write_metrics(&self, batch: MetricsBatch) -> Result<(), SinkError> {
        let mut client = self.client().await?;
        client.write_metrics(MetricsRequest::from(&batch)).await?;
        Ok(())
    }
}
