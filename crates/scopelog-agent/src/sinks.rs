// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::AgentConfig;
use scopelog::metrics::MetricsWriter;
use scopelog::{FileSink, MetricsAggregator, Pipeline};
use scopelog_remote::{GrpcMetricsWriter, GrpcSink, PushSink};
use scopelog_sql::{DbSink, SqliteStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Where sampled metrics go: the database when one is configured, otherwise
/// the remote collector.
pub fn metrics_writer(config: &AgentConfig) -> anyhow::Result<Option<Arc<dyn MetricsWriter>>> {
    if let Some(path) = &config.db.path {
        info!("METRICS | persisting to {}", path.display());
        return Ok(Some(Arc::new(SqliteStore::open(path)?)));
    }
    if let Some(endpoint) = config.grpc.endpoint.as_deref().filter(|e| !e.is_empty()) {
        info!("METRICS | forwarding to {}", endpoint);
        return Ok(Some(Arc::new(GrpcMetricsWriter::new(endpoint))));
    }
    Ok(None)
}

/// Registers a sink for every configured section.
pub fn build_pipeline(config: &AgentConfig) -> anyhow::Result<Pipeline> {
    let mut builder = Pipeline::builder().options(config.pipeline.clone());

    if config.file.directory.is_some() {
        builder = builder.sink(Arc::new(FileSink::new(config.file.clone())));
    }
    match metrics_writer(config)? {
        Some(writer) => {
            builder = builder.sink(Arc::new(MetricsAggregator::new(
                config.metrics.clone(),
                writer,
            )));
        }
        None => warn!("METRICS | no database or collector configured, metrics are off"),
    }
    if config.db.path.is_some() {
        builder = builder.sink(Arc::new(DbSink::new(config.db.clone())));
    }
    if config.grpc.endpoint.is_some() {
        builder = builder.sink(Arc::new(GrpcSink::new(config.grpc.clone())));
    }
    if config.push.hub_url.is_some() {
        builder = builder.sink(Arc::new(PushSink::new(config.push.clone())));
    }
    Ok(builder.build())
}

/// Applies the `disabled` flags of a reloaded configuration.
pub async fn apply_disabled_flags(pipeline: &Pipeline, config: &AgentConfig) {
    for (name, disabled) in config.disabled_flags() {
        if pipeline.sinks().iter().any(|s| s.name() == name) {
            pipeline.set_disabled(name, disabled).await;
        }
    }
}
