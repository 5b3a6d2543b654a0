// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector role of the agent: events and metrics shipped by other
//! processes' gRPC sinks are persisted to the configured database.

use crate::config::AgentConfig;
use scopelog::sink::DEFAULT_SHUTDOWN_GRACE;
use scopelog::Sink;
use scopelog_remote::CollectorServer;
use scopelog_sql::{DbSink, MetricsIngest, SqliteStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Collector {
    addr: SocketAddr,
    logs: Arc<DbSink>,
    metrics: Arc<MetricsIngest>,
}

impl Collector {
    /// `None` when the collector is disabled, has no listen address or has no
    /// database to write to.
    pub fn from_config(config: &AgentConfig) -> anyhow::Result<Option<Self>> {
        if config.collector.disabled {
            info!("COLLECTOR | disabled");
            return Ok(None);
        }
        let Some(addr) = config.collector.address()? else {
            return Ok(None);
        };
        let Some(path) = config.db.path.as_deref() else {
            warn!("COLLECTOR | no database configured, not listening on {}", addr);
            return Ok(None);
        };
        let metrics = MetricsIngest::new(SqliteStore::open(path)?, config.collector.buffer_time);
        let mut db = config.db.clone();
        db.disabled = false;
        Ok(Some(Self {
            addr,
            logs: Arc::new(DbSink::new(db)),
            metrics: Arc::new(metrics),
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until `cancel` fires, then drains both queues.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.logs.start().await?;
        self.metrics.start()?;
        let served = CollectorServer::new()
            .with_logs(self.logs.clone())
            .with_metrics(self.metrics.clone())
            .serve(self.addr, cancel)
            .await;
        self.logs.stop(DEFAULT_SHUTDOWN_GRACE).await;
        self.metrics.stop(DEFAULT_SHUTDOWN_GRACE).await;
        Ok(served?)
    }
}
