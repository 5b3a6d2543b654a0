// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::RemoteError;
use crate::proto::{LogEntries, MetricsRequest, LOG_WRITER_PATH, METRICS_WRITER_PATH};
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Unary client for the collector's `LogWriter` and `MetricsWriter` services.
#[derive(Debug, Clone)]
pub struct CollectorClient {
    inner: tonic::client::Grpc<Channel>,
}

impl CollectorClient {
    /// Builds a client whose channel connects on first use. Must be called
    /// inside a tokio runtime.
    pub fn connect_lazy(endpoint: &str) -> Result<Self, RemoteError> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|_| RemoteError::InvalidEndpoint(endpoint.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .connect_lazy();
        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
        })
    }

    pub async fn write_logs(&mut self, entries: LogEntries) -> Result<(), RemoteError> {
        self.unary(entries, LOG_WRITER_PATH).await
    }

    pub async fn write_metrics(&mut self, request: MetricsRequest) -> Result<(), RemoteError> {
        self.unary(request, METRICS_WRITER_PATH).await
    }

    async fn unary<M>(&mut self, message: M, path: &'static str) -> Result<(), RemoteError>
    where
        M: prost::Message + Send + Sync + 'static,
    {
        self.inner.ready().await?;
        let codec: ProstCodec<M, ()> = ProstCodec::default();
        self.inner
            .unary(Request::new(message), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(())
    }
}
