// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector endpoint for [`crate::GrpcSink`] and [`crate::GrpcMetricsWriter`].
//!
//! ```text
//!  GrpcSink ──── /scopelog.v1.LogWriter/Write ─────► LogHandler ─────► Sink::write
//!  GrpcMetricsWriter ─ /scopelog.v1.MetricsWriter/Write ─► MetricsHandler ─► MetricsWriter
//! ```
//!
//! Services are routed by hand the way tonic-generated servers are. A service
//! without a backend is not registered and answers `Unimplemented`.

use crate::error::RemoteError;
use crate::proto::{LogEntries, MetricsRequest, LOG_WRITER_PATH, METRICS_WRITER_PATH};
use async_trait::async_trait;
use scopelog::config::deserialize_duration_from_millis;
use scopelog::metrics::MetricsWriter;
use scopelog::sink::Sink;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::{empty_body, http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{NamedService, UnaryService};
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectorOptions {
    /// Address to listen on, for example `0.0.0.0:50051`.
    pub listen: Option<String>,
    /// Queue time of received metrics before they are merged.
    #[serde(
        rename = "buffer_time_ms",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub buffer_time: Duration,
    pub disabled: bool,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            listen: None,
            buffer_time: Duration::from_secs(1),
            disabled: false,
        }
    }
}

impl CollectorOptions {
    pub fn address(&self) -> Result<Option<SocketAddr>, RemoteError> {
        let Some(listen) = self.listen.as_deref().map(str::trim).filter(|l| !l.is_empty()) else {
            return Ok(None);
        };
        listen
            .parse()
            .map(Some)
            .map_err(|_| RemoteError::InvalidEndpoint(listen.to_string()))
    }
}

/// One unary RPC served by a [`GrpcRoute`].
#[async_trait]
pub trait UnaryHandler: Send + Sync + 'static {
    /// Fully qualified service name, for example `scopelog.v1.LogWriter`.
    const SERVICE: &'static str;
    const PATH: &'static str;
    type Request: prost::Message + Default + Send + 'static;

    async fn handle(&self, request: Self::Request) -> Result<(), Status>;
}

/// Hands received log entries to a sink.
pub struct LogHandler {
    sink: Arc<dyn Sink>,
}

#[async_trait]
impl UnaryHandler for LogHandler {
    const SERVICE: &'static str = "scopelog.v1.LogWriter";
    const PATH: &'static str = LOG_WRITER_PATH;
    type Request = LogEntries;

    async fn handle(&self, request: LogEntries) -> Result<(), Status> {
        let received = request.entries.len();
        for entry in request.entries {
            self.sink.write(&Arc::new(entry.into_event()));
        }
        debug!("COLLECTOR | received {} log entries", received);
        Ok(())
    }
}

/// Hands received metrics to a writer.
pub struct MetricsHandler {
    writer: Arc<dyn MetricsWriter>,
}

#[async_trait]
impl UnaryHandler for MetricsHandler {
    const SERVICE: &'static str = "scopelog.v1.MetricsWriter";
    const PATH: &'static str = METRICS_WRITER_PATH;
    type Request = MetricsRequest;

    async fn handle(&self, request: MetricsRequest) -> Result<(), Status> {
        let batch = request.into_batch();
        debug!(
            "COLLECTOR | received {} metrics for bucket {}",
            batch.snapshots.len(),
            batch.bucket
        );
        self.writer
            .write_metrics(batch)
            .await
            .map_err(|e| Status::internal(e.to_string()))
    }
}

struct Unary<H>(Arc<H>);

impl<H: UnaryHandler> UnaryService<H::Request> for Unary<H> {
    type Response = ();
    type Future = BoxFuture<Response<()>, Status>;

    fn call(&mut self, request: Request<H::Request>) -> Self::Future {
        let handler = Arc::clone(&self.0);
        Box::pin(async move {
            handler.handle(request.into_inner()).await?;
            Ok(Response::new(()))
        })
    }
}

/// tonic service serving the single method of `H`.
pub struct GrpcRoute<H> {
    handler: Arc<H>,
}

impl<H> GrpcRoute<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H> Clone for GrpcRoute<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<H: UnaryHandler> NamedService for GrpcRoute<H> {
    const NAME: &'static str = H::SERVICE;
}

impl<H, B> Service<http::Request<B>> for GrpcRoute<H>
where
    H: UnaryHandler,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        if request.uri().path() != H::PATH {
            return Box::pin(async move { Ok(unimplemented_response()) });
        }
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let codec: ProstCodec<(), H::Request> = ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.unary(Unary(handler), request).await)
        })
    }
}

fn unimplemented_response() -> http::Response<BoxBody> {
    let mut response = http::Response::new(empty_body());
    let headers = response.headers_mut();
    headers.insert(Status::GRPC_STATUS, (Code::Unimplemented as i32).into());
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}

/// Receiving end of the collector RPCs.
#[derive(Default)]
pub struct CollectorServer {
    logs: Option<Arc<dyn Sink>>,
    metrics: Option<Arc<dyn MetricsWriter>>,
}

impl CollectorServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Received log entries are written to `sink`.
    pub fn with_logs(mut self, sink: Arc<dyn Sink>) -> Self {
        self.logs = Some(sink);
        self
    }

    /// Received metrics are handed to `writer`.
    pub fn with_metrics(mut self, writer: Arc<dyn MetricsWriter>) -> Self {
        self.metrics = Some(writer);
        self
    }

    /// Serves on `addr` until `cancel` fires.
    pub async fn serve(self, addr: SocketAddr, cancel: CancellationToken) -> Result<(), RemoteError> {
        let logs = self.logs.map(|sink| GrpcRoute::new(LogHandler { sink }));
        let metrics = self
            .metrics
            .map(|writer| GrpcRoute::new(MetricsHandler { writer }));
        info!(
            "COLLECTOR | listening on {} (logs: {}, metrics: {})",
            addr,
            logs.is_some(),
            metrics.is_some()
        );
        Server::builder()
            .add_optional_service(logs)
            .add_optional_service(metrics)
            .serve_with_shutdown(addr, cancel.cancelled())
            .await?;
        info!("COLLECTOR | stopped");
        Ok(())
    }
}
