// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live push of log events to a WebSocket hub.
//!
//! Frames are JSON text messages `{"target": .., "arguments": [..]}`. Only
//! events that carry a service id are pushed, and delivery is best effort:
//! frames produced while the hub is unreachable are dropped.

use crate::error::RemoteError;
use async_trait::async_trait;
use futures_util::SinkExt;
use scopelog::config::deserialize_duration_from_millis;
use scopelog::sink::{
    BatchWriter, BufferedSink, BufferedSinkConfig, ScopeChange, Sink, SinkStatus, Worker,
};
use scopelog::{keys, LogEvent, SharedEvent, SinkError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PushSinkOptions {
    pub hub_url: Option<String>,
    pub log_method: String,
    pub state_method: String,
    /// Called once per service channel after each connect.
    pub join_group_method: Option<String>,
    pub include_scopes: bool,
    pub excluded_scopes: Vec<String>,
    #[serde(
        rename = "settle_delay_ms",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub settle_delay: Duration,
    #[serde(
        rename = "reconnect_interval_ms",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub reconnect_interval: Duration,
    #[serde(
        rename = "buffer_time_ms",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub buffer_time: Duration,
    pub disabled: bool,
}

impl Default for PushSinkOptions {
    fn default() -> Self {
        Self {
            hub_url: None,
            log_method: "Logging".to_string(),
            state_method: "State".to_string(),
            join_group_method: None,
            include_scopes: true,
            excluded_scopes: Vec::new(),
            settle_delay: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(60),
            buffer_time: Duration::from_secs(1),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub target: String,
    pub arguments: Vec<Value>,
}

/// Scope labels hidden from the hub. Routing keys are always hidden.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    excluded: HashSet<String>,
}

impl ScopeFilter {
    pub fn new(excluded: &[String]) -> Self {
        let excluded = keys::ROUTING
            .iter()
            .map(|k| (*k).to_string())
            .chain(excluded.iter().cloned())
            .collect();
        Self { excluded }
    }

    pub fn is_included(&self, scope: &str) -> bool {
        !self.excluded.contains(scope)
    }

    pub fn apply(&self, scopes: &[String]) -> Vec<String> {
        scopes
            .iter()
            .filter(|s| self.is_included(s))
            .cloned()
            .collect()
    }
}

/// Turns events and scope changes into frames addressed to a service.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    log_method: String,
    state_method: String,
    include_scopes: bool,
    filter: ScopeFilter,
}

impl FrameBuilder {
    pub fn new(options: &PushSinkOptions) -> Self {
        Self {
            log_method: options.log_method.clone(),
            state_method: options.state_method.clone(),
            include_scopes: options.include_scopes,
            filter: ScopeFilter::new(&options.excluded_scopes),
        }
    }

    /// A state frame when the event runs under an OperationState, a log frame
    /// otherwise. `None` for events without a service.
    pub fn event(&self, event: &LogEvent) -> Option<(Uuid, Frame)> {
        let service_id = event.service_id()?;
        let correlation = &event.correlation;
        let frame = if let Some(state) = &correlation.operation_state {
            Frame {
                target: self.state_method.clone(),
                arguments: vec![
                    json!(service_id),
                    json!(correlation.trace_id),
                    json!(state),
                    json!(event.message),
                ],
            }
        } else if self.include_scopes {
            Frame {
                target: self.log_method.clone(),
                arguments: vec![
                    json!(service_id),
                    json!(correlation.trace_id),
                    json!(event.category),
                    json!(event.message),
                    json!(event.severity.as_i32()),
                    json!(correlation.contextual),
                    json!(self.filter.apply(&event.scopes)),
                ],
            }
        } else {
            Frame {
                target: self.log_method.clone(),
                arguments: vec![
                    json!(service_id),
                    json!(correlation.trace_id),
                    json!(event.message),
                    json!(event.severity.as_i32()),
                    json!(correlation.contextual),
                ],
            }
        };
        Some((service_id, frame))
    }

    pub fn scope(&self, begin: bool, change: &ScopeChange<'_>) -> Option<(Uuid, Frame)> {
        if !self.include_scopes {
            return None;
        }
        let service_id = change.correlation.service_id?;
        let target = if begin { "BeginScope" } else { "EndScope" };
        Some((
            service_id,
            Frame {
                target: target.to_string(),
                arguments: vec![
                    json!(service_id),
                    json!(change.correlation.trace_id),
                    json!(change.category),
                    serde_json::to_value(change.entry).unwrap_or(Value::Null),
                ],
            },
        ))
    }
}

struct Connection {
    stream: WsStream,
    joined: HashSet<Uuid>,
}

/// The hub connection shared by the sender and the reconnect monitor.
struct Link {
    url: String,
    join_group_method: Option<String>,
    connection: Mutex<Option<Connection>>,
}

impl Link {
    async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn connect(&self) -> Result<(), RemoteError> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Ok(());
        }
        let (stream, _) = connect_async(self.url.as_str()).await?;
        info!("PUSH_SINK | connected to {}", self.url);
        *connection = Some(Connection {
            stream,
            joined: HashSet::new(),
        });
        Ok(())
    }

    async fn send(&self, frames: Vec<(Uuid, Frame)>) -> Result<usize, RemoteError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(RemoteError::NotConnected)?;
        let result = self.send_on(connection, frames).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn send_on(
        &self,
        connection: &mut Connection,
        frames: Vec<(Uuid, Frame)>,
    ) -> Result<usize, RemoteError> {
        let count = frames.len();
        for (service_id, frame) in frames {
            if let Some(method) = &self.join_group_method {
                if connection.joined.insert(service_id) {
                    let join = Frame {
                        target: method.clone(),
                        arguments: vec![json!(service_id.to_string())],
                    };
                    connection.stream.feed(text(&join)?).await?;
                }
            }
            connection.stream.feed(text(&frame)?).await?;
        }
        connection.stream.flush().await?;
        Ok(count)
    }

    async fn close(&self) {
        if let Some(mut connection) = self.connection.lock().await.take() {
            if let Err(e) = connection.stream.close(None).await {
                debug!("PUSH_SINK | error closing connection: {}", e);
            }
        }
    }
}

fn text(frame: &Frame) -> Result<Message, RemoteError> {
    Ok(Message::text(serde_json::to_string(frame)?))
}

pub struct PushWriter {
    link: Arc<Link>,
}

#[async_trait]
impl BatchWriter for PushWriter {
    type Item = (Uuid, Frame);

    async fn write_batch(&mut self, batch: Vec<(Uuid, Frame)>) -> Result<(), SinkError> {
        match self.link.send(batch).await {
            Ok(_) => Ok(()),
            Err(RemoteError::NotConnected) => {
                debug!("PUSH_SINK | hub not connected, dropping frames");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn monitor(
    link: Arc<Link>,
    settle_delay: Duration,
    reconnect_interval: Duration,
    cancel: CancellationToken,
) {
    try_connect(&link).await;
    let mut wait = settle_delay;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
        if !link.is_connected().await {
            try_connect(&link).await;
        }
        wait = reconnect_interval;
    }
    link.close().await;
    debug!("PUSH_SINK | monitor stopped");
}

async fn try_connect(link: &Link) {
    if let Err(e) = link.connect().await {
        error!("PUSH_SINK | failed to connect to {}: {}", link.url, e);
    }
}

/// Pushes events with a service id to a WebSocket hub.
pub struct PushSink {
    builder: FrameBuilder,
    settle_delay: Duration,
    reconnect_interval: Duration,
    link: Option<Arc<Link>>,
    inner: Option<BufferedSink<PushWriter>>,
    monitor: Worker,
    disabled: AtomicBool,
}

impl PushSink {
    pub fn new(options: PushSinkOptions) -> Self {
        let builder = FrameBuilder::new(&options);
        let url = options.hub_url.clone().filter(|u| !u.trim().is_empty());
        let (link, inner, disabled) = match url {
            Some(url) => {
                let link = Arc::new(Link {
                    url,
                    join_group_method: options.join_group_method.clone(),
                    connection: Mutex::new(None),
                });
                let writer = PushWriter {
                    link: Arc::clone(&link),
                };
                let config = BufferedSinkConfig::new("PUSH_SINK", options.buffer_time);
                (Some(link), Some(BufferedSink::new(config, writer)), options.disabled)
            }
            None => {
                warn!("PUSH_SINK | no hub url configured, push logging is disabled");
                (None, None, true)
            }
        };
        Self {
            builder,
            settle_delay: options.settle_delay,
            reconnect_interval: options.reconnect_interval,
            link,
            inner,
            monitor: Worker::new("PUSH_SINK"),
            disabled: AtomicBool::new(disabled),
        }
    }

    fn enqueue(&self, frame: Option<(Uuid, Frame)>) {
        if let (Some(inner), Some(frame)) = (&self.inner, frame) {
            inner.enqueue(frame);
        }
    }

    fn launch(&self) -> Result<(), SinkError> {
        let (Some(link), Some(inner)) = (&self.link, &self.inner) else {
            return Ok(());
        };
        let runtime = Handle::try_current().map_err(|_| SinkError::NoRuntime)?;
        inner.start_on(&runtime);
        let link = Arc::clone(link);
        let (settle, interval) = (self.settle_delay, self.reconnect_interval);
        self.monitor
            .launch(&runtime, move |cancel| monitor(link, settle, interval, cancel));
        Ok(())
    }

    async fn halt(&self, grace: Duration) {
        if let Some(inner) = &self.inner {
            inner.stop(grace).await;
        }
        self.monitor.shutdown(grace).await;
    }
}

#[async_trait]
impl Sink for PushSink {
    fn name(&self) -> &str {
        "push"
    }

    fn write(&self, event: &SharedEvent) {
        self.enqueue(self.builder.event(event));
    }

    fn begin_scope(&self, change: &ScopeChange<'_>) {
        self.enqueue(self.builder.scope(true, change));
    }

    fn end_scope(&self, change: &ScopeChange<'_>) {
        self.enqueue(self.builder.scope(false, change));
    }

    async fn start(&self) -> Result<(), SinkError> {
        if self.disabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.launch()
    }

    async fn stop(&self, grace: Duration) {
        self.halt(grace).await;
    }

    async fn set_disabled(&self, disabled: bool) {
        if self.link.is_none() || self.disabled.swap(disabled, Ordering::Relaxed) == disabled {
            return;
        }
        if disabled {
            self.halt(scopelog::sink::DEFAULT_SHUTDOWN_GRACE).await;
        } else if let Err(e) = self.launch() {
            warn!("PUSH_SINK | failed to restart: {}", e);
        }
    }

    fn status(&self) -> SinkStatus {
        self.inner
            .as_ref()
            .map_or(SinkStatus::Stopped, BufferedSink::status)
    }
}
