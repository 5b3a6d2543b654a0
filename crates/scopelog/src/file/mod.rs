// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File output.
//!
//! Events are routed by service id to one buffered worker per service:
//!
//! ```text
//!                       ┌─► {directory}/General/     (no service id)
//!  FileSink::write ─────┼─► {directory}/Billing/     (ServiceDescription)
//!                       └─► {directory}/{general}/   (service without description)
//! ```
//!
//! Each worker owns its [`rolling::LogFile`] and one [`crate::ScopeStack`] per
//! caller context, so fork and rotation never race and interleaved contexts
//! keep their own forks.

pub mod format;
pub mod rolling;
pub mod writer;

use crate::config::FileSinkOptions;
use crate::error::SinkError;
use crate::event::{Correlation, SharedEvent};
use crate::sink::{BufferedSink, BufferedSinkConfig, ScopeChange, Sink, SinkStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use rolling::RollingOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;
use writer::{FileCommand, FileWriter, FileWriterOptions};

type ServiceWriter = Arc<BufferedSink<FileWriter>>;

pub struct FileSink {
    options: FileSinkOptions,
    directory: Option<PathBuf>,
    writers: DashMap<Uuid, ServiceWriter>,
    runtime: RwLock<Option<Handle>>,
    disabled: AtomicBool,
}

impl FileSink {
    /// Creates the sink. Without a directory it logs a warning and stays
    /// disabled for good.
    pub fn new(options: FileSinkOptions) -> Self {
        let directory = options
            .directory
            .clone()
            .filter(|dir| !dir.as_os_str().is_empty());
        if directory.is_none() {
            warn!("FILE_SINK | no directory configured, file logging is disabled");
        }
        let disabled = options.disabled;
        Self {
            options,
            directory,
            writers: DashMap::new(),
            runtime: RwLock::new(None),
            disabled: AtomicBool::new(disabled),
        }
    }

    fn runtime(&self) -> Option<Handle> {
        self.runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn folder_for(&self, correlation: &Correlation) -> String {
        correlation
            .service_id
            .and(correlation.service_description.as_deref())
            .filter(|d| !d.trim().is_empty())
            .map(format::sanitize_file_name)
            .unwrap_or_else(|| self.options.general_folder().to_string())
    }

    fn route(&self, correlation: &Correlation) -> Option<ServiceWriter> {
        if self.disabled.load(Ordering::Relaxed) {
            return None;
        }
        let key = correlation.service_id.unwrap_or_else(Uuid::nil);
        if let Some(writer) = self.writers.get(&key) {
            return Some(Arc::clone(writer.value()));
        }

        let directory = self.directory.as_ref()?;
        let runtime = self.runtime()?;
        let base = directory.join(self.folder_for(correlation));
        let writer = self
            .writers
            .entry(key)
            .or_insert_with(|| {
                debug!("FILE_SINK | creating writer for {}", base.display());
                let sink = Arc::new(self.build_writer(base));
                sink.start_on(&runtime);
                sink
            })
            .clone();
        Some(writer)
    }

    fn build_writer(&self, base: PathBuf) -> BufferedSink<FileWriter> {
        let config = BufferedSinkConfig::new("FILE_SINK", self.options.buffer_time)
            .with_max_batch_items(self.options.max_batch_items);
        BufferedSink::new(
            config,
            FileWriter::new(FileWriterOptions {
                base,
                rolling: RollingOptions {
                    max_file_size: self.options.max_file_size,
                    retain_file_count: self.options.retain_file_count,
                },
                fork_enabled: self.options.fork_enabled,
                include_scopes: self.options.include_scopes,
                include_categories: self.options.include_categories,
            }),
        )
    }

    fn writers(&self) -> Vec<ServiceWriter> {
        self.writers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn stop_writers(&self, grace: Duration) {
        join_all(
            self.writers()
                .into_iter()
                .map(|writer| async move { writer.stop(grace).await }),
        )
        .await;
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn write(&self, event: &SharedEvent) {
        if let Some(writer) = self.route(&event.correlation) {
            writer.enqueue(FileCommand::Event(Arc::clone(event)));
        }
    }

    fn begin_scope(&self, change: &ScopeChange<'_>) {
        if let Some(writer) = self.route(change.correlation) {
            writer.enqueue(FileCommand::BeginScope(change.context, change.entry.clone()));
        }
    }

    fn end_scope(&self, change: &ScopeChange<'_>) {
        if let Some(writer) = self.route(change.correlation) {
            writer.enqueue(FileCommand::EndScope(change.context, change.entry.clone()));
        }
    }

    async fn start(&self) -> Result<(), SinkError> {
        let runtime = Handle::try_current().map_err(|_| SinkError::NoRuntime)?;
        *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime.clone());
        if self.disabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        for writer in self.writers() {
            writer.start_on(&runtime);
        }
        Ok(())
    }

    async fn stop(&self, grace: Duration) {
        self.stop_writers(grace).await;
    }

    async fn set_disabled(&self, disabled: bool) {
        if self.disabled.swap(disabled, Ordering::Relaxed) == disabled {
            return;
        }
        if disabled {
            self.stop_writers(crate::sink::DEFAULT_SHUTDOWN_GRACE).await;
        } else if let Some(runtime) = self.runtime() {
            for writer in self.writers() {
                writer.start_on(&runtime);
            }
        }
    }

    fn status(&self) -> SinkStatus {
        let statuses: Vec<SinkStatus> = self.writers().iter().map(|w| w.status()).collect();
        if statuses.contains(&SinkStatus::Draining) {
            SinkStatus::Draining
        } else if self.directory.is_some()
            && !self.disabled.load(Ordering::Relaxed)
            && self.runtime().is_some()
            && statuses.iter().all(|s| *s == SinkStatus::Running)
        {
            SinkStatus::Running
        } else {
            SinkStatus::Stopped
        }
    }
}
