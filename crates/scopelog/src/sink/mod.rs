// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sink abstraction and the shared buffered worker.
//!
//! ```text
//!  Logger::log ──► Sink::write ──► BufferedSink::enqueue ──► mpsc (unbounded)
//!                                                              │
//!                               ┌──────────────────────────────┘
//!                               ▼
//!                  worker: sleep(buffer_time) | wake | cancel
//!                               │
//!                               ▼
//!                  BatchWriter::write_batch(Vec<Item>)   (failures dropped)
//! ```

pub mod buffered;
pub mod worker;

pub use buffered::{BatchWriter, BufferedSink, BufferedSinkConfig};
pub use worker::Worker;

use crate::error::SinkError;
use crate::event::{Correlation, ScopeEntry, SharedEvent};
use crate::scope::ContextId;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Grace period granted to each sink when the pipeline shuts down.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Stopped,
    Running,
    Draining,
}

impl fmt::Display for SinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkStatus::Stopped => write!(f, "stopped"),
            SinkStatus::Running => write!(f, "running"),
            SinkStatus::Draining => write!(f, "draining"),
        }
    }
}

/// A scope entering or leaving a caller context.
///
/// `correlation` is computed with the entry on the stack: after the push for
/// `begin_scope`, before the pop for `end_scope`.
#[derive(Debug, Clone, Copy)]
pub struct ScopeChange<'a> {
    pub context: ContextId,
    pub category: &'a str,
    pub entry: &'a ScopeEntry,
    pub correlation: &'a Correlation,
}

/// A log destination registered with a [`crate::Pipeline`].
///
/// `write`, `begin_scope` and `end_scope` are called on the emitting thread and
/// must not block.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, event: &SharedEvent);

    fn begin_scope(&self, _change: &ScopeChange<'_>) {}

    fn end_scope(&self, _change: &ScopeChange<'_>) {}

    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn stop(&self, _grace: Duration) {}

    /// Stops or restarts the background work without recreating the sink.
    async fn set_disabled(&self, _disabled: bool) {}

    fn status(&self) -> SinkStatus;
}
