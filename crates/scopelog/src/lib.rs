// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # scopelog
//!
//! Buffered multi-sink structured logging. Log events carry correlation context
//! taken from nested scopes (service, trace, operation) and are shipped to one
//! or more sinks without blocking the caller.
//!
//! - [`pipeline`]: dispatcher, per-category [`Logger`] and explicit [`LogContext`]
//! - [`scope`]: nested scope tracking and correlation extraction
//! - [`sink`]: the [`Sink`] trait and the queue plus worker [`BufferedSink`]
//! - [`file`]: rotating files with per-trace forking
//! - [`metrics`]: per-level counters sampled into wall-clock buckets
//! - [`config`]: option structs and the figment loader

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod error;
pub mod event;
pub mod file;
pub mod metrics;
pub mod pipeline;
pub mod scope;
pub mod sink;

pub use error::{ConfigError, SinkError};
pub use event::{keys, Correlation, LogEvent, PropertyValue, ScopeEntry, Severity, SharedEvent};
pub use file::FileSink;
pub use metrics::{MetricsAggregator, MetricsWriter};
pub use pipeline::{LogContext, Logger, Pipeline};
pub use scope::{ContextId, ScopeStack};
pub use sink::{BatchWriter, BufferedSink, ScopeChange, Sink, SinkStatus};
