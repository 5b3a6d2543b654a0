// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dispatcher and per-category loggers.
//!
//! Scope state is never ambient: callers own a [`LogContext`] and pass it to
//! every call.
//!
//! ```ignore
//! let logger = pipeline.logger("Jobs");
//! let mut ctx = LogContext::new();
//! let scope = ScopeEntry::properties([(keys::TRACE_ID, "42"), (keys::OPERATION, "Import")]);
//! logger.begin_scope(&mut ctx, scope.clone());
//! logger.info(&ctx, "importing");
//! logger.end_scope(&mut ctx, &scope);
//! ```

use crate::config::PipelineOptions;
use crate::event::{Correlation, LogEvent, ScopeEntry, Severity};
use crate::scope::{ContextId, ScopeStack};
use crate::sink::{ScopeChange, Sink, SinkStatus};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Scope stack and tenant of one logical execution context.
///
/// Every context gets its own [`ContextId`], so sinks can tell interleaved
/// contexts apart.
#[derive(Debug)]
pub struct LogContext {
    id: ContextId,
    stack: ScopeStack,
    tenant_id: String,
}

impl Default for LogContext {
    fn default() -> Self {
        Self {
            id: ContextId::next(),
            stack: ScopeStack::new(),
            tenant_id: String::new(),
        }
    }
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn set_tenant(&mut self, tenant_id: impl Into<String>) {
        self.tenant_id = tenant_id.into();
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn stack(&self) -> &ScopeStack {
        &self.stack
    }

    pub fn correlation(&self) -> Correlation {
        self.stack.correlation()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

struct Inner {
    options: PipelineOptions,
    sinks: Vec<Arc<dyn Sink>>,
}

#[derive(Default)]
pub struct PipelineBuilder {
    options: PipelineOptions,
    sinks: Vec<Arc<dyn Sink>>,
}

impl PipelineBuilder {
    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            inner: Arc::new(Inner {
                options: self.options,
                sinks: self.sinks,
            }),
        }
    }
}

/// Fans events and scope changes out to every registered sink.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn logger(&self, category: impl Into<String>) -> Logger {
        Logger {
            pipeline: self.clone(),
            category: Arc::from(category.into()),
        }
    }

    pub fn sinks(&self) -> &[Arc<dyn Sink>] {
        &self.inner.sinks
    }

    pub fn is_enabled(&self, severity: Severity) -> bool {
        severity >= self.inner.options.min_severity
    }

    /// Starts every sink. A sink that fails to start is logged and skipped.
    pub async fn start(&self) {
        for sink in &self.inner.sinks {
            match sink.start().await {
                Ok(()) => debug!("PIPELINE | started {} sink", sink.name()),
                Err(e) => error!("PIPELINE | failed to start {} sink: {}", sink.name(), e),
            }
        }
    }

    /// Stops every sink concurrently, each bounded by `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        join_all(self.inner.sinks.iter().map(|sink| async move {
            sink.stop(grace).await;
            debug!("PIPELINE | stopped {} sink", sink.name());
        }))
        .await;
    }

    /// Toggles the sink registered under `name`. Returns whether it exists.
    pub async fn set_disabled(&self, name: &str, disabled: bool) -> bool {
        let mut found = false;
        for sink in self.inner.sinks.iter().filter(|s| s.name() == name) {
            sink.set_disabled(disabled).await;
            found = true;
        }
        if !found {
            warn!("PIPELINE | no sink named {}", name);
        }
        found
    }

    pub fn statuses(&self) -> Vec<(String, SinkStatus)> {
        self.inner
            .sinks
            .iter()
            .map(|sink| (sink.name().to_string(), sink.status()))
            .collect()
    }

    /// Delivers an already built event.
    pub fn dispatch(&self, event: LogEvent) {
        if !self.is_enabled(event.severity) {
            return;
        }
        let event = Arc::new(event);
        for sink in &self.inner.sinks {
            sink.write(&event);
        }
    }

    fn scope_changed(&self, change: &ScopeChange<'_>, entering: bool) {
        for sink in &self.inner.sinks {
            if entering {
                sink.begin_scope(change);
            } else {
                sink.end_scope(change);
            }
        }
    }
}

/// Emits events for one category.
#[derive(Clone)]
pub struct Logger {
    pipeline: Pipeline,
    category: Arc<str>,
}

impl Logger {
    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn is_enabled(&self, severity: Severity) -> bool {
        self.pipeline.is_enabled(severity)
    }

    pub fn log(&self, ctx: &LogContext, severity: Severity, message: impl Into<String>) {
        self.emit(ctx, severity, message.into(), None);
    }

    pub fn log_exception(
        &self,
        ctx: &LogContext,
        severity: Severity,
        message: impl Into<String>,
        exception: impl Into<String>,
    ) {
        self.emit(ctx, severity, message.into(), Some(exception.into()));
    }

    fn emit(&self, ctx: &LogContext, severity: Severity, message: String, exception: Option<String>) {
        if !self.is_enabled(severity) {
            return;
        }
        self.pipeline.dispatch(LogEvent {
            timestamp: Utc::now(),
            category: self.category.to_string(),
            message,
            severity,
            exception,
            correlation: ctx.stack.correlation(),
            tenant_id: ctx.tenant_id.clone(),
            scopes: ctx.stack.labels(),
        });
    }

    pub fn trace(&self, ctx: &LogContext, message: impl Into<String>) {
        self.log(ctx, Severity::Trace, message);
    }

    pub fn debug(&self, ctx: &LogContext, message: impl Into<String>) {
        self.log(ctx, Severity::Debug, message);
    }

    pub fn info(&self, ctx: &LogContext, message: impl Into<String>) {
        self.log(ctx, Severity::Information, message);
    }

    pub fn warn(&self, ctx: &LogContext, message: impl Into<String>) {
        self.log(ctx, Severity::Warning, message);
    }

    pub fn error(&self, ctx: &LogContext, message: impl Into<String>) {
        self.log(ctx, Severity::Error, message);
    }

    pub fn critical(&self, ctx: &LogContext, message: impl Into<String>) {
        self.log(ctx, Severity::Critical, message);
    }

    /// Pushes `entry` onto `ctx` and notifies every sink.
    pub fn begin_scope(&self, ctx: &mut LogContext, entry: ScopeEntry) {
        ctx.stack.push(entry.clone());
        let correlation = ctx.stack.correlation();
        self.pipeline.scope_changed(
            &ScopeChange {
                context: ctx.id,
                category: &self.category,
                entry: &entry,
                correlation: &correlation,
            },
            true,
        );
    }

    /// Notifies every sink, then pops `entry` and everything after it from
    /// `ctx`. Unknown entries are ignored.
    pub fn end_scope(&self, ctx: &mut LogContext, entry: &ScopeEntry) {
        if !ctx.stack.entries().contains(entry) {
            return;
        }
        let correlation = ctx.stack.correlation();
        self.pipeline.scope_changed(
            &ScopeChange {
                context: ctx.id,
                category: &self.category,
                entry,
                correlation: &correlation,
            },
            false,
        );
        ctx.stack.pop(entry);
    }

    /// Runs `work` inside `entry`.
    pub fn scoped<R>(
        &self,
        ctx: &mut LogContext,
        entry: ScopeEntry,
        work: impl FnOnce(&Logger, &mut LogContext) -> R,
    ) -> R {
        self.begin_scope(ctx, entry.clone());
        let result = work(self, ctx);
        self.end_scope(ctx, &entry);
        result
    }
}
