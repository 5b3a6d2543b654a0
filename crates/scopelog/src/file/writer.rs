// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::SinkError;
use crate::event::{keys, LogEvent, ScopeEntry, SharedEvent};
use crate::file::format::{format_event, sanitize_file_name};
use crate::file::rolling::{LogFile, RollingOptions};
use crate::scope::{fork_name, operation_state, render_transition, ContextId, ScopeStack};
use crate::sink::BatchWriter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::path::PathBuf;
use tokio::task;
use tracing::error;

/// Ordered work item for a file worker.
#[derive(Debug, Clone)]
pub enum FileCommand {
    Event(SharedEvent),
    BeginScope(ContextId, ScopeEntry),
    EndScope(ContextId, ScopeEntry),
}

#[derive(Debug, Clone)]
pub struct FileWriterOptions {
    pub base: PathBuf,
    pub rolling: RollingOptions,
    pub fork_enabled: bool,
    pub include_scopes: bool,
    pub include_categories: bool,
}

/// Pending text and last rendered scope labels of one output file.
#[derive(Debug, Default)]
struct Output {
    rendered: Vec<String>,
    buffer: String,
}

impl Output {
    fn close_markers(&mut self) {
        render_transition(&self.rendered, &[], None, &mut self.buffer);
        self.rendered.clear();
    }
}

/// Scope stack of one caller context as seen by this worker, and the fork
/// that context currently holds.
#[derive(Debug, Default)]
struct Holder {
    stack: ScopeStack,
    fork: Option<String>,
}

/// Fork a context writes to, if any.
fn stack_target(fork_enabled: bool, stack: &ScopeStack) -> Option<String> {
    if !fork_enabled || !stack.contains_key(keys::TRACE_ID) {
        return None;
    }
    stack.fork_name().map(|name| sanitize_file_name(&name))
}

/// Fork an event belongs to, taken from its own correlation.
fn event_target(fork_enabled: bool, event: &LogEvent) -> Option<String> {
    if !fork_enabled || event.trace_id().is_none() {
        return None;
    }
    fork_name(event.trace_id(), event.operation()).map(|name| sanitize_file_name(&name))
}

/// File state owned by a single worker.
///
/// Forks are tracked per caller context: a fork stays open while any context
/// holds it and is restored, with the last state seen for it, when the last
/// holder leaves. Forks opened only by events close at the end of the batch.
struct Router {
    options: FileWriterOptions,
    file: LogFile,
    holders: HashMap<ContextId, Holder>,
    states: HashMap<String, String>,
    outputs: HashMap<Option<String>, Output>,
}

impl Router {
    fn open(options: FileWriterOptions) -> io::Result<Self> {
        let file = LogFile::open(&options.base, options.rolling)?;
        Ok(Self {
            options,
            file,
            holders: HashMap::new(),
            states: HashMap::new(),
            outputs: HashMap::new(),
        })
    }

    /// Applies every command in order. A failing command is logged and the
    /// rest of the batch still runs.
    fn apply(&mut self, batch: Vec<FileCommand>) {
        for command in batch {
            let result = match command {
                FileCommand::Event(event) => {
                    self.append(&event);
                    Ok(())
                }
                FileCommand::BeginScope(context, entry) => self.begin(context, entry),
                FileCommand::EndScope(context, entry) => self.end(context, &entry),
            };
            if let Err(e) = result {
                error!(
                    "FILE_SINK | scope change failed in {}: {}",
                    self.file.base().display(),
                    e
                );
            }
        }
        self.flush();
        self.release_unheld();
    }

    fn append(&mut self, event: &LogEvent) {
        let target = match event_target(self.options.fork_enabled, event) {
            Some(name) => match self.file.fork_to(&name) {
                Ok(()) => {
                    self.note_event_state(&name, event);
                    Some(name)
                }
                Err(e) => {
                    error!("FILE_SINK | failed to fork to {}: {}", name, e);
                    None
                }
            },
            None => None,
        };

        let include_scopes = self.options.include_scopes;
        let category = self
            .options
            .include_categories
            .then_some(event.category.as_str());
        let output = self.outputs.entry(target).or_default();
        let message_only = include_scopes && !event.scopes.is_empty();
        if include_scopes {
            render_transition(&output.rendered, &event.scopes, category, &mut output.buffer);
            output.rendered.clone_from(&event.scopes);
        }
        format_event(event, message_only, &mut output.buffer);
    }

    /// Events only set the state of forks that no context holds.
    fn note_event_state(&mut self, name: &str, event: &LogEvent) {
        if self.is_held(name) {
            return;
        }
        let state = event
            .correlation
            .operation_state
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(state) = state {
            self.states.insert(name.to_string(), state.to_string());
        }
    }

    fn begin(&mut self, context: ContextId, entry: ScopeEntry) -> io::Result<()> {
        let entry_state = operation_state(std::slice::from_ref(&entry));
        let holder = self.holders.entry(context).or_default();
        holder.stack.push(entry);
        let next = stack_target(self.options.fork_enabled, &holder.stack);
        let previous = mem::replace(&mut holder.fork, next.clone());

        if let (Some(name), Some(state)) = (&next, entry_state) {
            self.states.insert(name.clone(), state);
        }
        self.switch(previous, next)
    }

    fn end(&mut self, context: ContextId, entry: &ScopeEntry) -> io::Result<()> {
        let Some(holder) = self.holders.get_mut(&context) else {
            return Ok(());
        };
        if holder.stack.pop(entry).is_none() {
            return Ok(());
        }
        let next = stack_target(self.options.fork_enabled, &holder.stack);
        let previous = mem::replace(&mut holder.fork, next.clone());
        if holder.stack.is_empty() {
            self.holders.remove(&context);
        }
        self.switch(previous, next)
    }

    fn switch(&mut self, previous: Option<String>, next: Option<String>) -> io::Result<()> {
        if previous == next {
            return Ok(());
        }
        let opened = match &next {
            Some(name) => self.file.fork_to(name),
            None => Ok(()),
        };
        let released = match previous {
            Some(name) => self.release(&name),
            None => Ok(()),
        };
        opened.and(released)
    }

    fn is_held(&self, name: &str) -> bool {
        self.holders
            .values()
            .any(|holder| holder.fork.as_deref() == Some(name))
    }

    /// Restores the fork `name` once no context holds it.
    fn release(&mut self, name: &str) -> io::Result<()> {
        if self.is_held(name) || !self.file.is_forked(name) {
            return Ok(());
        }
        let key = Some(name.to_string());
        if self.options.include_scopes {
            if let Some(output) = self.outputs.get_mut(&key) {
                output.close_markers();
            }
        }
        self.flush();
        self.outputs.remove(&key);
        let state = self.states.remove(name);
        self.file.restore(name, state.as_deref()).map(|_| ())
    }

    fn release_unheld(&mut self) {
        for name in self.file.fork_names() {
            if let Err(e) = self.release(&name) {
                error!("FILE_SINK | failed to restore from {}: {}", name, e);
            }
        }
    }

    /// Writes every pending buffer. Failures are logged and the text dropped.
    fn flush(&mut self) {
        for (target, output) in &mut self.outputs {
            if output.buffer.is_empty() {
                continue;
            }
            let text = mem::take(&mut output.buffer);
            let result = match target {
                Some(name) => self.file.write_fork(name, &text),
                None => self.file.write(&text),
            };
            if let Err(e) = result {
                error!(
                    "FILE_SINK | failed to write {} bytes in {}: {}",
                    text.len(),
                    self.file.base().display(),
                    e
                );
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.options.include_scopes {
            for output in self.outputs.values_mut() {
                output.close_markers();
            }
        }
        self.flush();
        self.outputs.clear();
        self.holders.clear();
        let mut failure = None;
        for name in self.file.fork_names() {
            let state = self.states.remove(&name);
            if let Err(e) = self.file.restore(&name, state.as_deref()) {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

/// [`BatchWriter`] for one output directory. Blocking file work runs on the
/// blocking pool.
pub struct FileWriter {
    options: FileWriterOptions,
    router: Option<Router>,
}

impl FileWriter {
    pub fn new(options: FileWriterOptions) -> Self {
        Self {
            options,
            router: None,
        }
    }

    async fn with_router<F>(&mut self, work: F) -> Result<(), SinkError>
    where
        F: FnOnce(&mut Router) -> io::Result<()> + Send + 'static,
    {
        let router = match self.router.take() {
            Some(router) => router,
            None => {
                let options = self.options.clone();
                task::spawn_blocking(move || Router::open(options))
                    .await
                    .map_err(|e| SinkError::Storage(e.to_string()))??
            }
        };
        let (router, result) = task::spawn_blocking(move || {
            let mut router = router;
            let result = work(&mut router);
            (router, result)
        })
        .await
        .map_err(|e| SinkError::Storage(e.to_string()))?;
        self.router = Some(router);
        result.map_err(SinkError::from)
    }
}

#[async_trait]
impl BatchWriter for FileWriter {
    type Item = FileCommand;

    async fn open(&mut self) -> Result<(), SinkError> {
        self.with_router(|_| Ok(())).await
    }

    async fn write_batch(&mut self, batch: Vec<FileCommand>) -> Result<(), SinkError> {
        self.with_router(move |router| {
            router.apply(batch);
            Ok(())
        })
        .await
    }

    async fn close(&mut self) {
        if self.router.is_none() {
            return;
        }
        if let Err(e) = self.with_router(Router::close).await {
            tracing::error!("FILE_SINK | failed to close {}: {}", self.options.base.display(), e);
        }
        // next start opens a fresh general file
        self.router = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn options(base: &Path, include_scopes: bool) -> FileWriterOptions {
        FileWriterOptions {
            base: base.to_path_buf(),
            rolling: RollingOptions {
                max_file_size: 0,
                retain_file_count: 0,
            },
            fork_enabled: true,
            include_scopes,
            include_categories: false,
        }
    }

    /// Builds commands the way a `Logger` does for one context.
    struct Caller {
        id: ContextId,
        stack: ScopeStack,
    }

    impl Caller {
        fn new() -> Self {
            Self {
                id: ContextId::next(),
                stack: ScopeStack::new(),
            }
        }

        fn begin(&mut self, entry: &ScopeEntry) -> FileCommand {
            self.stack.push(entry.clone());
            FileCommand::BeginScope(self.id, entry.clone())
        }

        fn end(&mut self, entry: &ScopeEntry) -> FileCommand {
            self.stack.pop(entry);
            FileCommand::EndScope(self.id, entry.clone())
        }

        fn log(&self, message: &str) -> FileCommand {
            let mut event = LogEvent::new("xUnit", Severity::Information, message)
                .with_correlation(self.stack.correlation());
            event.scopes = self.stack.labels();
            FileCommand::Event(Arc::new(event))
        }
    }

    fn trace_scope(trace: &str) -> ScopeEntry {
        ScopeEntry::properties([(keys::TRACE_ID, trace), (keys::OPERATION, "xUnit")])
    }

    fn state_scope(state: &str) -> ScopeEntry {
        ScopeEntry::properties([(keys::OPERATION_STATE, state)])
    }

    fn all_files(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            for entry in fs::read_dir(d).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push(path);
                }
            }
        }
        out
    }

    fn find(dir: &Path, name: &str) -> Option<PathBuf> {
        all_files(dir)
            .into_iter()
            .find(|p| p.file_name().is_some_and(|n| n == name))
    }

    fn read(dir: &Path, name: &str) -> String {
        fs::read_to_string(find(dir, name).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_trace_scope_forks_and_state_renames() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        writer.open().await.unwrap();

        let mut caller = Caller::new();
        let trace = trace_scope("job-1");
        let state = state_scope("Succeeded");
        let batch = vec![
            caller.log("before"),
            caller.begin(&trace),
            caller.log("inside"),
            caller.begin(&state),
            caller.log("finishing"),
            caller.end(&state),
            caller.end(&trace),
            caller.log("after"),
        ];
        writer.write_batch(batch).await.unwrap();

        let text = read(tmp.path(), "job-1 - xUnit_Succeeded.log");
        assert!(text.contains("inside"));
        assert!(text.contains("finishing"));
        assert!(!text.contains("before"));
        assert!(find(tmp.path(), "job-1 - xUnit.log").is_none());

        writer.close().await;
        let general: Vec<PathBuf> = all_files(tmp.path())
            .into_iter()
            .filter(|p| !p.to_string_lossy().contains("job-1"))
            .collect();
        assert_eq!(general.len(), 1);
        let text = fs::read_to_string(&general[0]).unwrap();
        assert!(text.contains("before"));
        assert!(text.contains("after"));
        assert!(text.contains("Restored from job-1 - xUnit_Succeeded.log"));
        assert!(text.find("before") < text.find("Restored from"));
    }

    #[tokio::test]
    async fn test_trace_scope_without_state_restores_without_rename() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        let mut caller = Caller::new();
        let trace = trace_scope("job-2");
        let batch = vec![
            caller.begin(&trace),
            caller.log("inside"),
            caller.end(&trace),
            caller.log("outside"),
        ];
        writer.write_batch(batch).await.unwrap();

        let text = read(tmp.path(), "job-2 - xUnit.log");
        assert!(text.contains("inside"));
        assert!(!text.contains("outside"));
    }

    #[tokio::test]
    async fn test_fork_stays_open_across_batches() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        let mut caller = Caller::new();
        let trace = trace_scope("job-5");
        let state = state_scope("Failed");

        let first = vec![caller.begin(&trace), caller.log("part one")];
        writer.write_batch(first).await.unwrap();
        assert!(find(tmp.path(), "job-5 - xUnit.log").is_some());

        let second = vec![
            caller.log("part two"),
            caller.begin(&state),
            caller.end(&state),
            caller.end(&trace),
        ];
        writer.write_batch(second).await.unwrap();

        let text = read(tmp.path(), "job-5 - xUnit_Failed.log");
        assert!(text.contains("part one"));
        assert!(text.contains("part two"));
        assert!(find(tmp.path(), "job-5 - xUnit.log").is_none());
    }

    #[tokio::test]
    async fn test_same_sequence_twice_is_disambiguated() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        let mut caller = Caller::new();
        for _ in 0..2 {
            let scope = ScopeEntry::properties([
                (keys::TRACE_ID, "job-3"),
                (keys::OPERATION, "xUnit"),
                (keys::OPERATION_STATE, "Succeeded"),
            ]);
            let batch = vec![caller.begin(&scope), caller.log("work"), caller.end(&scope)];
            writer.write_batch(batch).await.unwrap();
        }
        assert!(find(tmp.path(), "job-3 - xUnit_Succeeded.log").is_some());
        assert!(find(tmp.path(), "job-3 - xUnit_Succeeded (1).log").is_some());
        assert!(find(tmp.path(), "job-3 - xUnit.log").is_none());
    }

    #[tokio::test]
    async fn test_nested_trace_returns_to_outer_fork() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        let mut caller = Caller::new();
        let outer = ScopeEntry::properties([(keys::TRACE_ID, "outer")]);
        let inner = ScopeEntry::properties([(keys::TRACE_ID, "inner")]);
        let batch = vec![
            caller.begin(&outer),
            caller.log("one"),
            caller.begin(&inner),
            caller.log("two"),
            caller.end(&inner),
            caller.log("three"),
            caller.end(&outer),
        ];
        writer.write_batch(batch).await.unwrap();

        let outer_text = read(tmp.path(), "outer.log");
        let inner_text = read(tmp.path(), "inner.log");
        assert!(outer_text.contains("one"));
        assert!(outer_text.contains("three"));
        assert!(inner_text.contains("two"));
        assert!(!inner_text.contains("three"));
    }

    #[tokio::test]
    async fn test_interleaved_contexts_keep_their_own_forks() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        let mut alpha = Caller::new();
        let mut beta = Caller::new();
        let alpha_job = ScopeEntry::properties([(keys::TRACE_ID, "AAAA"), (keys::OPERATION, "Alpha")]);
        let beta_job = ScopeEntry::properties([(keys::TRACE_ID, "BBBB"), (keys::OPERATION, "Beta")]);
        let done = state_scope("Succeeded");

        let batch = vec![
            alpha.begin(&alpha_job),
            beta.begin(&beta_job),
            alpha.log("alpha line"),
            alpha.begin(&done),
            alpha.end(&done),
            alpha.end(&alpha_job),
            beta.log("beta line"),
            beta.end(&beta_job),
        ];
        writer.write_batch(batch).await.unwrap();

        let alpha_text = read(tmp.path(), "AAAA - Alpha_Succeeded.log");
        assert!(alpha_text.contains("alpha line"));
        assert!(!alpha_text.contains("beta line"));

        let beta_text = read(tmp.path(), "BBBB - Beta.log");
        assert!(beta_text.contains("beta line"));
        assert!(!beta_text.contains("alpha line"));
        assert!(find(tmp.path(), "BBBB - Beta_Succeeded.log").is_none());
        assert!(find(tmp.path(), "AAAA - Alpha.log").is_none());
    }

    #[tokio::test]
    async fn test_contexts_sharing_a_trace_share_the_fork() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        let mut first = Caller::new();
        let mut second = Caller::new();
        let job = trace_scope("shared");

        let batch = vec![
            first.begin(&job),
            second.begin(&job),
            first.log("from first"),
            first.end(&job),
            second.log("from second"),
            second.end(&job),
        ];
        writer.write_batch(batch).await.unwrap();

        let text = read(tmp.path(), "shared - xUnit.log");
        assert!(text.contains("from first"));
        assert!(text.contains("from second"));
    }

    #[tokio::test]
    async fn test_failed_restore_does_not_stop_the_batch() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        let mut caller = Caller::new();
        let broken = ScopeEntry::properties([
            (keys::TRACE_ID, "job-6"),
            (keys::OPERATION, "xUnit"),
            (keys::OPERATION_STATE, "Succeeded"),
        ]);
        let next = trace_scope("job-7");

        let first = vec![caller.begin(&broken), caller.log("inside")];
        writer.write_batch(first).await.unwrap();
        fs::remove_file(find(tmp.path(), "job-6 - xUnit.log").unwrap()).unwrap();

        let second = vec![
            caller.end(&broken),
            caller.begin(&next),
            caller.log("next job"),
            caller.end(&next),
            caller.log("after"),
        ];
        writer.write_batch(second).await.unwrap();

        let text = read(tmp.path(), "job-7 - xUnit.log");
        assert!(text.contains("next job"));
        assert!(!text.contains("after"));
    }

    #[tokio::test]
    async fn test_fork_disabled_keeps_single_file() {
        let tmp = TempDir::new().unwrap();
        let mut opts = options(tmp.path(), false);
        opts.fork_enabled = false;
        let mut writer = FileWriter::new(opts);
        let mut caller = Caller::new();
        let trace = trace_scope("job-4");
        let batch = vec![caller.begin(&trace), caller.log("inside"), caller.end(&trace)];
        writer.write_batch(batch).await.unwrap();
        assert_eq!(all_files(tmp.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_scope_markers_and_closing_markers() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), true));
        let mut caller = Caller::new();
        let request = ScopeEntry::label("request 7");
        let batch = vec![caller.begin(&request), caller.log("handled")];
        writer.write_batch(batch).await.unwrap();
        writer.close().await;

        let files = all_files(tmp.path());
        assert_eq!(files.len(), 1);
        let text = fs::read_to_string(&files[0]).unwrap();
        assert!(text.contains("---- Begin: request 7\n"));
        assert!(text.contains("INF: handled\n"));
        assert!(!text.contains("xUnit"));
        assert!(text.ends_with("----   End: request 7\n\n"));
    }

    #[tokio::test]
    async fn test_unknown_end_scope_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut writer = FileWriter::new(options(tmp.path(), false));
        let caller = Caller::new();
        let batch = vec![
            FileCommand::EndScope(caller.id, ScopeEntry::label("never opened")),
            caller.log("still written"),
        ];
        writer.write_batch(batch).await.unwrap();
        let files = all_files(tmp.path());
        let text = fs::read_to_string(&files[0]).unwrap();
        assert!(text.contains("xUnit\nstill written\n"));
    }
}
