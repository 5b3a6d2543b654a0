// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::sink::SinkStatus;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

struct Inner {
    status: SinkStatus,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Owns the single background task of a sink and its status transitions.
pub struct Worker {
    name: String,
    inner: Mutex<Inner>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                status: SinkStatus::Stopped,
                cancel: None,
                task: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `run` unless a task is already running. Returns whether a task
    /// was launched.
    pub fn launch<F, Fut>(&self, runtime: &Handle, run: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.task.as_ref().is_some_and(JoinHandle::is_finished) {
            inner.task = None;
            inner.cancel = None;
            inner.status = SinkStatus::Stopped;
        }
        if inner.status != SinkStatus::Stopped {
            debug!("{} | worker already {}", self.name, inner.status);
            return false;
        }
        let cancel = CancellationToken::new();
        inner.task = Some(runtime.spawn(run(cancel.clone())));
        inner.cancel = Some(cancel);
        inner.status = SinkStatus::Running;
        true
    }

    /// Cancels the task and waits up to `grace` for it to finish.
    ///
    /// Returns `false` when the task had to be abandoned.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let (cancel, task) = {
            let mut inner = self.lock();
            if inner.status != SinkStatus::Running {
                return true;
            }
            inner.status = SinkStatus::Draining;
            (inner.cancel.take(), inner.task.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let drained = match task {
            Some(task) => match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!("{} | worker terminated abnormally: {}", self.name, e);
                    true
                }
                Err(_) => {
                    warn!(
                        "{} | worker did not drain within {:?}, abandoning it",
                        self.name, grace
                    );
                    false
                }
            },
            None => true,
        };

        self.lock().status = SinkStatus::Stopped;
        drained
    }

    pub fn status(&self) -> SinkStatus {
        let inner = self.lock();
        match (&inner.status, &inner.task) {
            (SinkStatus::Running, Some(task)) if task.is_finished() => SinkStatus::Stopped,
            (status, _) => *status,
        }
    }
}
