// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::SinkError;
use crate::sink::{SinkStatus, Worker, DEFAULT_SHUTDOWN_GRACE};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Backend half of a [`BufferedSink`]. Only ever driven by the sink's worker.
#[async_trait]
pub trait BatchWriter: Send + 'static {
    type Item: Send + 'static;

    /// Acquires the backend resource. Called once each time the worker starts.
    async fn open(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn write_batch(&mut self, batch: Vec<Self::Item>) -> Result<(), SinkError>;

    /// Called after the final flush when the worker stops.
    async fn close(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct BufferedSinkConfig {
    pub name: String,
    pub buffer_time: Duration,
    /// Pending item count that wakes the worker before `buffer_time` elapses.
    pub max_batch_items: usize,
}

impl BufferedSinkConfig {
    pub fn new(name: impl Into<String>, buffer_time: Duration) -> Self {
        Self {
            name: name.into(),
            buffer_time,
            max_batch_items: 10_000,
        }
    }

    pub fn with_max_batch_items(mut self, max_batch_items: usize) -> Self {
        self.max_batch_items = max_batch_items.max(1);
        self
    }
}

struct Shared<W: BatchWriter> {
    writer: Mutex<W>,
    rx: Mutex<mpsc::UnboundedReceiver<W::Item>>,
    wake: Notify,
    pending: AtomicUsize,
    accepting: AtomicBool,
    /// Also set by the worker when the writer fails to open.
    disabled: AtomicBool,
}

/// Queue plus one background worker writing batches through a [`BatchWriter`].
///
/// `enqueue` never blocks. Failed batches are logged and dropped.
pub struct BufferedSink<W: BatchWriter> {
    config: BufferedSinkConfig,
    tx: mpsc::UnboundedSender<W::Item>,
    shared: Arc<Shared<W>>,
    worker: Worker,
}

impl<W: BatchWriter> BufferedSink<W> {
    pub fn new(config: BufferedSinkConfig, writer: W) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(config.name.clone());
        Self {
            config,
            tx,
            shared: Arc::new(Shared {
                writer: Mutex::new(writer),
                rx: Mutex::new(rx),
                wake: Notify::new(),
                pending: AtomicUsize::new(0),
                accepting: AtomicBool::new(false),
                disabled: AtomicBool::new(false),
            }),
            worker,
        }
    }

    /// Creates a sink that stays disabled until `set_disabled(false)`.
    pub fn new_disabled(config: BufferedSinkConfig, writer: W) -> Self {
        let sink = Self::new(config, writer);
        sink.shared.disabled.store(true, Ordering::Relaxed);
        sink
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SinkStatus {
        self.worker.status()
    }

    pub fn start(&self) -> Result<(), SinkError> {
        let runtime = Handle::try_current().map_err(|_| SinkError::NoRuntime)?;
        self.start_on(&runtime);
        Ok(())
    }

    /// Launches the worker on `runtime`. Does nothing when disabled or already
    /// running.
    pub fn start_on(&self, runtime: &Handle) {
        if self.is_disabled() {
            debug!("{} | sink is disabled, not starting", self.config.name);
            return;
        }
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        shared.accepting.store(true, Ordering::Release);
        let launched = self
            .worker
            .launch(runtime, move |cancel| run(shared, config, cancel));
        if launched {
            debug!("{} | sink started", self.config.name);
        }
    }

    /// Appends `item` to the queue. Dropped when the sink is not accepting.
    pub fn enqueue(&self, item: W::Item) {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return;
        }
        let pending = self.shared.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(item).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        if pending >= self.config.max_batch_items {
            self.shared.wake.notify_one();
        }
    }

    /// Asks the worker to flush without waiting for the buffer interval.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    pub async fn stop(&self, grace: Duration) {
        self.shared.accepting.store(false, Ordering::Release);
        if !self.worker.shutdown(grace).await {
            error!(
                "{} | shutdown timed out, pending items may be lost",
                self.config.name
            );
        }
    }

    pub async fn set_disabled(&self, disabled: bool) -> Result<(), SinkError> {
        let was = self.shared.disabled.swap(disabled, Ordering::Relaxed);
        if was == disabled {
            return Ok(());
        }
        if disabled {
            debug!("{} | disabling sink", self.config.name);
            self.stop(DEFAULT_SHUTDOWN_GRACE).await;
            Ok(())
        } else {
            debug!("{} | enabling sink", self.config.name);
            self.start()
        }
    }
}

async fn run<W: BatchWriter>(
    shared: Arc<Shared<W>>,
    config: BufferedSinkConfig,
    cancel: CancellationToken,
) {
    if let Err(e) = shared.writer.lock().await.open().await {
        error!("{} | failed to open sink, disabling it: {}", config.name, e);
        shared.accepting.store(false, Ordering::Release);
        shared.disabled.store(true, Ordering::Relaxed);
        return;
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = shared.wake.notified() => {}
            () = tokio::time::sleep(config.buffer_time) => {}
        }
        flush(&shared, &config.name).await;
    }

    flush(&shared, &config.name).await;
    shared.writer.lock().await.close().await;
    debug!("{} | sink worker stopped", config.name);
}

async fn flush<W: BatchWriter>(shared: &Shared<W>, name: &str) {
    let batch: Vec<W::Item> = {
        let mut rx = shared.rx.lock().await;
        let mut batch = Vec::new();
        while let Ok(item) = rx.try_recv() {
            batch.push(item);
        }
        batch
    };
    if batch.is_empty() {
        return;
    }
    shared.pending.fetch_sub(batch.len(), Ordering::AcqRel);

    let count = batch.len();
    let started = Instant::now();
    let mut writer = shared.writer.lock().await;
    match writer.write_batch(batch).await {
        Ok(()) => debug!(
            "{} | flushed {} items in {}ms",
            name,
            count,
            started.elapsed().as_millis()
        ),
        Err(e) => error!("{} | failed to write batch of {} items, dropping it: {}", name, count, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default, Clone)]
    struct Recorder {
        batches: Arc<StdMutex<Vec<Vec<u32>>>>,
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        fail_open: Arc<AtomicBool>,
        fail_writes: bool,
    }

    impl Recorder {
        fn items(&self) -> Vec<u32> {
            self.batches.lock().unwrap().iter().flatten().copied().collect()
        }

        fn batch_count(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BatchWriter for Recorder {
        type Item = u32;

        async fn open(&mut self) -> Result<(), SinkError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(SinkError::InvalidConfig("cannot open".to_string()));
            }
            Ok(())
        }

        async fn write_batch(&mut self, batch: Vec<u32>) -> Result<(), SinkError> {
            if self.fail_writes {
                return Err(SinkError::Transport("backend down".to_string()));
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(buffer_ms: u64) -> BufferedSinkConfig {
        BufferedSinkConfig::new("TEST_SINK", Duration::from_millis(buffer_ms))
    }

    #[tokio::test]
    async fn test_flushes_on_interval_in_order() {
        let recorder = Recorder::default();
        let sink = BufferedSink::new(config(50), recorder.clone());
        sink.start().unwrap();
        assert_eq!(sink.status(), SinkStatus::Running);

        for i in 0..5 {
            sink.enqueue(i);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(recorder.items(), vec![0, 1, 2, 3, 4]);
        sink.stop(Duration::from_secs(1)).await;
        assert_eq!(sink.status(), SinkStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_performs_final_flush() {
        let recorder = Recorder::default();
        let sink = BufferedSink::new(config(60_000), recorder.clone());
        sink.start().unwrap();
        sink.enqueue(7);
        sink.enqueue(8);

        sink.stop(Duration::from_secs(1)).await;

        assert_eq!(recorder.items(), vec![7, 8]);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_batch_items_wakes_worker_early() {
        let recorder = Recorder::default();
        let sink = BufferedSink::new(config(60_000).with_max_batch_items(3), recorder.clone());
        sink.start().unwrap();
        sink.enqueue(1);
        sink.enqueue(2);
        sink.enqueue(3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.items(), vec![1, 2, 3]);
        sink.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_items_before_start_are_dropped() {
        let recorder = Recorder::default();
        let sink = BufferedSink::new(config(10), recorder.clone());
        sink.enqueue(1);
        sink.start().unwrap();
        sink.stop(Duration::from_secs(1)).await;
        assert!(recorder.items().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_and_sink_keeps_running() {
        let recorder = Recorder {
            fail_writes: true,
            ..Recorder::default()
        };
        let sink = BufferedSink::new(config(20), recorder.clone());
        sink.start().unwrap();
        sink.enqueue(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.status(), SinkStatus::Running);
        sink.stop(Duration::from_secs(1)).await;

        assert_eq!(recorder.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_disables_sink() {
        let recorder = Recorder {
            fail_open: Arc::new(AtomicBool::new(true)),
            ..Recorder::default()
        };
        let sink = BufferedSink::new(config(20), recorder.clone());
        sink.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        sink.enqueue(1);
        assert_eq!(sink.status(), SinkStatus::Stopped);
        assert!(sink.is_disabled());
        assert!(recorder.items().is_empty());
    }

    #[tokio::test]
    async fn test_enabling_after_open_failure_reopens_writer() {
        let recorder = Recorder {
            fail_open: Arc::new(AtomicBool::new(true)),
            ..Recorder::default()
        };
        let sink = BufferedSink::new(config(20), recorder.clone());
        sink.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.is_disabled());

        recorder.fail_open.store(false, Ordering::SeqCst);
        sink.set_disabled(false).await.unwrap();
        assert!(!sink.is_disabled());
        assert_eq!(sink.status(), SinkStatus::Running);
        sink.enqueue(3);
        sink.stop(Duration::from_secs(1)).await;

        assert_eq!(recorder.items(), vec![3]);
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_toggle_disabled_restarts_worker() {
        let recorder = Recorder::default();
        let sink = BufferedSink::new(config(20), recorder.clone());
        sink.start().unwrap();

        sink.set_disabled(true).await.unwrap();
        assert_eq!(sink.status(), SinkStatus::Stopped);
        sink.enqueue(1);

        sink.set_disabled(false).await.unwrap();
        assert_eq!(sink.status(), SinkStatus::Running);
        sink.enqueue(2);
        sink.stop(Duration::from_secs(1)).await;

        assert_eq!(recorder.items(), vec![2]);
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_new_disabled_never_starts() {
        let recorder = Recorder::default();
        let sink = BufferedSink::new_disabled(config(10), recorder.clone());
        sink.start().unwrap();
        sink.enqueue(1);
        assert_eq!(sink.status(), SinkStatus::Stopped);
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let sink = BufferedSink::new(config(10), Recorder::default());
        assert!(matches!(sink.start(), Err(SinkError::NoRuntime)));
    }
}
