//! Asynchronous delivery channel
//!
//! Producers (request handlers, the leveled API) push records into a bounded
//! FIFO queue and return immediately. One dedicated OS thread drains the
//! queue and is the only caller of the [`Notifier`], so the notifier needs no
//! locking and every blocking network call happens off the request path.
//!
//! A failed or panicking delivery is logged and counted; the worker moves on
//! to the next record. When the queue is full new records are dropped.
//! [`DeliveryChannel::shutdown`] closes the queue, lets the worker deliver
//! everything already queued, and joins it.

use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::MAX_QUEUE_CAPACITY;
use crate::error::ReportError;
use crate::record::DiagnosticRecord;

const WORKER_THREAD_NAME: &str = "graylog-delivery";

/// Sends records to the logging backend; owned by the delivery worker
pub trait Notifier: Send + 'static {
    fn notify(&mut self, record: &DiagnosticRecord) -> Result<(), ReportError>;
}

impl<F> Notifier for F
where
    F: FnMut(&DiagnosticRecord) -> Result<(), ReportError> + Send + 'static,
{
    fn notify(&mut self, record: &DiagnosticRecord) -> Result<(), ReportError> {
        self(record)
    }
}

/// Builds the notifier on the worker thread
pub type NotifierFactory = Box<dyn FnOnce() -> Result<Box<dyn Notifier>, ReportError> + Send>;

/// Lock-free delivery counters
#[derive(Debug, Default)]
pub struct DeliveryStats {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl StatsSnapshot {
    /// Records accepted but not yet handed to the notifier
    pub fn pending(&self) -> u64 {
        self.submitted.saturating_sub(self.delivered + self.failed)
    }
}

impl DeliveryStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Acquire),
            delivered: self.delivered.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
        }
    }
}

enum WorkerState {
    Idle {
        receiver: mpsc::Receiver<DiagnosticRecord>,
        factory: NotifierFactory,
    },
    Running(JoinHandle<()>),
    Stopped,
}

/// Single-worker FIFO between report producers and the notifier
pub struct DeliveryChannel {
    sender: Mutex<Option<mpsc::Sender<DiagnosticRecord>>>,
    worker: Mutex<WorkerState>,
    started: AtomicBool,
    stats: Arc<DeliveryStats>,
}

impl std::fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("running", &self.is_running())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl DeliveryChannel {
    /// Channel whose worker starts on the first `submit`
    ///
    /// `factory` runs on the worker thread, so notifiers that must not be
    /// created inside an async runtime are safe to build there. `capacity`
    /// is clamped to `1..=MAX_QUEUE_CAPACITY`.
    pub fn lazy<F>(factory: F, capacity: usize) -> Self
    where
        F: FnOnce() -> Result<Box<dyn Notifier>, ReportError> + Send + 'static,
    {
        let bounded = capacity.clamp(1, MAX_QUEUE_CAPACITY);
        if bounded != capacity {
            tracing::warn!(requested = capacity, used = bounded, "queue capacity out of range, clamped");
        }
        let (sender, receiver) = mpsc::channel(bounded);
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(WorkerState::Idle {
                receiver,
                factory: Box::new(factory),
            }),
            started: AtomicBool::new(false),
            stats: Arc::new(DeliveryStats::default()),
        }
    }

    /// Channel with its worker already running
    pub fn start<N: Notifier>(notifier: N, capacity: usize) -> Result<Self, ReportError> {
        let channel = Self::lazy(move || Ok(Box::new(notifier) as Box<dyn Notifier>), capacity);
        channel.ensure_started()?;
        Ok(channel)
    }

    /// Queue a record for delivery; never waits for the backend
    pub fn submit(&self, record: DiagnosticRecord) -> Result<(), ReportError> {
        self.ensure_started()?;

        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(ReportError::ChannelClosed);
        };

        self.stats.submitted.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(record)) => {
                self.stats.submitted.fetch_sub(1, Ordering::AcqRel);
                self.stats.dropped.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(
                    short_message = %record.short_message,
                    "delivery queue full, dropping diagnostic record"
                );
                Err(ReportError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.submitted.fetch_sub(1, Ordering::AcqRel);
                Err(ReportError::ChannelClosed)
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.worker.lock(), WorkerState::Running(_))
    }

    /// Block until every accepted record has been handed to the notifier
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.stats.snapshot().pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Close the queue, deliver what is already queued and join the worker
    ///
    /// Blocks the calling thread until the worker exits. Later submissions
    /// fail with [`ReportError::ChannelClosed`]. Calling it again is a no-op.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let state = std::mem::replace(&mut *self.worker.lock(), WorkerState::Stopped);
        if let WorkerState::Running(handle) = state {
            if handle.join().is_err() {
                tracing::error!("delivery worker panicked during shutdown");
            }
        }
    }

    fn ensure_started(&self) -> Result<(), ReportError> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut worker = self.worker.lock();
        match std::mem::replace(&mut *worker, WorkerState::Stopped) {
            WorkerState::Idle { receiver, factory } => {
                let stats = Arc::clone(&self.stats);
                let spawned = std::thread::Builder::new()
                    .name(WORKER_THREAD_NAME.to_string())
                    .spawn(move || run_worker(receiver, factory, stats));
                match spawned {
                    Ok(handle) => {
                        *worker = WorkerState::Running(handle);
                        self.started.store(true, Ordering::Release);
                        tracing::debug!("delivery worker started");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "could not spawn delivery worker");
                        Err(ReportError::delivery("could not spawn delivery worker", Some(Box::new(e))))
                    }
                }
            }
            running @ WorkerState::Running(_) => {
                *worker = running;
                self.started.store(true, Ordering::Release);
                Ok(())
            }
            WorkerState::Stopped => Err(ReportError::ChannelClosed),
        }
    }
}

fn run_worker(
    mut receiver: mpsc::Receiver<DiagnosticRecord>,
    factory: NotifierFactory,
    stats: Arc<DeliveryStats>,
) {
    let mut notifier = match factory() {
        Ok(notifier) => Some(notifier),
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "could not create notifier, records will be discarded");
            None
        }
    };

    while let Some(record) = receiver.blocking_recv() {
        let result = match notifier.as_mut() {
            Some(notifier) => catch_unwind(AssertUnwindSafe(|| notifier.notify(&record)))
                .unwrap_or_else(|_| Err(ReportError::delivery("notifier panicked", None))),
            None => Err(ReportError::delivery("no notifier available", None)),
        };

        match result {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::AcqRel);
                tracing::error!(
                    kind = e.kind(),
                    error = %e,
                    short_message = %record.short_message,
                    "could not deliver diagnostic record"
                );
            }
        }
    }

    tracing::debug!("delivery worker stopped");
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    /// Keeps every delivered record
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub records: Arc<Mutex<Vec<DiagnosticRecord>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&mut self, record: &DiagnosticRecord) -> Result<(), ReportError> {
            self.records.lock().push(record.clone());
            Ok(())
        }
    }

    /// Rejects every record
    pub struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn notify(&mut self, _record: &DiagnosticRecord) -> Result<(), ReportError> {
            Err(ReportError::SendFailed(reqwest::StatusCode::SERVICE_UNAVAILABLE))
        }
    }

    /// Signals when a delivery begins, then waits for a release per record
    pub struct BlockingNotifier {
        pub started: std_mpsc::Sender<String>,
        pub release: std_mpsc::Receiver<()>,
        pub inner: RecordingNotifier,
    }

    impl BlockingNotifier {
        pub fn new() -> (Self, std_mpsc::Receiver<String>, std_mpsc::Sender<()>, RecordingNotifier) {
            let (started_tx, started_rx) = std_mpsc::channel();
            let (release_tx, release_rx) = std_mpsc::channel();
            let inner = RecordingNotifier::default();
            let notifier = Self {
                started: started_tx,
                release: release_rx,
                inner: inner.clone(),
            };
            (notifier, started_rx, release_tx, inner)
        }
    }

    impl Notifier for BlockingNotifier {
        fn notify(&mut self, record: &DiagnosticRecord) -> Result<(), ReportError> {
            let _ = self.started.send(record.short_message.clone());
            self.release
                .recv()
                .map_err(|_| ReportError::delivery("released channel closed", None))?;
            self.inner.notify(record)
        }
    }
}
