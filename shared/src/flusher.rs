use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{Backend, LocalStore};
use crate::connectivity::ConnectivityMonitor;
use crate::outbox::ActionQueue;

const COMPLETION_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub replayed: usize,
    pub retained: usize,
    /// Retained actions whose failure was a rejection. They stay queued
    /// until the queue is cleared.
    pub rejected: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    AlreadyRunning,
    Completed(FlushReport),
    StorageUnavailable,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the action queue in order, one action at a time. At most one
/// drain runs per flusher; overlapping triggers return `AlreadyRunning`.
pub struct QueueFlusher<S: LocalStore> {
    backend: Arc<dyn Backend>,
    queue: Arc<ActionQueue<S>>,
    monitor: Arc<ConnectivityMonitor>,
    in_flight: AtomicBool,
    completions: broadcast::Sender<FlushReport>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: LocalStore + 'static> QueueFlusher<S> {
    pub fn new(
        backend: Arc<dyn Backend>,
        queue: Arc<ActionQueue<S>>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            backend,
            queue,
            monitor,
            in_flight: AtomicBool::new(false),
            completions: broadcast::channel(COMPLETION_CAPACITY).0,
            watcher: Mutex::new(None),
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Reports of flushes that replayed at least one action.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<FlushReport> {
        self.completions.subscribe()
    }

    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushOutcome {
        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            debug!("flush already in progress");
            return FlushOutcome::AlreadyRunning;
        };

        let snapshot = match self.queue.read_all().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "cannot read action queue");
                return FlushOutcome::StorageUnavailable;
            }
        };
        if snapshot.is_empty() {
            return FlushOutcome::Empty;
        }

        let mut report = FlushReport::default();
        let mut retained = Vec::new();
        for action in &snapshot {
            match action.replay(self.backend.as_ref()).await {
                Ok(()) => report.replayed += 1,
                Err(e) => {
                    if e.is_network() {
                        self.monitor.force_offline();
                    } else {
                        report.rejected += 1;
                    }
                    warn!(action_id = %action.id(), error = %e, "replay failed, keeping action");
                    retained.push(action.clone());
                }
            }
        }
        report.retained = retained.len();

        if let Err(e) = self.queue.settle_flush(&snapshot, retained).await {
            error!(error = %e, replayed = report.replayed, "cannot settle flush; replayed actions stay queued");
            return FlushOutcome::StorageUnavailable;
        }

        info!(
            replayed = report.replayed,
            retained = report.retained,
            rejected = report.rejected,
            "flush completed"
        );
        if report.replayed > 0 {
            let _ = self.completions.send(report);
        }
        FlushOutcome::Completed(report)
    }

    /// Flushes now if online, then on every transition into Online.
    pub fn start(self: &Arc<Self>) {
        let mut watcher = lock(&self.watcher);
        if watcher.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }

        let mut transitions = self.monitor.subscribe();
        let flusher = Arc::downgrade(self);
        *watcher = Some(tokio::spawn(async move {
            let mut online = transitions.borrow_and_update().state.is_online();
            loop {
                if online {
                    let Some(flusher) = flusher.upgrade() else {
                        break;
                    };
                    flusher.flush().await;
                }
                if transitions.changed().await.is_err() {
                    break;
                }
                online = transitions.borrow_and_update().state.is_online();
            }
        }));
        info!("queue flusher watching connectivity");
    }

    pub fn stop(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
            info!("queue flusher stopped");
        }
    }
}

impl<S: LocalStore> Drop for QueueFlusher<S> {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
