use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::capabilities::{Backend, BackendError, LocalStore};
use crate::connectivity::ConnectivityMonitor;
use crate::outbox::{ActionQueue, OutboxError, QueuedAction};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum QueueReason {
    /// The monitor already believed the device was offline.
    KnownOffline,
    /// The backend call failed on the network.
    NetworkFailure,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    /// The backend confirmed the write.
    Applied,
    /// The write is waiting in the action queue.
    Queued { reason: QueueReason, pending: usize },
    /// The write could not be confirmed and local storage refused it.
    Lost { error: OutboxError },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("backend rejected the write: {0}")]
    Rejected(BackendError),
}

/// Tries a write now, falling back to the action queue when the device is
/// offline or the attempt fails on the network. Rejections are returned to
/// the caller and never queued.
pub struct QueueDispatcher<S: LocalStore> {
    backend: Arc<dyn Backend>,
    queue: Arc<ActionQueue<S>>,
    monitor: Arc<ConnectivityMonitor>,
}

impl<S: LocalStore> QueueDispatcher<S> {
    pub fn new(
        backend: Arc<dyn Backend>,
        queue: Arc<ActionQueue<S>>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            backend,
            queue,
            monitor,
        }
    }

    #[instrument(skip(self, action), fields(action_id = %action.id(), table = action.target(), op = ?action.operation()))]
    pub async fn dispatch(&self, action: QueuedAction) -> Result<DispatchOutcome, DispatchError> {
        if !self.monitor.is_online() {
            return Ok(self.enqueue(action, QueueReason::KnownOffline).await);
        }

        match action.replay(self.backend.as_ref()).await {
            Ok(()) => Ok(DispatchOutcome::Applied),
            Err(e) if e.is_network() => {
                warn!(error = %e, "write failed on the network, going offline");
                self.monitor.force_offline();
                Ok(self.enqueue(action, QueueReason::NetworkFailure).await)
            }
            Err(e) => {
                warn!(error = %e, "write rejected by backend");
                Err(DispatchError::Rejected(e))
            }
        }
    }

    async fn enqueue(&self, action: QueuedAction, reason: QueueReason) -> DispatchOutcome {
        match self.queue.append(action).await {
            Ok(pending) => {
                info!(?reason, pending, "action queued");
                DispatchOutcome::Queued { reason, pending }
            }
            Err(error) => {
                error!(%error, "action lost: local storage refused it");
                DispatchOutcome::Lost { error }
            }
        }
    }
}
