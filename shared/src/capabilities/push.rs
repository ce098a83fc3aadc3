use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::ListId;

pub const DEFAULT_FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Notice that some item of a list changed on the backend. Carries no row
/// data; receivers refetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSignal {
    pub list_id: ListId,
    pub kind: ChangeKind,
}

impl ChangeSignal {
    pub fn new(list_id: ListId, kind: ChangeKind) -> Self {
        Self { list_id, kind }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("change feed closed")]
    Closed,

    #[error("subscription failed: {reason}")]
    SubscribeFailed { reason: String },
}

/// Source of per-list change notifications (a realtime channel in production).
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, list_id: &ListId) -> Result<broadcast::Receiver<ChangeSignal>, FeedError>;
}

/// In-process hub with one broadcast channel per list.
pub struct LocalChangeFeed {
    channels: Mutex<HashMap<ListId, broadcast::Sender<ChangeSignal>>>,
    capacity: usize,
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl LocalChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns how many subscribers received the signal.
    pub fn publish(&self, signal: ChangeSignal) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        let Some(sender) = channels.get(&signal.list_id) else {
            return 0;
        };
        let delivered = sender.send(signal.clone()).unwrap_or(0);
        debug!(list_id = %signal.list_id, kind = ?signal.kind, delivered, "change published");
        delivered
    }

    pub fn subscriber_count(&self, list_id: &ListId) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(list_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl ChangeFeed for LocalChangeFeed {
    fn subscribe(&self, list_id: &ListId) -> Result<broadcast::Receiver<ChangeSignal>, FeedError> {
        let mut channels = self.channels.lock().map_err(|_| FeedError::SubscribeFailed {
            reason: "feed registry poisoned".to_string(),
        })?;
        let sender = channels
            .entry(list_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }
}
