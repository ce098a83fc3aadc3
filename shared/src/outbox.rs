use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::capabilities::{Backend, BackendError, KvError, LocalStore, MatchCriteria, Row, StoreKey};
use crate::model::{ActionId, UnixTimeMs};

pub const MAX_TARGET_LENGTH: usize = 63;
pub const QUARANTINE_SUFFIX: &str = "quarantine";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboxError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("failed to encode queue: {0}")]
    Encode(String),
}

// ============================================================================
// Queued Action
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// What an action does to the backend. Each operation carries exactly the
/// parts it needs, so an Update without criteria cannot be built.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Insert { payload: Row },
    Update { payload: Row, criteria: MatchCriteria },
    Delete { criteria: MatchCriteria },
}

impl Mutation {
    pub fn operation(&self) -> Operation {
        match self {
            Mutation::Insert { .. } => Operation::Insert,
            Mutation::Update { .. } => Operation::Update,
            Mutation::Delete { .. } => Operation::Delete,
        }
    }
}

/// One pending write. Immutable once built: there are no setters and the
/// stored form is replayed exactly as captured.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredAction", into = "StoredAction")]
pub struct QueuedAction {
    id: ActionId,
    target: String,
    mutation: Mutation,
    queued_at: UnixTimeMs,
}

impl QueuedAction {
    pub fn insert(target: impl Into<String>, payload: Row) -> Result<Self, OutboxError> {
        Self::build(target.into(), Mutation::Insert { payload })
    }

    pub fn update(
        target: impl Into<String>,
        payload: Row,
        criteria: MatchCriteria,
    ) -> Result<Self, OutboxError> {
        Self::build(target.into(), Mutation::Update { payload, criteria })
    }

    pub fn delete(target: impl Into<String>, criteria: MatchCriteria) -> Result<Self, OutboxError> {
        Self::build(target.into(), Mutation::Delete { criteria })
    }

    fn build(target: String, mutation: Mutation) -> Result<Self, OutboxError> {
        let action = Self {
            id: ActionId::generate(),
            target,
            mutation,
            queued_at: UnixTimeMs::now(),
        };
        action.validate()?;
        Ok(action)
    }

    fn validate(&self) -> Result<(), OutboxError> {
        validate_target(&self.target)?;
        match &self.mutation {
            Mutation::Insert { payload } => require_non_empty("payload", payload),
            Mutation::Update { payload, criteria } => {
                require_non_empty("payload", payload)?;
                require_non_empty("match criteria", criteria)
            }
            Mutation::Delete { criteria } => require_non_empty("match criteria", criteria),
        }
    }

    pub fn id(&self) -> &ActionId {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn operation(&self) -> Operation {
        self.mutation.operation()
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn payload(&self) -> Option<&Row> {
        match &self.mutation {
            Mutation::Insert { payload } | Mutation::Update { payload, .. } => Some(payload),
            Mutation::Delete { .. } => None,
        }
    }

    pub fn criteria(&self) -> Option<&MatchCriteria> {
        match &self.mutation {
            Mutation::Update { criteria, .. } | Mutation::Delete { criteria } => Some(criteria),
            Mutation::Insert { .. } => None,
        }
    }

    pub fn queued_at(&self) -> UnixTimeMs {
        self.queued_at
    }

    /// Issues this action against the backend exactly as captured.
    pub async fn replay<B: Backend + ?Sized>(&self, backend: &B) -> Result<(), BackendError> {
        match &self.mutation {
            Mutation::Insert { payload } => backend.insert(&self.target, payload).await,
            Mutation::Update { payload, criteria } => {
                backend.update(&self.target, payload, criteria).await
            }
            Mutation::Delete { criteria } => backend.delete(&self.target, criteria).await,
        }
    }
}

fn validate_target(target: &str) -> Result<(), OutboxError> {
    if target.is_empty() || target.len() > MAX_TARGET_LENGTH {
        return Err(OutboxError::Validation(format!(
            "target must be 1..={MAX_TARGET_LENGTH} characters"
        )));
    }
    if !target.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(OutboxError::Validation(format!(
            "target '{}' may only contain ASCII letters, digits and '_'",
            target.escape_default()
        )));
    }
    Ok(())
}

fn require_non_empty(what: &str, map: &serde_json::Map<String, Value>) -> Result<(), OutboxError> {
    if map.is_empty() {
        return Err(OutboxError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

/// Stored layout: `{"id","table","type","data"?,"match"?,"queued_at"}`.
#[derive(Clone, Serialize, Deserialize)]
struct StoredAction {
    #[serde(default = "ActionId::generate")]
    id: ActionId,
    table: String,
    #[serde(rename = "type")]
    operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Row>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    criteria: Option<MatchCriteria>,
    #[serde(default)]
    queued_at: UnixTimeMs,
}

impl TryFrom<StoredAction> for QueuedAction {
    type Error = OutboxError;

    fn try_from(stored: StoredAction) -> Result<Self, Self::Error> {
        let mutation = match (stored.operation, stored.data, stored.criteria) {
            (Operation::Insert, Some(payload), None) => Mutation::Insert { payload },
            (Operation::Update, Some(payload), Some(criteria)) => {
                Mutation::Update { payload, criteria }
            }
            (Operation::Delete, None, Some(criteria)) => Mutation::Delete { criteria },
            (operation, data, criteria) => {
                return Err(OutboxError::Validation(format!(
                    "{operation:?} action has data: {}, match: {}",
                    data.is_some(),
                    criteria.is_some()
                )))
            }
        };
        let action = Self {
            id: stored.id,
            target: stored.table,
            mutation,
            queued_at: stored.queued_at,
        };
        action.validate()?;
        Ok(action)
    }
}

impl From<QueuedAction> for StoredAction {
    fn from(action: QueuedAction) -> Self {
        let operation = action.operation();
        let (data, criteria) = match action.mutation {
            Mutation::Insert { payload } => (Some(payload), None),
            Mutation::Update { payload, criteria } => (Some(payload), Some(criteria)),
            Mutation::Delete { criteria } => (None, Some(criteria)),
        };
        Self {
            id: action.id,
            table: action.target,
            operation,
            data,
            criteria,
            queued_at: action.queued_at,
        }
    }
}

// ============================================================================
// Persistent Action Queue
// ============================================================================

/// Durable FIFO of pending writes, stored as one JSON array under a single
/// key. The store is the source of truth; every mutation is a serialized
/// read-modify-write under the queue's mutex.
pub struct ActionQueue<S: LocalStore> {
    store: Arc<S>,
    key: StoreKey,
    quarantine_key: StoreKey,
    lock: Mutex<()>,
}

impl<S: LocalStore> ActionQueue<S> {
    /// Loads the stored queue, moving undecodable entries aside.
    #[instrument(skip(store, key), fields(key = %key.raw()))]
    pub async fn open(store: Arc<S>, key: StoreKey) -> Result<Self, OutboxError> {
        let quarantine_key = key.with_suffix(QUARANTINE_SUFFIX)?;
        let queue = Self {
            store,
            key,
            quarantine_key,
            lock: Mutex::new(()),
        };

        let actions = {
            let _guard = queue.lock.lock().await;
            queue.load().await?
        };
        info!(pending = actions.len(), "action queue opened");
        Ok(queue)
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    #[instrument(skip(self, action), fields(action_id = %action.id(), table = action.target()))]
    pub async fn append(&self, action: QueuedAction) -> Result<usize, OutboxError> {
        let _guard = self.lock.lock().await;
        let mut actions = self.load().await?;
        actions.push(action);
        self.persist(&actions).await?;
        Ok(actions.len())
    }

    pub async fn read_all(&self) -> Result<Vec<QueuedAction>, OutboxError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Overwrites the stored list wholesale.
    #[instrument(skip(self, actions), fields(count = actions.len()))]
    pub async fn replace_all(&self, actions: Vec<QueuedAction>) -> Result<(), OutboxError> {
        let _guard = self.lock.lock().await;
        self.persist(&actions).await
    }

    /// Ends a flush that worked from `snapshot`: the snapshot's actions are
    /// dropped except `retained`, which go first in their given order,
    /// followed by anything appended since the snapshot was read. Retained
    /// actions no longer in the store (cleared mid-flush) stay dropped.
    #[instrument(skip(self, snapshot, retained), fields(snapshot = snapshot.len(), retained = retained.len()))]
    pub async fn settle_flush(
        &self,
        snapshot: &[QueuedAction],
        retained: Vec<QueuedAction>,
    ) -> Result<usize, OutboxError> {
        let _guard = self.lock.lock().await;
        let current = self.load().await?;

        let present: HashSet<&ActionId> = current.iter().map(QueuedAction::id).collect();
        let flushed: HashSet<&ActionId> = snapshot.iter().map(QueuedAction::id).collect();

        let mut settled: Vec<QueuedAction> = retained
            .into_iter()
            .filter(|action| present.contains(action.id()))
            .collect();
        let arrived = current
            .iter()
            .filter(|action| !flushed.contains(action.id()))
            .cloned()
            .collect::<Vec<_>>();
        if !arrived.is_empty() {
            info!(arrived = arrived.len(), "keeping actions queued during flush");
        }
        settled.extend(arrived);

        self.persist(&settled).await?;
        Ok(settled.len())
    }

    /// Drops every pending action. Returns how many were dropped.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<usize, OutboxError> {
        let _guard = self.lock.lock().await;
        let dropped = self.load().await?.len();
        self.persist(&[]).await?;
        if dropped > 0 {
            warn!(dropped, "pending actions cleared");
        }
        Ok(dropped)
    }

    pub async fn len(&self) -> Result<usize, OutboxError> {
        Ok(self.read_all().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, OutboxError> {
        Ok(self.len().await? == 0)
    }

    /// Raw entries that could not be decoded, oldest first.
    pub async fn quarantined(&self) -> Result<Vec<Value>, OutboxError> {
        let raw = self.store.get_item(&self.quarantine_key).await?;
        Ok(raw
            .and_then(|raw| serde_json::from_str::<Vec<Value>>(&raw).ok())
            .unwrap_or_default())
    }

    async fn load(&self) -> Result<Vec<QueuedAction>, OutboxError> {
        let Some(raw) = self.store.get_item(&self.key).await? else {
            return Ok(Vec::new());
        };

        let entries = match serde_json::from_str::<Vec<Value>>(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "stored queue is not a JSON array, quarantining it");
                self.quarantine(vec![Value::String(raw)]).await?;
                self.persist(&[]).await?;
                return Ok(Vec::new());
            }
        };

        let mut actions = Vec::with_capacity(entries.len());
        let mut corrupted = Vec::new();
        let mut assigned = 0usize;
        for entry in entries {
            let has_id = entry.get("id").is_some();
            match serde_json::from_value::<QueuedAction>(entry.clone()) {
                Ok(action) => {
                    if !has_id {
                        assigned += 1;
                    }
                    actions.push(action);
                }
                Err(e) => {
                    warn!(error = %e, "quarantining undecodable queued action");
                    corrupted.push(entry);
                }
            }
        }

        if !corrupted.is_empty() {
            self.quarantine(corrupted.clone()).await?;
        }
        // Ids must stay stable across loads; flush settlement matches on them.
        if !corrupted.is_empty() || assigned > 0 {
            if assigned > 0 {
                info!(assigned, "assigned ids to stored actions");
            }
            self.persist(&actions).await?;
        }
        Ok(actions)
    }

    async fn quarantine(&self, entries: Vec<Value>) -> Result<(), OutboxError> {
        let mut all = self.quarantined().await?;
        all.extend(entries);
        let encoded = serde_json::to_string(&all).map_err(|e| OutboxError::Encode(e.to_string()))?;
        self.store.set_item(&self.quarantine_key, encoded).await?;
        Ok(())
    }

    async fn persist(&self, actions: &[QueuedAction]) -> Result<(), OutboxError> {
        let encoded =
            serde_json::to_string(actions).map_err(|e| OutboxError::Encode(e.to_string()))?;
        self.store.set_item(&self.key, encoded).await.map_err(|e| {
            error!(error = %e, "failed to persist action queue");
            OutboxError::from(e)
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
