//! In-process doubles for the backend, reachability probe and mailer.
//!
//! Shells use them for demos without a network; the crate's own tests use
//! them to script failures deterministically.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::http::{Backend, BackendError, MatchCriteria, ReachabilityProbe, Row};
use super::mail::{EmailMessage, MailError, Mailer};
use super::push::{ChangeKind, ChangeSignal, LocalChangeFeed};
use crate::model::ListId;

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Insert {
        target: String,
        payload: Row,
    },
    Update {
        target: String,
        payload: Row,
        criteria: MatchCriteria,
    },
    Delete {
        target: String,
        criteria: MatchCriteria,
    },
    Select {
        target: String,
        criteria: MatchCriteria,
    },
}

impl BackendCall {
    pub fn target(&self) -> &str {
        match self {
            BackendCall::Insert { target, .. }
            | BackendCall::Update { target, .. }
            | BackendCall::Delete { target, .. }
            | BackendCall::Select { target, .. } => target,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, BackendCall::Select { .. })
    }
}

#[derive(Default)]
struct BackendState {
    tables: HashMap<String, Vec<Row>>,
    script: VecDeque<Option<BackendError>>,
    unreachable: bool,
    calls: Vec<BackendCall>,
}

struct FeedHook {
    feed: Arc<LocalChangeFeed>,
    table: String,
}

/// Table store with PostgREST-like semantics: updates and deletes that match
/// nothing succeed, inserts without an `id` get a generated one.
///
/// Write calls consume one scripted outcome each (`None` = succeed); once the
/// script is exhausted writes succeed. `set_unreachable(true)` fails every
/// call, reads included, with a network error.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    hook: Option<FeedHook>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a change signal for every successful write to `table`.
    #[must_use]
    pub fn with_change_feed(mut self, feed: Arc<LocalChangeFeed>, table: impl Into<String>) -> Self {
        self.hook = Some(FeedHook {
            feed,
            table: table.into(),
        });
        self
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn seed(&self, target: &str, rows: impl IntoIterator<Item = Row>) {
        self.state()
            .tables
            .entry(target.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, target: &str) -> Vec<Row> {
        self.state().tables.get(target).cloned().unwrap_or_default()
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Option<BackendError>>) {
        self.state().script.extend(outcomes);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn write_calls(&self) -> Vec<BackendCall> {
        self.state().calls.iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn admit(&self, call: BackendCall) -> Result<MutexGuard<'_, BackendState>, BackendError> {
        let mut state = self.state();
        let is_write = call.is_write();
        state.calls.push(call);
        if state.unreachable {
            return Err(BackendError::network("backend unreachable"));
        }
        if is_write {
            if let Some(Some(err)) = state.script.pop_front() {
                return Err(err);
            }
        }
        Ok(state)
    }

    fn notify(&self, target: &str, kind: ChangeKind, list_ids: BTreeSet<String>) {
        let Some(hook) = &self.hook else {
            return;
        };
        if hook.table != target {
            return;
        }
        for list_id in list_ids {
            hook.feed.publish(ChangeSignal::new(ListId::new(list_id), kind));
        }
    }
}

/// Same semantics as the REST filters: arrays mean membership, null
/// matches a missing column.
fn row_matches(row: &Row, criteria: &MatchCriteria) -> bool {
    criteria.iter().all(|(column, expected)| {
        let actual = row.get(column).unwrap_or(&Value::Null);
        match expected {
            Value::Array(members) => members.contains(actual),
            _ => actual == expected,
        }
    })
}

fn list_ids<'a>(rows: impl IntoIterator<Item = &'a Row>) -> BTreeSet<String> {
    rows.into_iter()
        .filter_map(|row| row.get("list_id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn insert(&self, target: &str, payload: &Row) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        let touched = {
            let mut state = self.admit(BackendCall::Insert {
                target: target.to_string(),
                payload: payload.clone(),
            })?;
            let mut row = payload.clone();
            row.entry("id")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            let touched = list_ids([&row]);
            state.tables.entry(target.to_string()).or_default().push(row);
            touched
        };
        self.notify(target, ChangeKind::Insert, touched);
        Ok(())
    }

    async fn update(
        &self,
        target: &str,
        payload: &Row,
        criteria: &MatchCriteria,
    ) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        let touched = {
            let mut state = self.admit(BackendCall::Update {
                target: target.to_string(),
                payload: payload.clone(),
                criteria: criteria.clone(),
            })?;
            let rows = state.tables.entry(target.to_string()).or_default();
            let mut touched = BTreeSet::new();
            for row in rows.iter_mut().filter(|row| row_matches(row, criteria)) {
                for (column, value) in payload {
                    row.insert(column.clone(), value.clone());
                }
                touched.extend(list_ids([&*row]));
            }
            touched
        };
        self.notify(target, ChangeKind::Update, touched);
        Ok(())
    }

    async fn delete(&self, target: &str, criteria: &MatchCriteria) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        let touched = {
            let mut state = self.admit(BackendCall::Delete {
                target: target.to_string(),
                criteria: criteria.clone(),
            })?;
            let rows = state.tables.entry(target.to_string()).or_default();
            let touched = list_ids(rows.iter().filter(|row| row_matches(row, criteria)));
            rows.retain(|row| !row_matches(row, criteria));
            touched
        };
        self.notify(target, ChangeKind::Delete, touched);
        Ok(())
    }

    async fn select(&self, target: &str, criteria: &MatchCriteria) -> Result<Vec<Row>, BackendError> {
        tokio::task::yield_now().await;
        let state = self.admit(BackendCall::Select {
            target: target.to_string(),
            criteria: criteria.clone(),
        })?;
        Ok(state
            .tables
            .get(target)
            .map(|rows| rows.iter().filter(|row| row_matches(row, criteria)).cloned().collect())
            .unwrap_or_default())
    }
}

// ============================================================================
// Probe
// ============================================================================

/// Probe whose answer is set by the caller. A non-zero delay makes each probe
/// sleep first, which lets tests exercise the probe timeout.
pub struct ScriptedProbe {
    reachable: AtomicBool,
    delay_ms: AtomicU64,
    probes: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            delay_ms: AtomicU64::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn probe(&self) -> Result<(), BackendError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::network("probe endpoint unreachable"))
        }
    }
}

// ============================================================================
// Mailer
// ============================================================================

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    fail_with: Mutex<Option<MailError>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every following send fails with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<MailError>) {
        *self.fail_with.lock().unwrap_or_else(|p| p.into_inner()) = error;
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        message.validate()?;
        if let Some(err) = self.fail_with.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(err);
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.clone());
        Ok(())
    }
}
