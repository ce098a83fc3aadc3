use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    Backend, BackendError, ChangeFeed, FeedError, KvError, LocalStore, MatchCriteria,
    ReachabilityProbe, Row,
};
use crate::config::{ConfigError, SyncConfig};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::dispatcher::{DispatchError, DispatchOutcome, QueueDispatcher};
use crate::event::Event;
use crate::flusher::{FlushOutcome, QueueFlusher};
use crate::model::{Item, ItemId, ListId, ShoppingList, UserId};
use crate::outbox::{ActionQueue, OutboxError, QueuedAction};
use crate::view::{ItemChange, ViewPatch, ViewState};

pub const MEMBER_ROLE: &str = "editor";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("\"{0}\" is already on the list")]
    Duplicate(String),

    #[error("only the list owner can do that")]
    Forbidden,

    #[error("unknown list: {0}")]
    UnknownList(ListId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error(transparent)]
    Queue(#[from] OutboxError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

impl AppError {
    /// Rejections are the only write failures a user needs to hear about.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AppError::Dispatch(DispatchError::Rejected(_)))
    }
}

/// The client core for one signed-in user.
///
/// Every write patches the view first, then goes through the dispatcher.
/// Reads replace view state from the backend. New items and lists get their
/// id on the client, so later writes to them match the backend row even
/// when everything is still queued.
pub struct GroceryApp<S: LocalStore> {
    user_id: UserId,
    config: SyncConfig,
    backend: Arc<dyn Backend>,
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<ActionQueue<S>>,
    dispatcher: QueueDispatcher<S>,
    flusher: Arc<QueueFlusher<S>>,
    view: RwLock<ViewState>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl<S: LocalStore + 'static> GroceryApp<S> {
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn open(
        config: SyncConfig,
        user_id: UserId,
        backend: Arc<dyn Backend>,
        probe: Arc<dyn ReachabilityProbe>,
        store: Arc<S>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let queue = Arc::new(ActionQueue::open(store, config.queue_store_key()?).await?);
        let monitor = Arc::new(ConnectivityMonitor::new(probe, &config));
        let dispatcher = QueueDispatcher::new(backend.clone(), queue.clone(), monitor.clone());
        let flusher = Arc::new(QueueFlusher::new(backend.clone(), queue.clone(), monitor.clone()));

        Ok(Self {
            user_id,
            config,
            backend,
            monitor,
            queue,
            dispatcher,
            flusher,
            view: RwLock::new(ViewState::new()),
            reconciler: Mutex::new(None),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts probing, flushing on reconnect, and refreshing after flushes.
    pub fn start(self: &Arc<Self>) {
        self.monitor.start();
        self.flusher.start();

        let mut reconciler = lock(&self.reconciler);
        if reconciler.as_ref().is_some_and(|r| !r.is_finished()) {
            return;
        }
        let mut completions = self.flusher.subscribe_completions();
        let app = Arc::downgrade(self);
        *reconciler = Some(tokio::spawn(async move {
            loop {
                match completions.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                let Some(app) = app.upgrade() else {
                    break;
                };
                app.refresh_visible_lists().await;
            }
        }));
    }

    pub fn stop(&self) {
        self.monitor.stop();
        self.flusher.stop();
        if let Some(task) = lock(&self.reconciler).take() {
            task.abort();
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn connectivity(&self) -> Connectivity {
        self.monitor.state()
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn queue(&self) -> &Arc<ActionQueue<S>> {
        &self.queue
    }

    pub fn flusher(&self) -> &Arc<QueueFlusher<S>> {
        &self.flusher
    }

    /// A copy of the current view.
    pub fn view(&self) -> ViewState {
        self.read_view().clone()
    }

    pub fn revision(&self) -> u64 {
        self.read_view().revision()
    }

    /// Drains the queue on demand, e.g. when the app returns to the foreground.
    pub async fn flush_now(&self) -> FlushOutcome {
        self.flusher.flush().await
    }

    // ========================================================================
    // Shell events
    // ========================================================================

    /// Entry point for platform lifecycle signals.
    ///
    /// A move from offline to online drains the queue and then refreshes
    /// the lists on screen. Refresh failures surface only for explicit
    /// refresh requests.
    #[instrument(skip(self, event), fields(event = event.name()))]
    pub async fn update(&self, event: Event) -> Result<(), AppError> {
        match event {
            Event::NetworkStatusChanged { online } => {
                let was_offline = !self.monitor.is_online();
                self.monitor.report_platform_signal(online);
                if was_offline && self.monitor.is_online() {
                    self.reconcile().await;
                }
            }
            Event::AppForegrounded => {
                let was_offline = !self.monitor.is_online();
                if self.monitor.probe_once().await.is_online() && was_offline {
                    self.reconcile().await;
                }
            }
            Event::FlushRequested => self.reconcile().await,
            Event::RefreshRequested => {
                self.refresh_lists().await?;
                self.refresh_visible_lists().await;
            }
            Event::ListOpened { list_id } => {
                self.refresh_items(&list_id).await?;
            }
        }
        Ok(())
    }

    async fn reconcile(&self) {
        let outcome = self.flush_now().await;
        debug!(?outcome, "flushed after shell event");
        if matches!(outcome, FlushOutcome::Completed(_)) {
            self.refresh_visible_lists().await;
        }
    }

    // ========================================================================
    // Items
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn add_item(&self, list_id: &ListId, name: &str) -> Result<DispatchOutcome, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("item name must not be empty".into()));
        }
        let now = Utc::now();

        let restorable = {
            let view = self.read_view();
            if view.active_items(list_id).iter().any(|i| i.has_name(name)) {
                return Err(AppError::Duplicate(name.to_string()));
            }
            view.suggestions(list_id)
                .into_iter()
                .find(|i| i.has_name(name))
                .map(|i| i.id.clone())
        };

        let action = match restorable {
            Some(id) => {
                self.patch(ViewPatch::ItemChanged {
                    id: id.clone(),
                    change: ItemChange {
                        name: Some(name.to_string()),
                        checked: Some(false),
                        quantity: Some(1),
                        updated_at: Some(now),
                        ..Default::default()
                    },
                });
                QueuedAction::update(
                    &self.config.items_table,
                    row([
                        ("checked", Value::Bool(false)),
                        ("quantity", Value::from(1)),
                        ("updated_at", timestamp(now)),
                    ]),
                    by_id(id.as_str()),
                )?
            }
            None => {
                let item = Item::local(list_id.clone(), name, now);
                let action = QueuedAction::insert(
                    &self.config.items_table,
                    row([
                        ("name", Value::from(name)),
                        ("list_id", Value::from(list_id.as_str())),
                        ("checked", Value::Bool(false)),
                        ("quantity", Value::from(1)),
                        ("id", Value::from(item.id.as_str())),
                    ]),
                )?;
                self.patch(ViewPatch::ItemAdded(item));
                action
            }
        };
        self.submit(action).await
    }

    #[instrument(skip(self))]
    pub async fn check_item(&self, id: &ItemId) -> Result<DispatchOutcome, AppError> {
        let now = Utc::now();
        self.patch(ViewPatch::ItemChanged {
            id: id.clone(),
            change: ItemChange {
                checked: Some(true),
                quantity: Some(1),
                updated_at: Some(now),
                ..Default::default()
            },
        });
        let action = QueuedAction::update(
            &self.config.items_table,
            row([
                ("checked", Value::Bool(true)),
                ("quantity", Value::from(1)),
                ("updated_at", timestamp(now)),
            ]),
            by_id(id.as_str()),
        )?;
        self.submit(action).await
    }

    #[instrument(skip(self))]
    pub async fn edit_item(
        &self,
        id: &ItemId,
        name: &str,
        category: Option<&str>,
    ) -> Result<DispatchOutcome, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("item name must not be empty".into()));
        }
        let category = category.map(str::trim).filter(|c| !c.is_empty());
        let now = Utc::now();

        self.patch(ViewPatch::ItemChanged {
            id: id.clone(),
            change: ItemChange {
                name: Some(name.to_string()),
                category: Some(category.map(str::to_string)),
                updated_at: Some(now),
                ..Default::default()
            },
        });
        let action = QueuedAction::update(
            &self.config.items_table,
            row([
                ("name", Value::from(name)),
                ("category", category.map_or(Value::Null, Value::from)),
                ("updated_at", timestamp(now)),
            ]),
            by_id(id.as_str()),
        )?;
        self.submit(action).await
    }

    #[instrument(skip(self))]
    pub async fn set_quantity(&self, id: &ItemId, quantity: u32) -> Result<DispatchOutcome, AppError> {
        if quantity == 0 {
            return Err(AppError::Validation("quantity must be at least 1".into()));
        }
        let now = Utc::now();

        self.patch(ViewPatch::ItemChanged {
            id: id.clone(),
            change: ItemChange {
                quantity: Some(quantity),
                updated_at: Some(now),
                ..Default::default()
            },
        });
        let action = QueuedAction::update(
            &self.config.items_table,
            row([("quantity", Value::from(quantity)), ("updated_at", timestamp(now))]),
            by_id(id.as_str()),
        )?;
        self.submit(action).await
    }

    #[instrument(skip(self))]
    pub async fn delete_item(&self, id: &ItemId) -> Result<DispatchOutcome, AppError> {
        self.patch(ViewPatch::ItemRemoved(id.clone()));
        let action = QueuedAction::delete(&self.config.items_table, by_id(id.as_str()))?;
        self.submit(action).await
    }

    /// Sets or clears the category of several items with one write.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn set_category(
        &self,
        list_id: &ListId,
        ids: &[ItemId],
        category: Option<&str>,
    ) -> Result<DispatchOutcome, AppError> {
        let criteria = selection(list_id, ids)?;
        let category = category.map(str::trim).filter(|c| !c.is_empty());
        let now = Utc::now();

        for id in ids {
            self.patch(ViewPatch::ItemChanged {
                id: id.clone(),
                change: ItemChange {
                    category: Some(category.map(str::to_string)),
                    updated_at: Some(now),
                    ..Default::default()
                },
            });
        }
        let action = QueuedAction::update(
            &self.config.items_table,
            row([
                ("category", category.map_or(Value::Null, Value::from)),
                ("updated_at", timestamp(now)),
            ]),
            criteria,
        )?;
        self.submit(action).await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn delete_items(&self, list_id: &ListId, ids: &[ItemId]) -> Result<DispatchOutcome, AppError> {
        let criteria = selection(list_id, ids)?;
        for id in ids {
            self.patch(ViewPatch::ItemRemoved(id.clone()));
        }
        let action = QueuedAction::delete(&self.config.items_table, criteria)?;
        self.submit(action).await
    }

    // ========================================================================
    // Lists
    // ========================================================================

    /// Creates a list owned by the current user and adds them as a member.
    /// The id is generated here so both writes can be queued offline.
    #[instrument(skip(self))]
    pub async fn create_list(
        &self,
        name: &str,
    ) -> Result<(ShoppingList, Vec<DispatchOutcome>), AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("list name must not be empty".into()));
        }
        let list = ShoppingList::new(ListId::generate(), name, self.user_id.clone());
        self.patch(ViewPatch::ListAdded(list.clone()));

        let create = QueuedAction::insert(
            &self.config.lists_table,
            row([
                ("id", Value::from(list.id.as_str())),
                ("name", Value::from(name)),
                ("owner_id", Value::from(self.user_id.as_str())),
            ]),
        )?;
        let join = QueuedAction::insert(
            &self.config.members_table,
            row([
                ("list_id", Value::from(list.id.as_str())),
                ("user_id", Value::from(self.user_id.as_str())),
                ("role", Value::from(MEMBER_ROLE)),
            ]),
        )?;

        let outcomes = self.submit_all([create, join]).await?;
        info!(list_id = %list.id, "list created");
        Ok((list, outcomes))
    }

    /// Owner-only. Removes the list's items, then its memberships, then the
    /// list itself.
    #[instrument(skip(self))]
    pub async fn delete_list(&self, list_id: &ListId) -> Result<Vec<DispatchOutcome>, AppError> {
        let owned = self
            .read_view()
            .list(list_id)
            .map(|l| l.is_owned_by(&self.user_id))
            .ok_or_else(|| AppError::UnknownList(list_id.clone()))?;
        if !owned {
            return Err(AppError::Forbidden);
        }

        self.patch(ViewPatch::ListRemoved(list_id.clone()));

        let by_list = row([("list_id", Value::from(list_id.as_str()))]);
        let actions = [
            QueuedAction::delete(&self.config.items_table, by_list.clone())?,
            QueuedAction::delete(&self.config.members_table, by_list)?,
            QueuedAction::delete(&self.config.lists_table, by_id(list_id.as_str()))?,
        ];
        self.submit_all(actions).await
    }

    // ========================================================================
    // Authoritative reads
    // ========================================================================

    /// Replaces the view's items for `list_id` with the backend's.
    #[instrument(skip(self))]
    pub async fn refresh_items(&self, list_id: &ListId) -> Result<usize, AppError> {
        let rows = self
            .read(&self.config.items_table, row([("list_id", Value::from(list_id.as_str()))]))
            .await?;
        let items: Vec<Item> = decode_all(&rows, Item::from_row);
        let count = items.len();
        self.write_view().apply_items_snapshot(list_id, items);
        debug!(count, "items refreshed");
        Ok(count)
    }

    /// Replaces the view's lists. Which lists are visible is decided by the
    /// backend's access policies.
    #[instrument(skip(self))]
    pub async fn refresh_lists(&self) -> Result<usize, AppError> {
        let list_rows = self.read(&self.config.lists_table, MatchCriteria::new()).await?;
        let member_rows = self.read(&self.config.members_table, MatchCriteria::new()).await?;

        let mut members: HashMap<String, BTreeSet<UserId>> = HashMap::new();
        for member in &member_rows {
            if let (Some(list_id), Some(user_id)) = (str_field(member, "list_id"), str_field(member, "user_id")) {
                members
                    .entry(list_id.to_string())
                    .or_default()
                    .insert(UserId::new(user_id));
            }
        }

        let mut lists: Vec<ShoppingList> = decode_all(&list_rows, ShoppingList::from_row);
        for list in &mut lists {
            list.members.insert(list.owner_id.clone());
            if let Some(ids) = members.remove(list.id.as_str()) {
                list.members.extend(ids);
            }
        }
        let count = lists.len();
        self.write_view().apply_lists_snapshot(lists);
        debug!(count, "lists refreshed");
        Ok(count)
    }

    /// Distinct members of a list, counting the owner even when the
    /// membership table does not list them.
    #[instrument(skip(self))]
    pub async fn member_count(&self, list_id: &ListId) -> Result<usize, AppError> {
        let owner = self
            .read_view()
            .list(list_id)
            .map(|l| l.owner_id.clone())
            .ok_or_else(|| AppError::UnknownList(list_id.clone()))?;

        let rows = self
            .read(&self.config.members_table, row([("list_id", Value::from(list_id.as_str()))]))
            .await?;
        let mut ids: BTreeSet<&str> = rows.iter().filter_map(|r| str_field(r, "user_id")).collect();
        ids.insert(owner.as_str());
        Ok(ids.len())
    }

    /// Refetches the list's items on every change signal until the returned
    /// handle is dropped.
    pub fn watch_list(
        self: &Arc<Self>,
        list_id: &ListId,
        feed: &dyn ChangeFeed,
    ) -> Result<ListWatch, AppError> {
        let mut signals = feed.subscribe(list_id)?;
        let app = Arc::downgrade(self);
        let watched = list_id.clone();

        let task = tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => debug!(missed, "change feed lagged"),
                    Err(RecvError::Closed) => break,
                }
                let Some(app) = app.upgrade() else {
                    break;
                };
                if let Err(e) = app.refresh_items(&watched).await {
                    warn!(list_id = %watched, error = %e, "refresh after change signal failed");
                }
            }
        });

        info!(list_id = %list_id, "watching list");
        Ok(ListWatch {
            list_id: list_id.clone(),
            task,
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn submit(&self, action: QueuedAction) -> Result<DispatchOutcome, AppError> {
        Ok(self.dispatcher.dispatch(action).await?)
    }

    /// Dispatches in order and stops at the first rejection.
    async fn submit_all(
        &self,
        actions: impl IntoIterator<Item = QueuedAction>,
    ) -> Result<Vec<DispatchOutcome>, AppError> {
        let mut outcomes = Vec::new();
        for action in actions {
            outcomes.push(self.submit(action).await?);
        }
        Ok(outcomes)
    }

    async fn read(&self, target: &str, criteria: MatchCriteria) -> Result<Vec<Row>, AppError> {
        match self.backend.select(target, &criteria).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                if e.is_network() {
                    self.monitor.force_offline();
                }
                warn!(table = target, error = %e, "authoritative read failed");
                Err(e.into())
            }
        }
    }

    async fn refresh_visible_lists(&self) {
        let list_ids: Vec<ListId> = self.read_view().lists().iter().map(|l| l.id.clone()).collect();
        for list_id in list_ids {
            if let Err(e) = self.refresh_items(&list_id).await {
                debug!(list_id = %list_id, error = %e, "post-flush refresh failed");
                break;
            }
        }
    }

    fn patch(&self, patch: ViewPatch) {
        self.write_view().apply(patch);
    }

    fn read_view(&self) -> RwLockReadGuard<'_, ViewState> {
        self.view.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_view(&self) -> RwLockWriteGuard<'_, ViewState> {
        self.view.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl<S: LocalStore> Drop for GroceryApp<S> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reconciler).take() {
            task.abort();
        }
    }
}

/// Live subscription created by [`GroceryApp::watch_list`]. Stops on drop.
pub struct ListWatch {
    list_id: ListId,
    task: JoinHandle<()>,
}

impl ListWatch {
    pub fn list_id(&self) -> &ListId {
        &self.list_id
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ListWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn row<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn by_id(id: &str) -> MatchCriteria {
    row([("id", Value::from(id))])
}

/// Criteria for a set of items inside one list.
fn selection(list_id: &ListId, ids: &[ItemId]) -> Result<MatchCriteria, AppError> {
    if ids.is_empty() {
        return Err(AppError::Validation("no items selected".into()));
    }
    let ids = ids.iter().map(|id| Value::from(id.as_str())).collect();
    Ok(row([
        ("list_id", Value::from(list_id.as_str())),
        ("id", Value::Array(ids)),
    ]))
}

fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn str_field<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

fn decode_all<T, E: std::fmt::Display>(rows: &[Row], decode: impl Fn(&Row) -> Result<T, E>) -> Vec<T> {
    rows.iter()
        .filter_map(|r| match decode(r) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "skipping malformed row");
                None
            }
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        BackendCall, LocalChangeFeed, MemoryBackend, MemoryStore, ScriptedProbe,
    };
    use crate::dispatcher::QueueReason;
    use serde_json::json;
    use std::time::Duration;

    fn map(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn app_with(backend: Arc<MemoryBackend>, online: bool) -> Arc<GroceryApp<MemoryStore>> {
        let config = SyncConfig {
            start_online: online,
            ..Default::default()
        };
        Arc::new(
            GroceryApp::open(
                config,
                UserId::new("u1"),
                backend,
                Arc::new(ScriptedProbe::new(online)),
                Arc::new(MemoryStore::new()),
            )
            .await
            .unwrap(),
        )
    }

    fn seed_list(backend: &MemoryBackend, id: &str, owner: &str) {
        backend.seed("lists", [map(json!({"id": id, "name": "Weekly", "owner_id": owner}))]);
    }

    #[tokio::test]
    async fn test_add_item_online() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app_with(backend.clone(), true).await;
        let l1 = ListId::new("L1");

        let outcome = app.add_item(&l1, "  Milk ").await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Applied);
        let view = app.view();
        let milk = view.active_items(&l1)[0];
        assert_eq!(milk.name, "Milk");
        assert_eq!(
            backend.write_calls(),
            vec![BackendCall::Insert {
                target: "items".into(),
                payload: map(json!({
                    "name": "Milk",
                    "list_id": "L1",
                    "checked": false,
                    "quantity": 1,
                    "id": milk.id.as_str()
                })),
            }]
        );
    }

    #[tokio::test]
    async fn test_add_item_validation_and_duplicates() {
        let app = app_with(Arc::new(MemoryBackend::new()), false).await;
        let l1 = ListId::new("L1");

        assert!(matches!(app.add_item(&l1, "   ").await, Err(AppError::Validation(_))));
        app.add_item(&l1, "Milk").await.unwrap();
        assert!(matches!(app.add_item(&l1, "MILK").await, Err(AppError::Duplicate(_))));
        assert_eq!(app.queue().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_item_restores_checked_item() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            "items",
            [map(json!({"id": "I1", "list_id": "L1", "name": "Milk", "checked": true, "quantity": 3}))],
        );
        let app = app_with(backend.clone(), true).await;
        let l1 = ListId::new("L1");
        app.refresh_items(&l1).await.unwrap();
        backend.clear_calls();

        app.add_item(&l1, "milk").await.unwrap();

        let calls = backend.write_calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            BackendCall::Update { payload, criteria, .. } => {
                assert_eq!(criteria, &map(json!({"id": "I1"})));
                assert_eq!(payload["checked"], json!(false));
                assert_eq!(payload["quantity"], json!(1));
                assert!(payload["updated_at"].is_string());
            }
            other => panic!("unexpected call {other:?}"),
        }
        let view = app.view();
        assert!(view.suggestions(&l1).is_empty());
        assert_eq!(view.active_items(&l1)[0].quantity, 1);
    }

    #[tokio::test]
    async fn test_offline_edits_to_new_item_reach_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app_with(backend.clone(), false).await;
        let l1 = ListId::new("L1");

        app.add_item(&l1, "Milk").await.unwrap();
        let id = app.view().active_items(&l1)[0].id.clone();
        app.set_quantity(&id, 3).await.unwrap();
        app.check_item(&id).await.unwrap();
        assert_eq!(app.queue().len().await.unwrap(), 3);

        let outcome = app.flush_now().await;

        assert!(matches!(outcome, FlushOutcome::Completed(r) if r.replayed == 3));
        let rows = backend.rows("items");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(id.as_str()));
        assert_eq!(rows[0]["checked"], json!(true));
        assert_eq!(rows[0]["quantity"], json!(1));
    }

    #[tokio::test]
    async fn test_offline_delete_of_new_item_removes_backend_row() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app_with(backend.clone(), false).await;
        let l1 = ListId::new("L1");

        app.add_item(&l1, "Milk").await.unwrap();
        let id = app.view().active_items(&l1)[0].id.clone();
        app.delete_item(&id).await.unwrap();
        app.flush_now().await;

        assert!(backend.rows("items").is_empty());
        assert!(app.view().item(&id).is_none());
    }

    #[tokio::test]
    async fn test_set_category_for_selection() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            "items",
            [
                map(json!({"id": "I1", "list_id": "L1", "name": "Milk", "checked": false, "quantity": 1})),
                map(json!({"id": "I2", "list_id": "L1", "name": "Eggs", "checked": false, "quantity": 1})),
                map(json!({"id": "I3", "list_id": "L1", "name": "Salt", "checked": false, "quantity": 1})),
            ],
        );
        let app = app_with(backend.clone(), true).await;
        let l1 = ListId::new("L1");
        app.refresh_items(&l1).await.unwrap();
        let selected = [ItemId::new("I1"), ItemId::new("I2")];

        app.set_category(&l1, &selected, Some(" Dairy ")).await.unwrap();

        let view = app.view();
        assert_eq!(view.item(&selected[0]).unwrap().category.as_deref(), Some("Dairy"));
        assert_eq!(view.item(&selected[1]).unwrap().category.as_deref(), Some("Dairy"));
        assert_eq!(view.item(&ItemId::new("I3")).unwrap().category, None);
        match backend.write_calls().as_slice() {
            [BackendCall::Update { payload, criteria, .. }] => {
                assert_eq!(payload["category"], json!("Dairy"));
                assert_eq!(criteria, &map(json!({"list_id": "L1", "id": ["I1", "I2"]})));
            }
            calls => panic!("unexpected calls: {calls:?}"),
        }
        let dairy = backend
            .rows("items")
            .iter()
            .filter(|r| r.get("category") == Some(&json!("Dairy")))
            .count();
        assert_eq!(dairy, 2);

        app.set_category(&l1, &selected, Some("  ")).await.unwrap();
        assert_eq!(app.view().item(&selected[0]).unwrap().category, None);
        assert_eq!(backend.rows("items")[0]["category"], Value::Null);
    }

    #[tokio::test]
    async fn test_delete_items_offline_then_flush() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            "items",
            [
                map(json!({"id": "I1", "list_id": "L1", "name": "Milk", "checked": false, "quantity": 1})),
                map(json!({"id": "I2", "list_id": "L1", "name": "Eggs", "checked": false, "quantity": 1})),
            ],
        );
        let app = app_with(backend.clone(), false).await;
        let l1 = ListId::new("L1");
        app.refresh_items(&l1).await.unwrap();

        let outcome = app.delete_items(&l1, &[ItemId::new("I2")]).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
        assert!(app.view().item(&ItemId::new("I2")).is_none());
        assert!(app.view().item(&ItemId::new("I1")).is_some());
        app.flush_now().await;
        let rows = backend.rows("items");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("I1"));
    }

    #[tokio::test]
    async fn test_bulk_operations_need_a_selection() {
        let app = app_with(Arc::new(MemoryBackend::new()), true).await;
        let l1 = ListId::new("L1");

        assert!(matches!(
            app.set_category(&l1, &[], Some("Dairy")).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(app.delete_items(&l1, &[]).await, Err(AppError::Validation(_))));
        assert!(app.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_check_and_quantity() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed("items", [map(json!({"id": "I1", "list_id": "L1", "name": "Milk"}))]);
        let app = app_with(backend.clone(), true).await;
        let l1 = ListId::new("L1");
        app.refresh_items(&l1).await.unwrap();

        assert!(matches!(
            app.set_quantity(&ItemId::new("I1"), 0).await,
            Err(AppError::Validation(_))
        ));
        app.set_quantity(&ItemId::new("I1"), 4).await.unwrap();
        assert_eq!(backend.rows("items")[0]["quantity"], json!(4));

        app.check_item(&ItemId::new("I1")).await.unwrap();
        let stored = &backend.rows("items")[0];
        assert_eq!(stored["checked"], json!(true));
        assert_eq!(stored["quantity"], json!(1));
        assert_eq!(app.view().suggestions(&l1).len(), 1);
    }

    #[tokio::test]
    async fn test_edit_item_clears_blank_category() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app_with(backend.clone(), true).await;

        app.edit_item(&ItemId::new("I1"), "Oat milk", Some("  ")).await.unwrap();

        match &backend.write_calls()[0] {
            BackendCall::Update { payload, .. } => {
                assert_eq!(payload["name"], json!("Oat milk"));
                assert_eq!(payload["category"], Value::Null);
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_surfaces_to_caller() {
        let backend = Arc::new(MemoryBackend::new());
        backend.script([Some(BackendError::rejected(403, "permission denied"))]);
        let app = app_with(backend, true).await;

        let err = app.delete_item(&ItemId::new("I1")).await.unwrap_err();
        assert!(err.is_rejection());
        assert!(app.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_create_list_offline_queues_both_writes_in_order() {
        let app = app_with(Arc::new(MemoryBackend::new()), false).await;

        let (list, outcomes) = app.create_list("Party").await.unwrap();

        assert!(outcomes.iter().all(|o| matches!(
            o,
            DispatchOutcome::Queued {
                reason: QueueReason::KnownOffline,
                ..
            }
        )));
        let queued = app.queue().read_all().await.unwrap();
        assert_eq!(queued[0].target(), "lists");
        assert_eq!(queued[0].payload().unwrap()["id"], json!(list.id.as_str()));
        assert_eq!(queued[1].target(), "list_members");
        assert_eq!(queued[1].payload().unwrap()["role"], json!("editor"));
        assert!(app.view().list(&list.id).is_some());
    }

    #[tokio::test]
    async fn test_delete_list_owner_only() {
        let backend = Arc::new(MemoryBackend::new());
        seed_list(&backend, "L1", "u1");
        seed_list(&backend, "L2", "someone-else");
        backend.seed("items", [map(json!({"id": "I1", "list_id": "L1", "name": "Milk"}))]);
        backend.seed("list_members", [map(json!({"list_id": "L1", "user_id": "u2"}))]);
        let app = app_with(backend.clone(), true).await;
        app.refresh_lists().await.unwrap();
        backend.clear_calls();

        assert!(matches!(app.delete_list(&ListId::new("L2")).await, Err(AppError::Forbidden)));
        assert!(matches!(
            app.delete_list(&ListId::new("nope")).await,
            Err(AppError::UnknownList(_))
        ));

        app.delete_list(&ListId::new("L1")).await.unwrap();

        let targets: Vec<_> = backend.write_calls().iter().map(|c| c.target().to_string()).collect();
        assert_eq!(targets, ["items", "list_members", "lists"]);
        assert!(backend.rows("items").is_empty());
        assert!(app.view().list(&ListId::new("L1")).is_none());
    }

    #[tokio::test]
    async fn test_refresh_lists_and_member_count() {
        let backend = Arc::new(MemoryBackend::new());
        seed_list(&backend, "L1", "u1");
        backend.seed(
            "list_members",
            [
                map(json!({"list_id": "L1", "user_id": "u2"})),
                map(json!({"list_id": "L1", "user_id": "u2"})),
                map(json!({"list_id": "L1", "user_id": "u3"})),
            ],
        );
        let app = app_with(backend, true).await;

        assert_eq!(app.refresh_lists().await.unwrap(), 1);
        let view = app.view();
        assert_eq!(view.list(&ListId::new("L1")).unwrap().members.len(), 3);

        assert_eq!(app.member_count(&ListId::new("L1")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_read_keeps_view_and_goes_offline() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app_with(backend.clone(), true).await;
        let l1 = ListId::new("L1");
        app.add_item(&l1, "Milk").await.unwrap();
        let before = app.view();

        backend.set_unreachable(true);
        assert!(matches!(app.refresh_items(&l1).await, Err(AppError::Backend(_))));

        assert_eq!(app.view(), before);
        assert_eq!(app.connectivity(), Connectivity::Offline);
    }

    #[tokio::test]
    async fn test_refresh_skips_malformed_rows() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            "items",
            [
                map(json!({"id": "I1", "list_id": "L1", "name": "Milk"})),
                map(json!({"id": "I2", "list_id": "L1"})),
            ],
        );
        let app = app_with(backend, true).await;
        assert_eq!(app.refresh_items(&ListId::new("L1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_watch_list_refetches_on_signal() {
        let feed = Arc::new(LocalChangeFeed::default());
        let backend = Arc::new(MemoryBackend::new().with_change_feed(feed.clone(), "items"));
        let app = app_with(backend.clone(), true).await;
        let l1 = ListId::new("L1");

        let watch = app.watch_list(&l1, feed.as_ref()).unwrap();
        assert!(watch.is_active());

        // another device writes directly to the backend
        backend
            .insert("items", &map(json!({"id": "I7", "list_id": "L1", "name": "Bread"})))
            .await
            .unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if app.view().item(&ItemId::new("I7")).is_some() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);

        drop(watch);
        for _ in 0..50 {
            if feed.subscriber_count(&l1) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(feed.subscriber_count(&l1), 0);
    }

    #[tokio::test]
    async fn test_network_event_replays_queue_and_refreshes() {
        let backend = Arc::new(MemoryBackend::new());
        seed_list(&backend, "L1", "u1");
        let app = app_with(backend.clone(), false).await;
        let l1 = ListId::new("L1");
        app.refresh_lists().await.unwrap();
        app.add_item(&l1, "Milk").await.unwrap();
        backend.clear_calls();

        app.update(Event::NetworkStatusChanged { online: true }).await.unwrap();

        assert_eq!(app.connectivity(), Connectivity::Online);
        assert!(app.queue().is_empty().await.unwrap());
        assert_eq!(backend.rows("items").len(), 1);
        let calls = backend.calls();
        assert!(matches!(&calls[0], BackendCall::Insert { .. }));
        assert!(calls[1..]
            .iter()
            .any(|c| matches!(c, BackendCall::Select { target, .. } if target == "items")));
        assert_eq!(app.view().active_items(&l1)[0].name, "Milk");

        // already online: a repeated signal does nothing
        backend.clear_calls();
        app.update(Event::NetworkStatusChanged { online: true }).await.unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_offline_signal_queues_next_write() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app_with(backend.clone(), true).await;

        app.update(Event::NetworkStatusChanged { online: false }).await.unwrap();
        let outcome = app.add_item(&ListId::new("L1"), "Milk").await.unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Queued {
                reason: QueueReason::KnownOffline,
                ..
            }
        ));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_foreground_event_probes_and_flushes() {
        let backend = Arc::new(MemoryBackend::new());
        let probe = Arc::new(ScriptedProbe::new(false));
        let config = SyncConfig {
            start_online: false,
            ..Default::default()
        };
        let app = GroceryApp::open(
            config,
            UserId::new("u1"),
            backend.clone(),
            probe.clone(),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();
        app.add_item(&ListId::new("L1"), "Milk").await.unwrap();

        app.update(Event::AppForegrounded).await.unwrap();
        assert_eq!(app.queue().len().await.unwrap(), 1);

        probe.set_reachable(true);
        app.update(Event::AppForegrounded).await.unwrap();
        assert_eq!(app.connectivity(), Connectivity::Online);
        assert!(app.queue().is_empty().await.unwrap());
        assert_eq!(backend.rows("items").len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_and_list_opened_events() {
        let backend = Arc::new(MemoryBackend::new());
        seed_list(&backend, "L1", "u1");
        backend.seed("items", [map(json!({"id": "I1", "list_id": "L1", "name": "Milk"}))]);
        let app = app_with(backend.clone(), true).await;

        app.update(Event::RefreshRequested).await.unwrap();

        let view = app.view();
        assert!(view.list(&ListId::new("L1")).is_some());
        assert!(view.item(&ItemId::new("I1")).is_some());

        backend.seed("items", [map(json!({"id": "I2", "list_id": "L1", "name": "Eggs"}))]);
        app.update(Event::ListOpened { list_id: ListId::new("L1") }).await.unwrap();
        assert!(app.view().item(&ItemId::new("I2")).is_some());

        backend.set_unreachable(true);
        assert!(app.update(Event::RefreshRequested).await.is_err());
        assert_eq!(app.connectivity(), Connectivity::Offline);
    }
}
