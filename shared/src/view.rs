//! In-memory list and item state shown to the user.
//!
//! Optimistic patches are applied the moment a user acts; authoritative
//! snapshots from the backend replace state wholesale. Nothing orders the
//! two: a snapshot read before a write lands can briefly undo an optimistic
//! patch until the next snapshot arrives.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::model::{Item, ItemId, ListId, ShoppingList};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItemChange {
    pub name: Option<String>,
    pub category: Option<Option<String>>,
    pub quantity: Option<u32>,
    pub checked: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ItemChange {
    fn apply_to(&self, item: &mut Item) {
        if let Some(name) = &self.name {
            item.name = name.clone();
        }
        if let Some(category) = &self.category {
            item.category = category.clone();
        }
        if let Some(quantity) = self.quantity {
            item.quantity = quantity;
        }
        if let Some(checked) = self.checked {
            item.checked = checked;
        }
        if let Some(updated_at) = self.updated_at {
            item.updated_at = Some(updated_at);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewPatch {
    ListAdded(ShoppingList),
    /// Also drops the list's items.
    ListRemoved(ListId),
    ItemAdded(Item),
    ItemChanged { id: ItemId, change: ItemChange },
    ItemRemoved(ItemId),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewState {
    lists: Vec<ShoppingList>,
    items: Vec<Item>,
    revision: u64,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every change, optimistic or authoritative.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Applies a local patch. Returns whether anything changed.
    pub fn apply(&mut self, patch: ViewPatch) -> bool {
        let changed = match patch {
            ViewPatch::ListAdded(list) => {
                self.lists.retain(|l| l.id != list.id);
                self.lists.push(list);
                true
            }
            ViewPatch::ListRemoved(id) => {
                let before = (self.lists.len(), self.items.len());
                self.lists.retain(|l| l.id != id);
                self.items.retain(|i| i.list_id != id);
                before != (self.lists.len(), self.items.len())
            }
            ViewPatch::ItemAdded(item) => {
                self.items.retain(|i| i.id != item.id);
                self.items.push(item);
                true
            }
            ViewPatch::ItemChanged { id, change } => match self.items.iter_mut().find(|i| i.id == id) {
                Some(item) => {
                    change.apply_to(item);
                    true
                }
                None => false,
            },
            ViewPatch::ItemRemoved(id) => {
                let before = self.items.len();
                self.items.retain(|i| i.id != id);
                before != self.items.len()
            }
        };
        if changed {
            self.revision += 1;
        }
        changed
    }

    /// Replaces every item of `list_id` with the backend's copy.
    pub fn apply_items_snapshot(&mut self, list_id: &ListId, items: Vec<Item>) {
        self.items.retain(|i| &i.list_id != list_id);
        self.items
            .extend(items.into_iter().filter(|i| &i.list_id == list_id));
        self.revision += 1;
    }

    /// Replaces the visible lists. Items of lists that disappeared go too.
    pub fn apply_lists_snapshot(&mut self, lists: Vec<ShoppingList>) {
        let kept: BTreeSet<&ListId> = lists.iter().map(|l| &l.id).collect();
        self.items.retain(|i| kept.contains(&i.list_id));
        self.lists = lists;
        self.revision += 1;
    }

    pub fn lists(&self) -> &[ShoppingList] {
        &self.lists
    }

    pub fn list(&self, id: &ListId) -> Option<&ShoppingList> {
        self.lists.iter().find(|l| &l.id == id)
    }

    pub fn item(&self, id: &ItemId) -> Option<&Item> {
        self.items.iter().find(|i| &i.id == id)
    }

    pub fn items(&self, list_id: &ListId) -> Vec<&Item> {
        self.items.iter().filter(|i| &i.list_id == list_id).collect()
    }

    /// Unchecked items, least recently touched first.
    pub fn active_items(&self, list_id: &ListId) -> Vec<&Item> {
        let mut active: Vec<_> = self
            .items
            .iter()
            .filter(|i| &i.list_id == list_id && !i.checked)
            .collect();
        active.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    /// Checked items, most recently checked first.
    pub fn suggestions(&self, list_id: &ListId) -> Vec<&Item> {
        let mut checked: Vec<_> = self
            .items
            .iter()
            .filter(|i| &i.list_id == list_id && i.checked)
            .collect();
        checked.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        checked
    }

    pub fn categories(&self, list_id: &ListId) -> BTreeSet<String> {
        self.items
            .iter()
            .filter(|i| &i.list_id == list_id)
            .filter_map(|i| i.category.clone())
            .filter(|c| !c.trim().is_empty())
            .collect()
    }
}
