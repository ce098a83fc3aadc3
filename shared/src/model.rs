use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::capabilities::Row;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

typed_id!(ListId);
typed_id!(ItemId);
typed_id!(UserId);
typed_id!(ActionId);

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A shopping list as stored by the backend. `members` is filled in from the
/// membership table when lists are refreshed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoppingList {
    pub id: ListId,
    pub name: String,
    pub owner_id: UserId,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub members: BTreeSet<UserId>,
}

impl ShoppingList {
    pub fn new(id: ListId, name: impl Into<String>, owner_id: UserId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(owner_id.clone());
        Self {
            id,
            name: name.into(),
            owner_id,
            members,
        }
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.owner_id == user_id
    }

    pub fn from_row(row: &Row) -> Result<Self, EntityError> {
        decode_row(row, "list")
    }
}

/// An item on exactly one list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub list_id: ListId,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_quantity() -> u32 {
    1
}

impl Item {
    /// A fresh unchecked item with a local id, used for optimistic display
    /// until the backend's copy arrives.
    pub fn local(list_id: ListId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ItemId::generate(),
            list_id,
            name: name.into(),
            category: None,
            quantity: 1,
            checked: false,
            updated_at: Some(now),
        }
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name.to_lowercase() == name.to_lowercase()
    }

    pub fn from_row(row: &Row) -> Result<Self, EntityError> {
        decode_row(row, "item")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed {entity} row: {message}")]
pub struct EntityError {
    pub entity: &'static str,
    pub message: String,
}

fn decode_row<T: serde::de::DeserializeOwned>(row: &Row, entity: &'static str) -> Result<T, EntityError> {
    serde_json::from_value(serde_json::Value::Object(row.clone())).map_err(|e| EntityError {
        entity,
        message: e.to_string(),
    })
}
