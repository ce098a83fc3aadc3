//! Lifecycle signals a platform shell forwards to [`GroceryApp::update`].
//!
//! User edits have their own methods on the app; these are the things that
//! happen to the app rather than things the user asks for.
//!
//! [`GroceryApp::update`]: crate::app::GroceryApp::update

use serde::{Deserialize, Serialize};

use crate::model::ListId;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The OS reported a network change. Treated as a hint.
    NetworkStatusChanged {
        online: bool,
    },
    /// Back in the foreground: probe now instead of waiting for the next tick.
    AppForegrounded,
    FlushRequested,
    RefreshRequested,
    ListOpened {
        list_id: ListId,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NetworkStatusChanged { .. } => "network_status_changed",
            Self::AppForegrounded => "app_foregrounded",
            Self::FlushRequested => "flush_requested",
            Self::RefreshRequested => "refresh_requested",
            Self::ListOpened { .. } => "list_opened",
        }
    }
}
