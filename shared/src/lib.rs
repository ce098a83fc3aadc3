//! Offline-tolerant client core for shared grocery lists.
//!
//! Writes go through [`QueueDispatcher`], which falls back to the durable
//! [`ActionQueue`] when the [`ConnectivityMonitor`] says the device is
//! offline or a write fails on the network. [`QueueFlusher`] replays the
//! queue when connectivity returns. [`GroceryApp`] ties these together with
//! the optimistic [`ViewState`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod app;
pub mod capabilities;
pub mod config;
pub mod connectivity;
pub mod dispatcher;
pub mod event;
pub mod flusher;
pub mod invite;
pub mod model;
pub mod outbox;
pub mod view;

pub use app::{AppError, GroceryApp, ListWatch};
pub use capabilities::{Backend, BackendError, FailureClass, LocalStore, MatchCriteria, Row};
pub use config::{ConfigError, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor, ConnectivitySnapshot};
pub use dispatcher::{DispatchError, DispatchOutcome, QueueDispatcher, QueueReason};
pub use event::Event;
pub use flusher::{FlushOutcome, FlushReport, QueueFlusher};
pub use invite::{InviteOutcome, InviteRequest, InviteService};
pub use model::{ActionId, Item, ItemId, ListId, ShoppingList, UnixTimeMs, UserId};
pub use outbox::{ActionQueue, Mutation, Operation, OutboxError, QueuedAction};
pub use view::{ItemChange, ViewPatch, ViewState};
