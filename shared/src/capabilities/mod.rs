mod http;
mod kv;
mod mail;
mod memory;
mod push;

pub use self::http::{
    filter_operand, Backend, BackendError, FailureClass, MatchCriteria, ReachabilityProbe, Row,
    ValidatedUrl,
};
#[cfg(feature = "http")]
pub use self::http::{HttpProbe, RestBackend, RestConfig};

pub use self::kv::{KeyNamespace, KvError, LocalStore, MemoryStore, StorageErrorCode, StoreKey};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::kv::SqliteStore;

pub use self::mail::{EmailMessage, MailError, Mailer, RESEND_ENDPOINT};
#[cfg(feature = "http")]
pub use self::mail::{ResendConfig, ResendMailer};

pub use self::memory::{BackendCall, MemoryBackend, RecordingMailer, ScriptedProbe};
pub use self::push::{ChangeFeed, ChangeKind, ChangeSignal, FeedError, LocalChangeFeed};
