use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreKey {
    namespace: KeyNamespace,
    key: String,
}

impl StoreKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Sibling key in the same namespace, e.g. `queue` -> `queue.quarantine`.
    pub fn with_suffix(&self, suffix: &str) -> Result<Self, KvError> {
        Self::new(self.namespace.clone(), format!("{}.{}", self.key, suffix))
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot look like a path".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Offline,
    Session,
    Cache,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Offline => "offline",
            KeyNamespace::Session => "session",
            KeyNamespace::Cache => "cache",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    /// Maps a configured prefix onto a namespace, validating custom ones.
    pub fn from_prefix(prefix: &str) -> Result<Self, KvError> {
        match prefix {
            "offline" => Ok(KeyNamespace::Offline),
            "session" => Ok(KeyNamespace::Session),
            "cache" => Ok(KeyNamespace::Cache),
            other => Self::custom(other),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace cannot be empty".to_string(),
            });
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom namespace exceeds maximum length of {} bytes",
                    MAX_PREFIX_LENGTH
                ),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },
}

impl KvError {
    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unavailable,
    Corrupted,
    DiskFull,
    Busy,
    IoError,
    Unknown,
}

/// Asynchronous key-value storage that survives process restarts.
#[async_trait::async_trait]
pub trait LocalStore: Send + Sync {
    async fn get_item(&self, key: &StoreKey) -> Result<Option<String>, KvError>;
    async fn set_item(&self, key: &StoreKey, value: String) -> Result<(), KvError>;
    async fn remove_item(&self, key: &StoreKey) -> Result<(), KvError>;
}

fn check_value_size(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store. Clones share the same map, so dropping every
/// component built on one clone and rebuilding from another behaves like
/// a restart against the same device storage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raw_value(&self, key: &StoreKey) -> Option<String> {
        self.entries.read().await.get(&key.raw()).cloned()
    }
}

#[async_trait::async_trait]
impl LocalStore for MemoryStore {
    async fn get_item(&self, key: &StoreKey) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set_item(&self, key: &StoreKey, value: String) -> Result<(), KvError> {
        check_value_size(&value)?;
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &StoreKey) -> Result<(), KvError> {
        self.entries.write().await.remove(&key.raw());
        Ok(())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStore;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite {
    use super::{check_value_size, KvError, LocalStore, StorageErrorCode, StoreKey};
    use crate::model::UnixTimeMs;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;

    /// SQLite-backed key-value table. Each `set_item` is a single upsert, so
    /// a value is either fully written or not at all.
    pub struct SqliteStore {
        conn: Mutex<Connection>,
    }

    impl SqliteStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(map_sqlite)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(map_sqlite)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_entries (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(map_sqlite)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn with_conn<T>(
            &self,
            f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
        ) -> Result<T, KvError> {
            let conn = self
                .conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Unavailable, "connection lock poisoned"))?;
            f(&conn).map_err(map_sqlite)
        }
    }

    #[async_trait::async_trait]
    impl LocalStore for SqliteStore {
        async fn get_item(&self, key: &StoreKey) -> Result<Option<String>, KvError> {
            let raw = key.raw();
            self.with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![raw],
                    |row| row.get(0),
                )
                .optional()
            })
        }

        async fn set_item(&self, key: &StoreKey, value: String) -> Result<(), KvError> {
            check_value_size(&value)?;
            let raw = key.raw();
            let now = UnixTimeMs::now().0 as i64;
            self.with_conn(|conn| {
                conn.execute(
                    r#"
                    INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                    "#,
                    params![raw, value, now],
                )
                .map(|_| ())
            })
        }

        async fn remove_item(&self, key: &StoreKey) -> Result<(), KvError> {
            let raw = key.raw();
            self.with_conn(|conn| {
                conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![raw])
                    .map(|_| ())
            })
        }
    }

    fn map_sqlite(e: rusqlite::Error) -> KvError {
        use rusqlite::ErrorCode;

        let code = match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StorageErrorCode::Busy,
            Some(ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StorageErrorCode::Corrupted
            }
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::PermissionDenied) => {
                StorageErrorCode::Unavailable
            }
            Some(ErrorCode::SystemIoFailure) => StorageErrorCode::IoError,
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }
}
