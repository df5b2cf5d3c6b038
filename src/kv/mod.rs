//! Namespaced key-value persistence.
//!
//! Every logical key holds a [`StoredValue`]: the writer decides whether the
//! payload is plain text or JSON, and that choice travels with the value so a
//! stored literal `"123"` never reads back as the number `123`.

mod redis_kv;
mod sqlite_kv;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::KeyringError;

pub use redis_kv::RedisKv;
pub use sqlite_kv::SqliteKv;

/// Errors raised by a storage backend. All of them mean "the store could not
/// be reached or did not answer"; callers decide whether that is fatal.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unreachable: {0}")]
    Unreachable(String),
}

/// Raw string storage addressed by a full key.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Overwrites the whole value stored under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Returns whether a value existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;
}

/// Explicitly tagged value as persisted in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Text(String),
    Json(Value),
}

impl StoredValue {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Raw payloads that do not carry the envelope were written by something
    /// else and are read as text.
    pub fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| StoredValue::Text(raw.to_owned()))
    }
}

/// Redis when a URL is given, otherwise the SQLite file at `database_path`.
pub async fn open_backend(
    redis_url: Option<&str>,
    database_path: &str,
) -> Result<Arc<dyn KvBackend>, KvError> {
    match redis_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => {
            info!("using redis key-value store");
            Ok(Arc::new(RedisKv::new(url)?))
        }
        None => {
            info!(path = database_path, "using sqlite key-value store");
            Ok(Arc::new(SqliteKv::open(database_path).await?))
        }
    }
}

/// Handle to a backend with every key placed under a namespace prefix.
#[derive(Clone)]
pub struct Kv {
    backend: Arc<dyn KvBackend>,
    namespace: String,
}

impl fmt::Debug for Kv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kv")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Kv {
    pub fn new(backend: Arc<dyn KvBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub async fn read(&self, key: &str) -> Result<Option<StoredValue>, KvError> {
        let raw = self.backend.get(&self.full_key(key)).await?;
        Ok(raw.as_deref().map(StoredValue::decode))
    }

    pub async fn write(&self, key: &str, value: &StoredValue) -> Result<(), KeyringError> {
        let encoded = value.encode()?;
        self.backend.set(&self.full_key(key), &encoded).await?;
        Ok(())
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, KeyringError> {
        match self.read(key).await? {
            None => Ok(None),
            Some(StoredValue::Json(value)) => Ok(Some(serde_json::from_value(value)?)),
            Some(StoredValue::Text(_)) => Err(KeyringError::UnexpectedValue {
                key: key.to_owned(),
                expected: "json",
            }),
        }
    }

    pub async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KeyringError> {
        let value = serde_json::to_value(value)?;
        self.write(key, &StoredValue::Json(value)).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, KvError> {
        self.backend.delete(&self.full_key(key)).await
    }
}
