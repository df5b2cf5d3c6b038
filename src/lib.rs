pub mod gemini;
pub mod keys;
pub mod kv;
pub mod rate;
pub mod selector;
pub mod usage;

use std::sync::Arc;

use thiserror::Error;

pub use gemini::{DEFAULT_ENDPOINT, GeminiClient, GeminiResponse};
pub use keys::{KeyRecord, KeySource, KeyStore, Visibility, preview_key};
pub use kv::{Kv, KvBackend, KvError, RedisKv, SqliteKv, StoredValue, open_backend};
pub use rate::{Admission, RateGate, RateLimit};
pub use selector::{
    KeyLease, KeySelector, RotationCursor, fallback_keys_from_env, fallback_keys_with,
};
pub use usage::{UsageRecorder, UsageSample, UsageStats, UsageSubject};

/// Default namespace prefix for every logical key.
pub const DEFAULT_NAMESPACE: &str = "gemini:";

/// Key rotation and usage accounting for outbound API keys.
///
/// Cloning is cheap; clones share the same rotation cursor.
#[derive(Clone, Debug)]
pub struct KeyRing {
    store: KeyStore,
    selector: Arc<KeySelector>,
    usage: UsageRecorder,
    gate: RateGate,
}

impl KeyRing {
    /// `fallback` lists the environment keys used when the store has no
    /// active key or cannot be reached.
    pub fn new(kv: Kv, fallback: Vec<String>) -> Self {
        let store = KeyStore::new(kv.clone());
        let usage = UsageRecorder::new(kv);
        Self {
            selector: Arc::new(KeySelector::new(store.clone(), fallback)),
            gate: RateGate::new(usage.clone()),
            store,
            usage,
        }
    }

    pub fn fallback_len(&self) -> usize {
        self.selector.fallback_len()
    }

    pub async fn list_keys(&self, visibility: Visibility) -> Result<Vec<KeyRecord>, KeyringError> {
        self.store.list(visibility).await
    }

    pub async fn add_key(
        &self,
        secret: &str,
        name: &str,
        active: bool,
    ) -> Result<KeyRecord, KeyringError> {
        self.store.add(secret, name, active).await
    }

    pub async fn remove_key(&self, id: &str) -> Result<(), KeyringError> {
        self.store.remove(id).await
    }

    pub async fn toggle_key(&self, id: &str, active: bool) -> Result<KeyRecord, KeyringError> {
        self.store.toggle(id, active).await
    }

    /// Real secret of a key; for privileged callers only.
    pub async fn key_secret(&self, id: &str) -> Result<Option<String>, KeyringError> {
        Ok(self.store.get(id).await?.map(|record| record.key))
    }

    /// Usage of a stored key; zeroed stats when it has not been used yet.
    pub async fn get_stats(&self, id: &str) -> Result<UsageStats, KeyringError> {
        if self.store.get(id).await?.is_none() {
            return Err(KeyringError::NotFound(id.to_owned()));
        }
        let subject = UsageSubject::Key(id.to_owned());
        Ok(self.usage.stats(&subject).await?.unwrap_or_default())
    }

    pub async fn user_stats(&self, user: &str) -> Result<Option<UsageStats>, KeyringError> {
        self.usage
            .stats(&UsageSubject::User(user.to_owned()))
            .await
    }

    /// Moves environment keys into the store at startup.
    pub async fn import_keys(&self, secrets: &[String]) -> Result<usize, KeyringError> {
        self.store.import(secrets, KeySource::Migrated).await
    }

    pub async fn select_key_for_call(&self) -> Result<KeyLease, KeyringError> {
        self.selector.lease().await
    }

    /// Records a finished call against the key (when it came from the store)
    /// and against the caller. Never fails.
    pub async fn record_usage(&self, lease: &KeyLease, caller: Option<&str>, sample: &UsageSample) {
        if let Some(id) = lease.id.as_deref() {
            self.usage
                .record(&UsageSubject::Key(id.to_owned()), sample)
                .await;
        }
        if let Some(caller) = caller {
            self.usage
                .record(&UsageSubject::User(caller.to_owned()), sample)
                .await;
        }
    }

    pub async fn check_rate(&self, subject: &UsageSubject, limit: RateLimit) -> Admission {
        self.gate
            .check(subject, limit.limit, limit.window_seconds)
            .await
    }
}

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("an identical API key already exists")]
    DuplicateKey,
    #[error("API key '{0}' not found")]
    NotFound(String),
    #[error("no active API keys available")]
    NoActiveKeys,
    #[error("key store unavailable: {0}")]
    StoreUnavailable(#[from] KvError),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("value stored under '{key}' is not {expected}")]
    UnexpectedValue { key: String, expected: &'static str },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid upstream endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("http error: {0}")]
    Http(reqwest::Error),
}
