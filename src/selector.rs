use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tracing::{debug, warn};

use crate::KeyringError;
use crate::keys::{KeySource, KeyStore, preview_key};

/// Round-robin position, local to one selector and never persisted.
///
/// Holds `0 <= position < max(1, n)` for the candidate count `n` of the last
/// selection; a change in `n` is absorbed by taking the modulo again.
#[derive(Debug, Default)]
pub struct RotationCursor(AtomicUsize);

impl RotationCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index to use among `len` candidates; moves the cursor one step past it.
    pub fn advance(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some((current % len + 1) % len)
            })
            .unwrap_or_else(|current| current);
        previous % len
    }

    pub fn position(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A key picked for one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLease {
    /// Store id; `None` for environment fallback keys.
    pub id: Option<String>,
    pub secret: String,
    pub source: KeySource,
}

/// Picks keys in round-robin order, preferring the store over the
/// environment fallback list.
#[derive(Debug)]
pub struct KeySelector {
    store: KeyStore,
    fallback: Vec<String>,
    cursor: RotationCursor,
}

impl KeySelector {
    pub fn new(store: KeyStore, fallback: Vec<String>) -> Self {
        Self {
            store,
            fallback,
            cursor: RotationCursor::new(),
        }
    }

    pub fn fallback_len(&self) -> usize {
        self.fallback.len()
    }

    pub async fn next(&self) -> Result<String, KeyringError> {
        Ok(self.lease().await?.secret)
    }

    pub async fn lease(&self) -> Result<KeyLease, KeyringError> {
        match self.store.active().await {
            Ok(active) if !active.is_empty() => {
                let record = &active[self.cursor.advance(active.len())];
                if let Err(err) = self.store.touch(&record.id, Utc::now()).await {
                    warn!(id = %record.id, error = %err, "failed to record key usage");
                }
                debug!(id = %record.id, key = %preview_key(&record.key), "selected stored key");
                return Ok(KeyLease {
                    id: Some(record.id.clone()),
                    secret: record.key.clone(),
                    source: record.source,
                });
            }
            Ok(_) => debug!("no active keys in store"),
            Err(err) => warn!(error = %err, "key store unavailable, using fallback keys"),
        }

        if self.fallback.is_empty() {
            return Err(KeyringError::NoActiveKeys);
        }
        let secret = self.fallback[self.cursor.advance(self.fallback.len())].clone();
        debug!(key = %preview_key(&secret), "selected fallback key");
        Ok(KeyLease {
            id: None,
            secret,
            source: KeySource::Env,
        })
    }
}

/// Reads `primary`, then `primary_2`, `primary_3`, … until the first missing
/// variable. Values may hold several comma separated keys.
pub fn fallback_keys_from_env(primary: &str) -> Vec<String> {
    fallback_keys_with(primary, |name| std::env::var(name).ok())
}

pub fn fallback_keys_with<F>(primary: &str, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut values = Vec::new();
    values.extend(lookup(primary));
    for n in 2.. {
        match lookup(&format!("{primary}_{n}")) {
            Some(value) => values.push(value),
            None => break,
        }
    }

    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(|key| key.trim().to_owned())
        .filter(|key| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::*;
    use crate::kv::testing::SwitchableKv;
    use crate::keys::Visibility;
    use crate::kv::{Kv, SqliteKv};

    async fn store() -> KeyStore {
        KeyStore::new(Kv::new(Arc::new(SqliteKv::in_memory().await.unwrap()), ""))
    }

    #[test]
    fn cursor_stays_in_range_when_set_shrinks() {
        let cursor = RotationCursor::new();
        assert_eq!(cursor.advance(3), 0);
        assert_eq!(cursor.advance(3), 1);
        assert_eq!(cursor.advance(3), 2);
        assert_eq!(cursor.advance(3), 0);
        assert_eq!(cursor.advance(3), 1);
        assert_eq!(cursor.position(), 2);

        assert_eq!(cursor.advance(2), 0);
        assert!(cursor.position() < 2);
        assert_eq!(cursor.advance(0), 0);
    }

    #[tokio::test]
    async fn shrinking_active_set_keeps_rotating() {
        let store = store().await;
        store.add("sk-a", "a", true).await.unwrap();
        let b = store.add("sk-b", "b", true).await.unwrap();
        let c = store.add("sk-c", "c", true).await.unwrap();

        let selector = KeySelector::new(store.clone(), Vec::new());
        assert_eq!(selector.next().await.unwrap(), "sk-a");
        assert_eq!(selector.next().await.unwrap(), "sk-b");

        store.toggle(&c.id, false).await.unwrap();
        assert_eq!(selector.next().await.unwrap(), "sk-a");
        assert_eq!(selector.next().await.unwrap(), "sk-b");

        store.toggle(&b.id, false).await.unwrap();
        assert_eq!(selector.next().await.unwrap(), "sk-a");
        assert_eq!(selector.next().await.unwrap(), "sk-a");
    }

    #[tokio::test]
    async fn round_robin_wraps_in_insertion_order() {
        let store = store().await;
        store.add("sk-a", "Primary", true).await.unwrap();
        store.add("sk-b", "Secondary", true).await.unwrap();
        assert_eq!(store.list(Visibility::Redacted).await.unwrap().len(), 2);

        let selector = KeySelector::new(store, Vec::new());
        assert_eq!(selector.next().await.unwrap(), "sk-a");
        assert_eq!(selector.next().await.unwrap(), "sk-b");
        assert_eq!(selector.next().await.unwrap(), "sk-a");
    }

    #[tokio::test]
    async fn each_key_once_per_cycle() {
        let store = store().await;
        let secrets: Vec<String> = (0..5).map(|i| format!("sk-{i}")).collect();
        for secret in &secrets {
            store.add(secret, "", true).await.unwrap();
        }

        let selector = KeySelector::new(store, Vec::new());
        let mut seen = Vec::new();
        for _ in 0..secrets.len() {
            seen.push(selector.next().await.unwrap());
        }
        assert_eq!(seen, secrets);
    }

    #[tokio::test]
    async fn inactive_key_is_never_selected() {
        let store = store().await;
        let a = store.add("sk-a", "", true).await.unwrap();
        store.add("sk-b", "", true).await.unwrap();
        store.add("sk-c", "", true).await.unwrap();
        store.toggle(&a.id, false).await.unwrap();

        let selector = KeySelector::new(store, vec!["env-1".into()]);
        for _ in 0..6 {
            let secret = selector.next().await.unwrap();
            assert_ne!(secret, "sk-a");
            assert_ne!(secret, "env-1");
        }
    }

    #[tokio::test]
    async fn fallback_used_only_without_active_store_keys() {
        let store = store().await;
        let a = store.add("sk-a", "", false).await.unwrap();

        let selector = KeySelector::new(store.clone(), vec!["env-1".into(), "env-2".into()]);
        let picked: Vec<String> = [
            selector.next().await.unwrap(),
            selector.next().await.unwrap(),
            selector.next().await.unwrap(),
        ]
        .into();
        assert_eq!(picked, vec!["env-1", "env-2", "env-1"]);

        let lease = selector.lease().await.unwrap();
        assert_eq!(lease.source, KeySource::Env);
        assert_eq!(lease.id, None);

        store.toggle(&a.id, true).await.unwrap();
        assert_eq!(selector.next().await.unwrap(), "sk-a");
    }

    #[tokio::test]
    async fn no_keys_anywhere_is_an_error() {
        let selector = KeySelector::new(store().await, Vec::new());
        assert!(matches!(
            selector.next().await.unwrap_err(),
            KeyringError::NoActiveKeys
        ));
    }

    #[tokio::test]
    async fn unreachable_store_falls_back() {
        let backend = SwitchableKv::new().await;
        let store = KeyStore::new(Kv::new(backend.clone(), ""));
        store.add("sk-a", "", true).await.unwrap();

        let selector = KeySelector::new(store, vec!["env-1".into()]);
        backend.set_down(true);
        assert_eq!(selector.next().await.unwrap(), "env-1");

        let empty = KeySelector::new(KeyStore::new(Kv::new(backend.clone(), "")), Vec::new());
        assert!(matches!(
            empty.next().await.unwrap_err(),
            KeyringError::NoActiveKeys
        ));
    }

    #[tokio::test]
    async fn selection_touches_the_record() {
        let store = store().await;
        let a = store.add("sk-a", "", true).await.unwrap();
        let selector = KeySelector::new(store.clone(), Vec::new());

        let lease = selector.lease().await.unwrap();
        assert_eq!(lease.id.as_deref(), Some(a.id.as_str()));
        let record = store.get(&a.id).await.unwrap().unwrap();
        assert_eq!(record.request_count, 1);
        assert!(record.last_used.is_some());
    }

    #[test]
    fn fallback_variables_follow_suffix_convention() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GEMINI_API_KEY", "k1"),
            ("GEMINI_API_KEY_2", "k2, k3"),
            ("GEMINI_API_KEY_3", " "),
            ("GEMINI_API_KEY_4", "k4"),
            ("GEMINI_API_KEY_6", "skipped"),
        ]);
        let keys = fallback_keys_with("GEMINI_API_KEY", |name| {
            vars.get(name).map(|v| v.to_string())
        });
        assert_eq!(keys, vec!["k1", "k2", "k3", "k4"]);
    }

    #[test]
    fn fallback_suffixes_read_without_primary() {
        let keys = fallback_keys_with("KEY", |name| (name == "KEY_2").then(|| "b".to_string()));
        assert_eq!(keys, vec!["b"]);
    }
}
