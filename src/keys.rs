use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::KeyringError;
use crate::kv::Kv;
use crate::usage::UsageSubject;

/// Logical key holding the serialized key list.
pub const KEY_LIST: &str = "api_keys";

const PREVIEW_CHARS: usize = 8;

/// Where a key record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Admin,
    Env,
    Migrated,
}

/// One outbound API key as persisted in the key list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub id: String,
    pub key: String,
    pub name: String,
    pub active: bool,
    pub source: KeySource,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_count: u64,
}

impl KeyRecord {
    fn redacted(mut self) -> Self {
        self.key = preview_key(&self.key);
        self
    }
}

/// Whether a caller may see full secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Full,
    Redacted,
}

/// First eight characters of a secret followed by an ellipsis.
pub fn preview_key(key: &str) -> String {
    let shown: String = key.chars().take(PREVIEW_CHARS).collect();
    format!("{shown}…")
}

/// Persists the key list as a single value.
///
/// Every mutation reads the whole list, changes it, and writes it back. Two
/// concurrent writers can overwrite each other; the last write wins.
#[derive(Debug, Clone)]
pub struct KeyStore {
    kv: Kv,
}

impl KeyStore {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    async fn load(&self) -> Result<Vec<KeyRecord>, KeyringError> {
        Ok(self.kv.read_json(KEY_LIST).await?.unwrap_or_default())
    }

    async fn save(&self, records: &[KeyRecord]) -> Result<(), KeyringError> {
        self.kv.write_json(KEY_LIST, &records).await
    }

    pub async fn add(
        &self,
        key: &str,
        name: &str,
        active: bool,
    ) -> Result<KeyRecord, KeyringError> {
        let secret = key.trim();
        if secret.is_empty() {
            return Err(KeyringError::Validation("api key must not be empty".into()));
        }

        let mut records = self.load().await?;
        if records.iter().any(|record| record.key == secret) {
            return Err(KeyringError::DuplicateKey);
        }

        let record = new_record(&records, secret, name, active, KeySource::Admin);
        records.push(record.clone());
        self.save(&records).await?;

        info!(id = %record.id, key = %preview_key(secret), "api key added");
        Ok(record)
    }

    /// Adds every secret not yet present. Returns how many were added.
    pub async fn import(
        &self,
        secrets: &[String],
        source: KeySource,
    ) -> Result<usize, KeyringError> {
        let mut records = self.load().await?;
        let mut added = 0;

        for secret in secrets.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if records.iter().any(|record| record.key == secret) {
                continue;
            }
            let record = new_record(&records, secret, "", true, source);
            records.push(record);
            added += 1;
        }

        if added > 0 {
            self.save(&records).await?;
            info!(added, "imported api keys");
        }
        Ok(added)
    }

    pub async fn remove(&self, id: &str) -> Result<(), KeyringError> {
        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|record| record.id != id);
        if records.len() == before {
            return Err(KeyringError::NotFound(id.to_owned()));
        }
        self.save(&records).await?;

        let usage_key = UsageSubject::Key(id.to_owned()).storage_key();
        if let Err(err) = self.kv.remove(&usage_key).await {
            warn!(id, error = %err, "failed to drop usage stats of removed key");
        }

        info!(id, "api key removed");
        Ok(())
    }

    pub async fn toggle(&self, id: &str, active: bool) -> Result<KeyRecord, KeyringError> {
        let mut records = self.load().await?;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| KeyringError::NotFound(id.to_owned()))?;
        record.active = active;
        let updated = record.clone();
        self.save(&records).await?;

        info!(id, active, "api key toggled");
        Ok(updated)
    }

    pub async fn list(&self, visibility: Visibility) -> Result<Vec<KeyRecord>, KeyringError> {
        let records = self.load().await?;
        Ok(match visibility {
            Visibility::Full => records,
            Visibility::Redacted => records.into_iter().map(KeyRecord::redacted).collect(),
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<KeyRecord>, KeyringError> {
        let records = self.load().await?;
        Ok(records.into_iter().find(|record| record.id == id))
    }

    /// Active records in list order.
    pub async fn active(&self) -> Result<Vec<KeyRecord>, KeyringError> {
        let mut records = self.load().await?;
        records.retain(|record| record.active);
        Ok(records)
    }

    /// Marks a key as used once more at `at`.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), KeyringError> {
        let mut records = self.load().await?;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| KeyringError::NotFound(id.to_owned()))?;
        record.last_used = Some(at);
        record.request_count += 1;
        self.save(&records).await
    }
}

fn new_record(
    existing: &[KeyRecord],
    secret: &str,
    name: &str,
    active: bool,
    source: KeySource,
) -> KeyRecord {
    let name = match name.trim() {
        "" => format!("Key {}", existing.len() + 1),
        trimmed => trimmed.to_owned(),
    };

    KeyRecord {
        id: generate_unique_key_id(existing),
        key: secret.to_owned(),
        name,
        active,
        source,
        created_at: Utc::now(),
        last_used: None,
        request_count: 0,
    }
}

fn generate_unique_key_id(existing: &[KeyRecord]) -> String {
    loop {
        let candidate = nanoid!(8);
        if !existing.iter().any(|record| record.id == candidate) {
            return candidate;
        }
    }
}
