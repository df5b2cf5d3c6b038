use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::KeyringError;
use crate::kv::Kv;

/// Owner of a usage counter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UsageSubject {
    Key(String),
    User(String),
}

impl UsageSubject {
    pub fn storage_key(&self) -> String {
        match self {
            UsageSubject::Key(id) => format!("usage:key:{id}"),
            UsageSubject::User(id) => format!("usage:user:{id}"),
        }
    }
}

impl fmt::Display for UsageSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageSubject::Key(id) => write!(f, "key:{id}"),
            UsageSubject::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Outcome of one outbound call.
#[derive(Debug, Clone)]
pub struct UsageSample {
    pub success: bool,
    pub tokens: u64,
    pub response_time_ms: u64,
    pub model: String,
}

/// Accumulated counters for a key or a user.
///
/// `daily_buckets` is indexed by weekday (Sunday = 0) and `hourly_buckets` by
/// UTC hour of day; both are running totals, not rolling windows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub avg_response_time: f64,
    pub daily_buckets: [u64; 7],
    pub hourly_buckets: [u64; 24],
    pub last_used: Option<DateTime<Utc>>,
    /// Requests since the current rate window started.
    pub window_requests: u64,
    pub models: BTreeMap<String, u64>,
}

impl UsageStats {
    pub fn apply(&mut self, sample: &UsageSample, at: DateTime<Utc>) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        self.avg_response_time =
            (self.avg_response_time * (n - 1.0) + sample.response_time_ms as f64) / n;

        self.total_tokens += sample.tokens;
        if sample.success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }

        self.daily_buckets[at.weekday().num_days_from_sunday() as usize] += 1;
        self.hourly_buckets[at.hour() as usize] += 1;
        self.last_used = Some(at);
        self.window_requests += 1;

        if !sample.model.is_empty() {
            *self.models.entry(sample.model.clone()).or_default() += 1;
        }
    }

    /// Failure percentage over finished calls; 0 when nothing was recorded.
    pub fn error_rate(&self) -> f64 {
        let finished = self.success_count + self.fail_count;
        if finished == 0 {
            0.0
        } else {
            self.fail_count as f64 / finished as f64 * 100.0
        }
    }
}

/// Best-effort usage accounting. Nothing here fails the caller: persistence
/// errors are logged and dropped.
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    kv: Kv,
}

impl UsageRecorder {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub async fn record(&self, subject: &UsageSubject, sample: &UsageSample) {
        self.record_at(subject, sample, Utc::now()).await;
    }

    pub async fn record_at(&self, subject: &UsageSubject, sample: &UsageSample, at: DateTime<Utc>) {
        if let Err(err) = self.try_record(subject, sample, at).await {
            warn!(%subject, error = %err, "usage not recorded");
        }
    }

    async fn try_record(
        &self,
        subject: &UsageSubject,
        sample: &UsageSample,
        at: DateTime<Utc>,
    ) -> Result<(), KeyringError> {
        let key = subject.storage_key();
        let mut stats: UsageStats = self.kv.read_json(&key).await?.unwrap_or_default();
        stats.apply(sample, at);
        self.kv.write_json(&key, &stats).await?;
        debug!(%subject, total = stats.total_requests, "usage recorded");
        Ok(())
    }

    pub async fn stats(&self, subject: &UsageSubject) -> Result<Option<UsageStats>, KeyringError> {
        self.kv.read_json(&subject.storage_key()).await
    }

    /// Starts a new rate window for `subject`.
    pub async fn reset_window(&self, subject: &UsageSubject) {
        let key = subject.storage_key();
        let result: Result<(), KeyringError> = async {
            let Some(mut stats) = self.kv.read_json::<UsageStats>(&key).await? else {
                return Ok(());
            };
            stats.window_requests = 0;
            self.kv.write_json(&key, &stats).await
        }
        .await;

        if let Err(err) = result {
            warn!(%subject, error = %err, "rate window not reset");
        }
    }
}
