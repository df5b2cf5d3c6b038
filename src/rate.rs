use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::usage::{UsageRecorder, UsageSubject};

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u64,
    pub window_seconds: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            limit: 60,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Reject(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit)
    }
}

/// Fixed-window admission over the counters kept by [`UsageRecorder`].
///
/// Once the window counter reaches the limit, calls are rejected until the
/// subject has been idle for a whole window; the next call then opens a new
/// window. Bursts at window boundaries are possible.
#[derive(Debug, Clone)]
pub struct RateGate {
    usage: UsageRecorder,
}

impl RateGate {
    pub fn new(usage: UsageRecorder) -> Self {
        Self { usage }
    }

    pub async fn check(
        &self,
        subject: &UsageSubject,
        limit: u64,
        window_seconds: u64,
    ) -> Admission {
        self.check_at(subject, limit, window_seconds, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        subject: &UsageSubject,
        limit: u64,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> Admission {
        let stats = match self.usage.stats(subject).await {
            Ok(Some(stats)) => stats,
            Ok(None) => return Admission::Admit,
            Err(err) => {
                warn!(%subject, error = %err, "rate counters unavailable, admitting");
                return Admission::Admit;
            }
        };

        if stats.window_requests < limit {
            return Admission::Admit;
        }

        // Windows too long for a TimeDelta never expire.
        let window = i64::try_from(window_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds);
        let within_window = |last: DateTime<Utc>| {
            window.is_none_or(|window| now.signed_duration_since(last) <= window)
        };
        match stats.last_used {
            Some(last) if within_window(last) => Admission::Reject(format!(
                "{subject} reached {limit} requests per {window_seconds}s"
            )),
            _ => {
                debug!(%subject, "rate window expired, starting a new one");
                self.usage.reset_window(subject).await;
                Admission::Admit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kv::testing::SwitchableKv;
    use crate::kv::{Kv, SqliteKv};
    use crate::usage::UsageSample;

    fn success() -> UsageSample {
        UsageSample {
            success: true,
            tokens: 1,
            response_time_ms: 5,
            model: String::new(),
        }
    }

    async fn gate() -> (RateGate, UsageRecorder) {
        let kv = Kv::new(Arc::new(SqliteKv::in_memory().await.unwrap()), "");
        let recorder = UsageRecorder::new(kv);
        (RateGate::new(recorder.clone()), recorder)
    }

    #[tokio::test]
    async fn rejects_at_limit_and_admits_after_window() {
        let (gate, recorder) = gate().await;
        let user = UsageSubject::User("alice".into());
        let t0 = Utc::now();

        for _ in 0..4 {
            recorder.record_at(&user, &success(), t0).await;
        }
        assert!(gate.check_at(&user, 5, 60, t0).await.is_admitted());

        recorder.record_at(&user, &success(), t0).await;
        let later = t0 + TimeDelta::seconds(10);
        assert!(matches!(
            gate.check_at(&user, 5, 60, later).await,
            Admission::Reject(_)
        ));

        let expired = t0 + TimeDelta::seconds(61);
        assert_eq!(gate.check_at(&user, 5, 60, expired).await, Admission::Admit);
        let stats = recorder.stats(&user).await.unwrap().unwrap();
        assert_eq!(stats.window_requests, 0);
        assert_eq!(stats.total_requests, 5);
    }

    #[tokio::test]
    async fn oversized_window_never_expires() {
        let (gate, recorder) = gate().await;
        let user = UsageSubject::User("carol".into());
        let t0 = Utc::now();
        recorder.record_at(&user, &success(), t0).await;

        let much_later = t0 + TimeDelta::days(365 * 100);
        assert!(matches!(
            gate.check_at(&user, 1, u64::MAX, much_later).await,
            Admission::Reject(_)
        ));
        assert!(matches!(
            gate.check(&user, 1, u64::MAX).await,
            Admission::Reject(_)
        ));
    }

    #[tokio::test]
    async fn unknown_subject_is_admitted() {
        let (gate, _) = gate().await;
        let admission = gate.check(&UsageSubject::Key("new".into()), 1, 60).await;
        assert_eq!(admission, Admission::Admit);
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let backend = SwitchableKv::new().await;
        let recorder = UsageRecorder::new(Kv::new(backend.clone(), ""));
        let gate = RateGate::new(recorder.clone());
        let user = UsageSubject::User("bob".into());
        recorder.record(&user, &success()).await;

        backend.set_down(true);
        assert!(gate.check(&user, 1, 60).await.is_admitted());
    }
}
