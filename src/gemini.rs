use std::time::Instant;

use bytes::Bytes;
use reqwest::{
    Client, StatusCode, Url,
    header::{CONTENT_TYPE, HeaderValue},
};
use serde_json::Value;
use tracing::{error, info};

use crate::keys::preview_key;
use crate::rate::{Admission, RateLimit};
use crate::usage::{UsageSample, UsageSubject};
use crate::{KeyRing, KeyringError};

/// Public Gemini API origin.
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Upstream answer passed back to the caller unchanged.
#[derive(Debug, Clone)]
pub struct GeminiResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
    pub tokens: u64,
}

/// Outbound `generateContent` calls using keys from a [`KeyRing`].
#[derive(Clone, Debug)]
pub struct GeminiClient {
    client: Client,
    endpoint: Url,
    keyring: KeyRing,
    caller_limit: Option<RateLimit>,
}

impl GeminiClient {
    pub fn new(keyring: KeyRing, endpoint: &str) -> Result<Self, KeyringError> {
        let endpoint = Url::parse(endpoint).map_err(|source| KeyringError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            source,
        })?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            keyring,
            caller_limit: None,
        })
    }

    /// Admission limit applied per caller before a key is picked.
    pub fn with_caller_limit(mut self, limit: Option<RateLimit>) -> Self {
        self.caller_limit = limit;
        self
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    pub async fn generate_content(
        &self,
        caller: Option<&str>,
        model: &str,
        body: Bytes,
    ) -> Result<GeminiResponse, KeyringError> {
        let model = model.trim();
        if model.is_empty() || model.contains('/') {
            return Err(KeyringError::Validation(format!("invalid model name '{model}'")));
        }

        if let (Some(caller), Some(limit)) = (caller, self.caller_limit) {
            let subject = UsageSubject::User(caller.to_owned());
            if let Admission::Reject(reason) = self.keyring.check_rate(&subject, limit).await {
                return Err(KeyringError::RateLimited(reason));
            }
        }

        let lease = self.keyring.select_key_for_call().await?;
        let url = self.model_url(model);
        let started = Instant::now();

        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, lease.secret.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        let outcome = match response {
            Ok(response) => {
                let status = response.status();
                let content_type = response.headers().get(CONTENT_TYPE).cloned();
                response
                    .bytes()
                    .await
                    .map(|body| (status, content_type, body))
            }
            Err(err) => Err(err),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((status, content_type, body)) => {
                let tokens = total_tokens(&body);
                info!(
                    key = %preview_key(&lease.secret),
                    model,
                    %status,
                    tokens,
                    elapsed_ms,
                    "generateContent"
                );

                let sample = UsageSample {
                    success: status.is_success(),
                    tokens,
                    response_time_ms: elapsed_ms,
                    model: model.to_owned(),
                };
                self.keyring.record_usage(&lease, caller, &sample).await;

                Ok(GeminiResponse {
                    status,
                    content_type,
                    body,
                    tokens,
                })
            }
            Err(err) => {
                error!(
                    key = %preview_key(&lease.secret),
                    model,
                    error = %err,
                    "generateContent failed"
                );

                let sample = UsageSample {
                    success: false,
                    tokens: 0,
                    response_time_ms: elapsed_ms,
                    model: model.to_owned(),
                };
                self.keyring.record_usage(&lease, caller, &sample).await;

                Err(KeyringError::Http(err))
            }
        }
    }

    fn model_url(&self, model: &str) -> Url {
        let mut url = self.endpoint.clone();
        let base = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{base}/v1beta/models/{model}:generateContent"));
        url
    }
}

/// `usageMetadata.totalTokenCount` of a response, or of the last chunk that
/// carries one when the body is a JSON array of chunks.
fn total_tokens(body: &[u8]) -> u64 {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return 0;
    };

    let from = |value: &Value| {
        value
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(Value::as_u64)
    };

    match &value {
        Value::Array(chunks) => chunks.iter().rev().find_map(from),
        other => from(other),
    }
    .unwrap_or(0)
}
