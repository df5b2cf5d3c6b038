use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, Response, StatusCode, header::CONTENT_TYPE},
    response::Json,
    routing::{delete, get, patch, post},
};
use gemini_keyring::{GeminiClient, KeyRecord, KeyringError, UsageStats, Visibility};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    client: GeminiClient,
    forward_auth: ForwardAuthConfig,
    caller_header: Option<HeaderName>,
}

#[derive(Clone, Debug, Default)]
pub struct ForwardAuthConfig {
    user_header: Option<HeaderName>,
    admin_value: Option<String>,
    nickname_header: Option<HeaderName>,
    admin_override_name: Option<String>,
}

impl ForwardAuthConfig {
    pub fn new(
        user_header: Option<HeaderName>,
        admin_value: Option<String>,
        nickname_header: Option<HeaderName>,
        admin_override_name: Option<String>,
    ) -> Self {
        Self {
            user_header,
            admin_value,
            nickname_header,
            admin_override_name,
        }
    }

    fn is_enabled(&self) -> bool {
        self.user_header.is_some() || self.admin_override_name.is_some()
    }

    fn user_value<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        self.user_header
            .as_ref()
            .and_then(|name| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
    }

    fn nickname_value(&self, headers: &HeaderMap) -> Option<String> {
        self.nickname_header
            .as_ref()
            .and_then(|name| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn is_request_admin(&self, headers: &HeaderMap) -> bool {
        if self.admin_override_name.is_some() {
            return true;
        }

        if !self.is_enabled() {
            return false;
        }

        match (self.admin_value.as_deref(), self.user_value(headers)) {
            (Some(expected), Some(actual)) => actual == expected,
            _ => false,
        }
    }

    fn visibility(&self, headers: &HeaderMap) -> Visibility {
        if self.is_request_admin(headers) {
            Visibility::Full
        } else {
            Visibility::Redacted
        }
    }
}

fn status_for(err: &KeyringError) -> StatusCode {
    match err {
        KeyringError::Validation(_) => StatusCode::BAD_REQUEST,
        KeyringError::DuplicateKey => StatusCode::CONFLICT,
        KeyringError::NotFound(_) => StatusCode::NOT_FOUND,
        KeyringError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        KeyringError::NoActiveKeys | KeyringError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        KeyringError::Http(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(action: &str, err: KeyringError) -> StatusCode {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(action, error = %err, "request failed");
    } else {
        warn!(action, error = %err, "request rejected");
    }
    status
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileView {
    display_name: Option<String>,
    is_admin: bool,
}

async fn get_profile(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<ProfileView> {
    let config = &state.forward_auth;

    if let Some(name) = config.admin_override_name.as_deref() {
        return Json(ProfileView {
            display_name: Some(name.to_owned()),
            is_admin: true,
        });
    }

    let display_name = config
        .nickname_value(&headers)
        .or_else(|| config.user_value(&headers).map(str::to_string));

    Json(ProfileView {
        is_admin: display_name.is_some() && config.is_request_admin(&headers),
        display_name,
    })
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<KeyRecord>>, StatusCode> {
    let visibility = state.forward_auth.visibility(&headers);
    state
        .client
        .keyring()
        .list_keys(visibility)
        .await
        .map(Json)
        .map_err(|err| reject("list keys", err))
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    api_key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    active: Option<bool>,
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<KeyRecord>), StatusCode> {
    if !state.forward_auth.is_request_admin(&headers) {
        return Err(StatusCode::FORBIDDEN);
    }

    let name = payload.name.as_deref().unwrap_or_default();
    let active = payload.active.unwrap_or(true);
    state
        .client
        .keyring()
        .add_key(&payload.api_key, name, active)
        .await
        .map(|record| (StatusCode::CREATED, Json(record)))
        .map_err(|err| reject("create api key", err))
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    if !state.forward_auth.is_request_admin(&headers) {
        return Err(StatusCode::FORBIDDEN);
    }

    state
        .client
        .keyring()
        .remove_key(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| reject("delete api key", err))
}

#[derive(Debug, Deserialize)]
struct UpdateKeyStatus {
    active: bool,
}

async fn update_api_key_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateKeyStatus>,
) -> Result<Json<KeyRecord>, StatusCode> {
    if !state.forward_auth.is_request_admin(&headers) {
        return Err(StatusCode::FORBIDDEN);
    }

    state
        .client
        .keyring()
        .toggle_key(&id, payload.active)
        .await
        .map(Json)
        .map_err(|err| reject("update api key status", err))
}

#[derive(Debug, Serialize)]
struct ApiKeySecretView {
    api_key: String,
}

async fn get_api_key_secret(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiKeySecretView>, StatusCode> {
    if !state.forward_auth.is_request_admin(&headers) {
        return Err(StatusCode::FORBIDDEN);
    }

    match state.client.keyring().key_secret(&id).await {
        Ok(Some(api_key)) => Ok(Json(ApiKeySecretView { api_key })),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => Err(reject("fetch api key secret", err)),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsView {
    #[serde(flatten)]
    stats: UsageStats,
    error_rate: f64,
}

impl From<UsageStats> for StatsView {
    fn from(stats: UsageStats) -> Self {
        Self {
            error_rate: stats.error_rate(),
            stats,
        }
    }
}

async fn get_key_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatsView>, StatusCode> {
    state
        .client
        .keyring()
        .get_stats(&id)
        .await
        .map(|stats| Json(stats.into()))
        .map_err(|err| reject("key stats", err))
}

async fn get_user_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatsView>, StatusCode> {
    match state.client.keyring().user_stats(&id).await {
        Ok(Some(stats)) => Ok(Json(stats.into())),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => Err(reject("user stats", err)),
    }
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, StatusCode> {
    let Some(model) = target.strip_suffix(":generateContent") else {
        return Err(StatusCode::NOT_FOUND);
    };

    let caller = state
        .caller_header
        .as_ref()
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let response = state
        .client
        .generate_content(caller, model, body)
        .await
        .map_err(|err| reject("generate content", err))?;

    let mut builder = Response::builder().status(response.status);
    if let Some(content_type) = response.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(response.body))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn build_router(
    client: GeminiClient,
    forward_auth: ForwardAuthConfig,
    caller_header: Option<HeaderName>,
) -> Router {
    let state = Arc::new(AppState {
        client,
        forward_auth,
        caller_header,
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/api/profile", get(get_profile))
        .route("/api/keys", get(list_keys))
        .route("/api/keys", post(create_api_key))
        .route("/api/keys/:id", delete(delete_api_key))
        .route("/api/keys/:id/status", patch(update_api_key_status))
        .route("/api/keys/:id/secret", get(get_api_key_secret))
        .route("/api/keys/:id/stats", get(get_key_stats))
        .route("/api/users/:id/stats", get(get_user_stats))
        .route("/v1beta/models/:target", post(generate_handler))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    client: GeminiClient,
    forward_auth: ForwardAuthConfig,
    caller_header: Option<HeaderName>,
) -> Result<(), Box<dyn std::error::Error>> {
    let router = build_router(client, forward_auth, caller_header);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    info!("gemini keyring listening on http://{bound_addr}");

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{Method, Request};
    use gemini_keyring::{DEFAULT_ENDPOINT, KeyRing, Kv, SqliteKv};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    const ADMIN_HEADER: &str = "x-forwarded-user";

    async fn app() -> (Router, KeyRing) {
        let kv = Kv::new(Arc::new(SqliteKv::in_memory().await.unwrap()), "");
        let keyring = KeyRing::new(kv, Vec::new());
        let client = GeminiClient::new(keyring.clone(), DEFAULT_ENDPOINT).unwrap();
        let auth = ForwardAuthConfig::new(
            Some(HeaderName::from_static(ADMIN_HEADER)),
            Some("root".into()),
            None,
            None,
        );
        let router = build_router(client, auth, Some(HeaderName::from_static("x-user-id")));
        (router, keyring)
    }

    fn request(method: Method, uri: &str, admin: bool, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if admin {
            builder = builder.header(ADMIN_HEADER, "root");
        }
        match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn key_management_requires_admin() {
        let (app, _) = app().await;
        let response = app
            .oneshot(request(
                Method::POST,
                "/api/keys",
                false,
                Some(json!({"api_key": "sk-secret-value"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn create_list_toggle_delete() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/keys",
                true,
                Some(json!({"api_key": "sk-secret-value", "name": "Primary"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        let id = created["id"].as_str().unwrap().to_owned();

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/keys",
                true,
                Some(json!({"api_key": "sk-secret-value"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/keys", false, None))
            .await
            .unwrap();
        let listed = json_body(response).await;
        assert_eq!(listed[0]["key"], "sk-secre…");
        assert_eq!(listed[0]["name"], "Primary");

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/keys", true, None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await[0]["key"], "sk-secret-value");

        let response = app
            .clone()
            .oneshot(request(
                Method::PATCH,
                &format!("/api/keys/{id}/status"),
                true,
                Some(json!({"active": false})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["active"], false);

        let response = app
            .clone()
            .oneshot(request(Method::GET, &format!("/api/keys/{id}/stats"), false, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = json_body(response).await;
        assert_eq!(stats["totalRequests"], 0);
        assert_eq!(stats["errorRate"], 0.0);

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, &format!("/api/keys/{id}"), true, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request(Method::DELETE, &format!("/api/keys/{id}"), true, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_secret_is_bad_request() {
        let (app, _) = app().await;
        let response = app
            .oneshot(request(
                Method::POST,
                "/api/keys",
                true,
                Some(json!({"api_key": "  "})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn generate_without_keys_is_unavailable() {
        let (app, _) = app().await;
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/v1beta/models/gemini-pro:generateContent",
                false,
                Some(json!({"contents": []})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(request(
                Method::POST,
                "/v1beta/models/gemini-pro:countTokens",
                false,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn profile_and_secret_follow_forward_auth() {
        let (app, keyring) = app().await;
        let record = keyring.add_key("sk-hidden", "h", true).await.unwrap();

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/profile", true, None))
            .await
            .unwrap();
        let profile = json_body(response).await;
        assert_eq!(profile["displayName"], "root");
        assert_eq!(profile["isAdmin"], true);

        let uri = format!("/api/keys/{}/secret", record.id);
        let response = app
            .clone()
            .oneshot(request(Method::GET, &uri, false, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(request(Method::GET, &uri, true, None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["api_key"], "sk-hidden");

        let response = app
            .oneshot(request(Method::GET, "/api/users/nobody/stats", false, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
