use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Parser, Debug)]
struct Cli {
    /// Address to bind the mock Gemini server
    #[arg(long, default_value = "127.0.0.1:58090")]
    bind: SocketAddr,

    /// Tokens reported in usageMetadata for every successful call
    #[arg(long, default_value_t = 12)]
    tokens: u64,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
struct ForcedResponse {
    #[serde(default)]
    http_status: Option<u16>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    once: bool,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[derive(Default, Clone, Serialize)]
struct SnapshotState {
    calls_by_key: HashMap<String, u64>,
    forced: Option<ForcedResponse>,
}

struct AppState {
    tokens: u64,
    inner: RwLock<SnapshotState>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    let state = Arc::new(AppState {
        tokens: cli.tokens,
        inner: RwLock::new(SnapshotState::default()),
    });
    let app = Router::new()
        .route("/v1beta/models/:target", post(generate))
        .route(
            "/admin/force-response",
            post(set_forced_response).delete(clear_forced_response),
        )
        .route("/admin/state", get(read_state))
        .with_state(state);

    info!("mock Gemini upstream listening on http://{}", cli.bind);
    axum::serve(tokio::net::TcpListener::bind(cli.bind).await?, app).await?;
    Ok(())
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let Some(model) = target.strip_suffix(":generateContent") else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": 404, "message": "unknown method"}})),
        );
    };

    let Some(key) = headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
    else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": {"code": 403, "status": "PERMISSION_DENIED"}})),
        );
    };

    let forced = {
        let mut inner = state.inner.write().await;
        *inner.calls_by_key.entry(key.clone()).or_default() += 1;
        let forced = inner.forced.clone();
        if forced.as_ref().is_some_and(|f| f.once) {
            inner.forced = None;
        }
        forced
    };

    if let Some(forced) = forced {
        if let Some(delay) = forced.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let status = forced
            .http_status
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::OK);
        let body = forced.body.unwrap_or_else(|| json!({}));
        return (status, Json(body));
    }

    let preview: String = key.chars().take(8).collect();
    (
        StatusCode::OK,
        Json(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"text": format!("mock reply from {model} via {preview}…")}]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": state.tokens / 2,
                "candidatesTokenCount": state.tokens - state.tokens / 2,
                "totalTokenCount": state.tokens
            }
        })),
    )
}

async fn set_forced_response(
    State(state): State<Arc<AppState>>,
    Json(forced): Json<ForcedResponse>,
) -> StatusCode {
    state.inner.write().await.forced = Some(forced);
    StatusCode::NO_CONTENT
}

async fn clear_forced_response(State(state): State<Arc<AppState>>) -> StatusCode {
    state.inner.write().await.forced = None;
    StatusCode::NO_CONTENT
}

async fn read_state(State(state): State<Arc<AppState>>) -> Json<SnapshotState> {
    Json(state.inner.read().await.clone())
}
