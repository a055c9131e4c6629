use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::error::DispatchError;
use crate::llm::{Dispatcher, StreamEvent};
use crate::models::{ChatTurn, Credential};
use crate::telemetry;

/**
 * \brief 分发请求体：历史轮次与按请求转发的凭据，凭据不落盘。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
    #[serde(default)]
    pub provider: String,
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<dyn Dispatcher>,
}

/**
 * \brief 构建分发服务路由。
 */
pub fn router(dispatcher: Arc<dyn Dispatcher>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(AppState { dispatcher })
}

/**
 * \brief 启动本地 HTTP 分发服务。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Dispatcher listening on http://{}", addr);
    telemetry::log_event("server", &format!("listening addr={}", addr));
    axum::serve(listener, router(dispatcher)).await?;
    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/**
 * \brief POST /api/chat：校验失败 400，上游在开流前失败 502，否则返回 SSE。
 * \details 客户端断开时 SSE 流被丢弃，drop guard 触发取消并释放上游连接。
 */
async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let credential = Credential {
        id: String::new(),
        name: "request".to_string(),
        provider: req.provider,
        secret: req.api_key,
        is_default: false,
    };
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let mut upstream = state
        .dispatcher
        .stream_completion(&req.messages, &credential, cancel)
        .await
        .map_err(|e| {
            telemetry::log_error("server", &format!("dispatch rejected: {}", e));
            dispatch_status(e)
        })?;
    telemetry::log_event(
        "server",
        &format!(
            "stream provider={} turns={}",
            credential.provider,
            req.messages.len()
        ),
    );

    let events = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = upstream.next().await {
            yield Ok::<Event, Infallible>(to_sse(event));
        }
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::new()))
}

fn to_sse(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Delta(content) => Event::default()
            .event("delta")
            .data(serde_json::json!({ "content": content }).to_string()),
        StreamEvent::Done => Event::default().event("done").data("{}"),
        StreamEvent::Error(message) => Event::default()
            .event("error")
            .data(serde_json::json!({ "message": message }).to_string()),
    }
}

fn dispatch_status(err: DispatchError) -> (StatusCode, String) {
    let status = match err {
        DispatchError::InvalidRequest(_) | DispatchError::Unsupported(_) => {
            StatusCode::BAD_REQUEST
        }
        DispatchError::Upstream(_) => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string())
}
