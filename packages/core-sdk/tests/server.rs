use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use studiochat_core_sdk::prelude::*;
use studiochat_core_sdk::server;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn openai_stream(chunks: &[&str]) -> ResponseTemplate {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": chunk}}]})
        ));
    }
    body.push_str("data: [DONE]\n\n");
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

/**
 * \brief 在临时端口启动分发服务，上游指向 `upstream`。
 */
async fn spawn_service(upstream: &MockServer) -> String {
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(ProviderDispatcher::new(
        DispatcherConfig::with_base(&upstream.uri()),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(dispatcher))
            .await
            .unwrap();
    });
    format!("http://{}", addr)
}

async fn post_chat(base: &str, body: serde_json::Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let upstream = MockServer::start().await;
    let base = spawn_service(&upstream).await;
    let v: serde_json::Value = reqwest::get(format!("{}/api/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(v, serde_json::json!({"ok": true}));
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_with_400() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(openai_stream(&["never"]))
        .expect(0)
        .mount(&upstream)
        .await;
    let base = spawn_service(&upstream).await;

    let resp = post_chat(
        &base,
        serde_json::json!({"messages": [{"role": "user", "content": "hi"}], "provider": "openai"}),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert!(resp.text().await.unwrap().contains("API key is required"));

    let resp = post_chat(
        &base,
        serde_json::json!({"messages": [], "apiKey": "k", "provider": "other"}),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), "Unsupported provider: other");
}

#[tokio::test]
async fn test_upstream_failure_is_502() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(serde_json::json!({"error": {"message": "boom"}})),
        )
        .mount(&upstream)
        .await;
    let base = spawn_service(&upstream).await;

    let resp = post_chat(
        &base,
        serde_json::json!({"messages": [], "apiKey": "k", "provider": "openai"}),
    )
    .await;
    assert_eq!(resp.status(), 502);

    let remote = RemoteDispatcher::new(&base);
    let err = remote
        .stream_completion(
            &[ChatTurn::user("hi")],
            &Credential::new("c", "openai", "k"),
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
    match err {
        DispatchError::Upstream(msg) => assert!(msg.contains("boom"), "{msg}"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_sse_body_carries_delta_and_done_events() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(openai_stream(&["Hi", " there"]))
        .mount(&upstream)
        .await;
    let base = spawn_service(&upstream).await;

    let resp = post_chat(
        &base,
        serde_json::json!({
            "messages": [{"role": "user", "content": "hello"}],
            "apiKey": "k",
            "provider": "openai"
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    let hi = body.find("event: delta\ndata: {\"content\":\"Hi\"}").unwrap();
    let there = body.find("{\"content\":\" there\"}").unwrap();
    let done = body.find("event: done").unwrap();
    assert!(hi < there && there < done);
}

#[tokio::test]
async fn test_remote_dispatcher_relays_stream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(openai_stream(&["line one\n", "line two"]))
        .mount(&upstream)
        .await;
    let base = spawn_service(&upstream).await;

    let remote = RemoteDispatcher::new(&format!("{}/", base));
    let events: Vec<StreamEvent> = remote
        .stream_completion(
            &[ChatTurn::user("hello")],
            &Credential::new("c", "openai", "k"),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("line one\n".to_string()),
            StreamEvent::Delta("line two".to_string()),
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn test_remote_dispatcher_maps_in_stream_error() {
    let upstream = MockServer::start().await;
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\ndata: {\"error\":{\"message\":\"overloaded\"}}\n\n";
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&upstream)
        .await;
    let base = spawn_service(&upstream).await;

    let remote = RemoteDispatcher::new(&base);
    let events: Vec<StreamEvent> = remote
        .stream_completion(
            &[ChatTurn::user("hello")],
            &Credential::new("c", "openai", "k"),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("par".to_string()),
            StreamEvent::Error("overloaded".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_session_through_dispatch_service() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(openai_stream(&["Hi", " there"]))
        .expect(1)
        .mount(&upstream)
        .await;
    let base = spawn_service(&upstream).await;

    let store = Store::open_in_memory().unwrap();
    store
        .add_credential(Credential::new("main", "openai", "k"))
        .await
        .unwrap();
    let mut session = SessionController::new(store.clone(), Arc::new(RemoteDispatcher::new(&base)));
    let conversation = session.new_conversation().await.unwrap();

    session.submit("hello").await.unwrap();
    assert_eq!(session.run_to_idle().await, Progress::Finished);
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.last_error().is_none());

    let stored = store.get_messages(&conversation.id).await.unwrap();
    let turns: Vec<(Role, &str)> = stored
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        turns,
        vec![(Role::User, "hello"), (Role::Assistant, "Hi there")]
    );
}

/**
 * \brief 每 20ms 产出一个增量、永不结束的分发器，记录收到的取消令牌。
 */
#[derive(Default)]
struct EndlessDispatcher {
    cancel: Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl Dispatcher for EndlessDispatcher {
    async fn stream_completion(
        &self,
        _history: &[ChatTurn],
        _credential: &Credential,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, DispatchError> {
        *self.cancel.lock().unwrap() = Some(cancel.clone());
        let ticks = futures_util::stream::unfold((), |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Some((StreamEvent::Delta("tick".to_string()), ()))
        });
        Ok(Box::pin(ticks.take_until(cancel.cancelled_owned())))
    }
}

#[tokio::test]
async fn test_client_disconnect_cancels_upstream() {
    let dispatcher = Arc::new(EndlessDispatcher::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(dispatcher.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let resp = post_chat(
        &format!("http://{}", addr),
        serde_json::json!({"messages": [], "apiKey": "k", "provider": "openai"}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let mut body = resp.bytes_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("tick"));

    let token = dispatcher.cancel.lock().unwrap().clone().unwrap();
    assert!(!token.is_cancelled());
    drop(body);
    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("upstream cancelled after client disconnect");
}
