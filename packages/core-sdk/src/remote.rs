use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::llm::{validate, CompletionStream, Dispatcher, StreamEvent};
use crate::models::{ChatTurn, Credential};
use crate::server::ChatRequest;
use crate::sse::{relay, SseFrame};

/**
 * \brief 通过分发服务（`POST /api/chat`）转发请求的客户端实现。
 */
#[derive(Debug, Clone)]
pub struct RemoteDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteDispatcher {
    /**
     * \param base 服务基地址，如 "http://127.0.0.1:5173"
     */
    pub fn new(base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/chat", base.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Dispatcher for RemoteDispatcher {
    async fn stream_completion(
        &self,
        history: &[ChatTurn],
        credential: &Credential,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, DispatchError> {
        validate(credential)?;
        let body = ChatRequest {
            messages: history.to_vec(),
            api_key: credential.secret.clone(),
            provider: credential.provider.clone(),
        };
        let send = self.client.post(&self.endpoint).json(&body).send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let empty: CompletionStream = Box::pin(futures_util::stream::empty());
                return Ok(empty);
            }
            resp = send => resp
                .map_err(|e| DispatchError::Upstream(format!("dispatcher unreachable: {}", e)))?,
        };

        let status = resp.status();
        if status.is_client_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(client_error(&text));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let text = text.strip_prefix("upstream error: ").unwrap_or(&text);
            return Err(DispatchError::Upstream(format!("{} -> {}", status, text)));
        }
        Ok(relay(resp, cancel, interpret))
    }
}

fn client_error(text: &str) -> DispatchError {
    if let Some(provider) = text.strip_prefix("Unsupported provider: ") {
        return DispatchError::Unsupported(provider.to_string());
    }
    let text = text.strip_prefix("invalid request: ").unwrap_or(text);
    DispatchError::InvalidRequest(text.to_string())
}

fn interpret(frame: &SseFrame) -> Vec<StreamEvent> {
    let v: Value = serde_json::from_str(&frame.data).unwrap_or(Value::Null);
    let field = |name: &str| v.get(name).and_then(|s| s.as_str()).map(str::to_string);
    let event = match frame.event.as_deref() {
        Some("delta") => field("content").map(StreamEvent::Delta),
        Some("done") => Some(StreamEvent::Done),
        Some("error") => Some(StreamEvent::Error(
            field("message").unwrap_or_else(|| "unknown error".to_string()),
        )),
        _ => None,
    };
    event.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_server_events() {
        let delta = SseFrame {
            event: Some("delta".to_string()),
            data: r#"{"content":"a\nb"}"#.to_string(),
        };
        assert_eq!(interpret(&delta), vec![StreamEvent::Delta("a\nb".to_string())]);
        let err = SseFrame {
            event: Some("error".to_string()),
            data: "not json".to_string(),
        };
        assert_eq!(
            interpret(&err),
            vec![StreamEvent::Error("unknown error".to_string())]
        );
    }

    #[test]
    fn test_client_error_mapping() {
        assert_eq!(
            client_error("Unsupported provider: other"),
            DispatchError::Unsupported("other".to_string())
        );
        assert_eq!(
            client_error("invalid request: API key is required"),
            DispatchError::InvalidRequest("API key is required".to_string())
        );
    }
}
