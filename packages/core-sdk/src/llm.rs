use async_trait::async_trait;
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::models::{ChatTurn, Credential, Role};
use crate::sse::{relay, SseFrame};
use crate::telemetry;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/**
 * \brief 流式补全事件：增量文本，或终止于完成/错误。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Delta(_))
    }
}

/**
 * \brief 惰性、有限、不可重启的事件序列。
 */
pub type CompletionStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/**
 * \brief Provider 分发能力：接收有序的 role/content 轮次，返回增量文本流。
 */
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /**
     * \brief 打开一次补全流。
     * \details 凭据非法时在任何网络活动之前失败；取消令牌触发后流结束且不发送终止事件。
     */
    async fn stream_completion(
        &self,
        history: &[ChatTurn],
        credential: &Credential,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, DispatchError>;
}

/**
 * \brief Provider 端点与模型配置。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub openai_base: String,
    pub openai_model: String,
    pub anthropic_base: String,
    pub anthropic_model: String,
    pub google_base: String,
    pub google_model: String,
    pub max_tokens: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            openai_base: "https://api.openai.com".to_string(),
            openai_model: "gpt-3.5-turbo".to_string(),
            anthropic_base: "https://api.anthropic.com".to_string(),
            anthropic_model: "claude-3-5-sonnet-latest".to_string(),
            google_base: "https://generativelanguage.googleapis.com".to_string(),
            google_model: "gemini-1.5-flash".to_string(),
            max_tokens: 1024,
        }
    }
}

impl DispatcherConfig {
    /**
     * \brief 所有 Provider 指向同一基地址，便于本地联调。
     */
    pub fn with_base(base: &str) -> Self {
        Self {
            openai_base: base.to_string(),
            anthropic_base: base.to_string(),
            google_base: base.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Google,
}

impl ProviderKind {
    pub fn parse(provider: &str) -> Result<Self, DispatchError> {
        match provider.trim().to_ascii_lowercase().as_str() {
            "" => Err(DispatchError::InvalidRequest(
                "Provider is required".to_string(),
            )),
            "openai" => Ok(ProviderKind::OpenAI),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Google),
            _ => Err(DispatchError::Unsupported(provider.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
        }
    }

    /**
     * \brief 把一个上游 SSE 事件翻译为流事件；与文本无关的事件不产生输出。
     * \details 结束标记：OpenAI `[DONE]`，Anthropic `message_stop`，Gemini 候选中的 `finishReason`。
     */
    fn interpret(self, frame: &SseFrame) -> Vec<StreamEvent> {
        let data = frame.data.trim();
        if self == ProviderKind::OpenAI && data == "[DONE]" {
            return vec![StreamEvent::Done];
        }
        let Ok(v) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        if let Some(message) = error_message(&v) {
            return vec![StreamEvent::Error(message)];
        }
        let mut events = Vec::new();
        match self {
            ProviderKind::OpenAI => {
                if let Some(text) = v
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("delta"))
                    .and_then(|d| d.get("content"))
                    .and_then(|t| t.as_str())
                {
                    push_delta(&mut events, text);
                }
            }
            ProviderKind::Anthropic => {
                let kind = v
                    .get("type")
                    .and_then(|t| t.as_str())
                    .or(frame.event.as_deref());
                match kind {
                    Some("content_block_delta") => {
                        if let Some(text) = v
                            .get("delta")
                            .and_then(|d| d.get("text"))
                            .and_then(|t| t.as_str())
                        {
                            push_delta(&mut events, text);
                        }
                    }
                    Some("message_stop") => events.push(StreamEvent::Done),
                    _ => {}
                }
            }
            ProviderKind::Google => {
                push_delta(&mut events, &extract_gemini_text(&v));
                if gemini_finished(&v) {
                    events.push(StreamEvent::Done);
                }
            }
        }
        events
    }
}

fn push_delta(events: &mut Vec<StreamEvent>, text: &str) {
    if !text.is_empty() {
        events.push(StreamEvent::Delta(text.to_string()));
    }
}

/**
 * \brief 校验凭据并解析 Provider 类型，不产生任何网络请求。
 */
pub fn validate(credential: &Credential) -> Result<ProviderKind, DispatchError> {
    if credential.secret.trim().is_empty() {
        return Err(DispatchError::InvalidRequest(
            "API key is required".to_string(),
        ));
    }
    ProviderKind::parse(&credential.provider)
}

/**
 * \brief 直连各 Provider 的分发器。每次调用恰好打开一条上游流。
 */
#[derive(Debug, Clone)]
pub struct ProviderDispatcher {
    client: reqwest::Client,
    config: DispatcherConfig,
}

impl Default for ProviderDispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl ProviderDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn build_request(
        &self,
        kind: ProviderKind,
        history: &[ChatTurn],
        credential: &Credential,
    ) -> Result<reqwest::RequestBuilder, DispatchError> {
        let secret = credential.secret.trim();
        let invalid_key =
            |_| DispatchError::InvalidRequest("API key contains invalid characters".to_string());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let request = match kind {
            ProviderKind::OpenAI => {
                let url = format!(
                    "{}/v1/chat/completions",
                    self.config.openai_base.trim_end_matches('/')
                );
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", secret)).map_err(invalid_key)?,
                );
                let body = json!({
                    "model": self.config.openai_model,
                    "messages": history,
                    "stream": true
                });
                self.client.post(url).headers(headers).json(&body)
            }
            ProviderKind::Anthropic => {
                let url = format!(
                    "{}/v1/messages",
                    self.config.anthropic_base.trim_end_matches('/')
                );
                headers.insert("x-api-key", HeaderValue::from_str(secret).map_err(invalid_key)?);
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
                let body = json!({
                    "model": self.config.anthropic_model,
                    "max_tokens": self.config.max_tokens,
                    "messages": anthropic_payload(history),
                    "stream": true
                });
                self.client.post(url).headers(headers).json(&body)
            }
            ProviderKind::Google => {
                let url = format!(
                    "{}/models/{}:streamGenerateContent",
                    normalize_gemini_base(&self.config.google_base),
                    self.config.google_model
                );
                headers.insert(
                    "x-goog-api-key",
                    HeaderValue::from_str(secret).map_err(invalid_key)?,
                );
                let body = json!({
                    "contents": gemini_payload(history),
                    "generationConfig": {"maxOutputTokens": self.config.max_tokens}
                });
                self.client
                    .post(url)
                    .query(&[("alt", "sse")])
                    .headers(headers)
                    .json(&body)
            }
        };
        Ok(request)
    }
}

#[async_trait]
impl Dispatcher for ProviderDispatcher {
    async fn stream_completion(
        &self,
        history: &[ChatTurn],
        credential: &Credential,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, DispatchError> {
        let kind = validate(credential)?;
        let request = self.build_request(kind, history, credential)?;
        telemetry::log_event(
            "dispatch",
            &format!("open provider={} turns={}", kind.as_str(), history.len()),
        );

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let empty: CompletionStream = Box::pin(futures_util::stream::empty());
                return Ok(empty);
            }
            resp = request.send() => resp.map_err(|e| {
                telemetry::log_error("dispatch", &format!("connect failed: {}", e));
                DispatchError::Upstream(format!("connection failed: {}", e))
            })?,
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| error_message(&v))
                .unwrap_or(text);
            telemetry::log_error(
                "dispatch",
                &format!("provider={} status={}", kind.as_str(), status),
            );
            return Err(DispatchError::Upstream(format!(
                "{} request failed: {} -> {}",
                kind.as_str(),
                status,
                detail
            )));
        }

        Ok(relay(resp, cancel, move |frame| kind.interpret(frame)))
    }
}

fn error_message(v: &Value) -> Option<String> {
    let err = v.get("error")?;
    Some(
        err.get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| err.to_string()),
    )
}

fn extract_gemini_text(v: &Value) -> String {
    v.get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn gemini_finished(v: &Value) -> bool {
    v.get("candidates")
        .and_then(|c| c.as_array())
        .is_some_and(|candidates| {
            candidates
                .iter()
                .any(|c| c.get("finishReason").and_then(|r| r.as_str()).is_some())
        })
}

fn anthropic_payload(history: &[ChatTurn]) -> Vec<Value> {
    history
        .iter()
        .map(|turn| {
            json!({
                "role": turn.role.as_str(),
                "content": [{"type": "text", "text": turn.content}]
            })
        })
        .collect()
}

fn gemini_payload(history: &[ChatTurn]) -> Vec<Value> {
    history
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::Assistant => "model",
                Role::User => "user",
            };
            json!({
                "role": role,
                "parts": [{"text": turn.content}]
            })
        })
        .collect()
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}
