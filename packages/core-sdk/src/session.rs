use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::db::Store;
use crate::error::ChatError;
use crate::llm::{CompletionStream, Dispatcher, StreamEvent};
use crate::models::{now_rfc3339, ChatTurn, Conversation, Credential, Message, Role};
use crate::telemetry;

/**
 * \brief 当前会话的请求状态。终止错误后回到 `Idle`，并通过 `last_error` 给出可见提示。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
}

/**
 * \brief `pump` 单步处理的结果。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /** \brief 没有进行中的流 */
    Idle,
    /** \brief 追加了一段增量 */
    Delta,
    /** \brief 完成并已落库 */
    Finished,
    /** \brief 上游或存储失败，占位消息已处理 */
    Failed,
    /** \brief 被取消，部分内容已丢弃 */
    Cancelled,
}

struct InFlight {
    conversation_id: String,
    placeholder_id: String,
    stream: CompletionStream,
    cancel: CancellationToken,
}

/**
 * \brief 会话控制器：维护活动会话的内存消息列表，合并用户轮次与助手流，并同步到存储。
 * \details 单线程协作式：调用方在自己的事件循环中交替调用 `pump` 与其他操作。
 */
pub struct SessionController {
    store: Store,
    dispatcher: Arc<dyn Dispatcher>,
    active: Option<Conversation>,
    messages: Vec<Message>,
    state: SessionState,
    last_error: Option<String>,
    inflight: Option<InFlight>,
}

impl SessionController {
    pub fn new(store: Store, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            active: None,
            messages: Vec::new(),
            state: SessionState::Idle,
            last_error: None,
            inflight: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active.as_ref()
    }

    /**
     * \brief 渲染用消息列表，可能包含尚未落库的助手占位消息。
     */
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /**
     * \brief 是否允许发送：空闲、存在活动会话且已选择凭据。
     */
    pub fn can_send(&self) -> bool {
        self.state == SessionState::Idle
            && self
                .active
                .as_ref()
                .is_some_and(|c| c.selected_credential_id.is_some())
    }

    /**
     * \brief 当前流的取消令牌，供外部（如 Ctrl-C）取消。
     */
    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.inflight.as_ref().map(|f| f.cancel.clone())
    }

    pub async fn list_credentials(&mut self) -> Result<Vec<Credential>, ChatError> {
        let result = self.store.list_credentials().await.map_err(ChatError::from);
        self.surface(result)
    }

    pub async fn list_conversations(&mut self) -> Result<Vec<Conversation>, ChatError> {
        let result = self
            .store
            .list_conversations()
            .await
            .map_err(ChatError::from);
        self.surface(result)
    }

    /**
     * \brief 读取任意会话的已落库消息（按 sequence）。
     */
    pub async fn get_messages(&mut self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let result = self
            .store
            .get_messages(conversation_id)
            .await
            .map_err(ChatError::from);
        self.surface(result)
    }

    /**
     * \brief 新建会话并设为活动会话；进行中的流先被取消。
     */
    pub async fn new_conversation(&mut self) -> Result<Conversation, ChatError> {
        self.abort_inflight("new conversation");
        let result = self
            .store
            .create_conversation(None)
            .await
            .map_err(ChatError::from);
        let conversation = self.surface(result)?;
        telemetry::log_event("session", &format!("new conversation id={}", conversation.id));
        self.active = Some(conversation.clone());
        self.messages.clear();
        Ok(conversation)
    }

    /**
     * \brief 切换活动会话：先中止进行中的流，再加载新会话的历史。
     */
    pub async fn open_conversation(&mut self, id: &str) -> Result<(), ChatError> {
        self.abort_inflight("switch conversation");
        let result = self.load(id).await;
        let (conversation, messages) = self.surface(result)?;
        self.active = Some(conversation);
        self.messages = messages;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<(Conversation, Vec<Message>), ChatError> {
        let conversation = self
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| ChatError::Validation(format!("conversation {} not found", id)))?;
        let messages = self.store.get_messages(id).await?;
        Ok((conversation, messages))
    }

    pub fn close_conversation(&mut self) {
        self.abort_inflight("close conversation");
        self.active = None;
        self.messages.clear();
    }

    pub async fn rename_conversation(&mut self, id: &str, title: &str) -> Result<(), ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return self.surface(Err(ChatError::Validation(
                "title must not be empty".to_string(),
            )));
        }
        let result = self
            .store
            .rename_conversation(id, title)
            .await
            .map_err(ChatError::from);
        self.surface(result)?;
        if let Some(active) = self.active.as_mut().filter(|c| c.id == id) {
            active.title = title.to_string();
        }
        Ok(())
    }

    /**
     * \brief 删除会话（级联删除消息）；若为活动会话则先中止流并清空。
     */
    pub async fn delete_conversation(&mut self, id: &str) -> Result<(), ChatError> {
        if self.active.as_ref().is_some_and(|c| c.id == id) {
            self.close_conversation();
        }
        let result = self
            .store
            .delete_conversation(id)
            .await
            .map_err(ChatError::from);
        self.surface(result)
    }

    /**
     * \brief 为活动会话选择凭据；`None` 表示禁用发送。
     */
    pub async fn select_credential(&mut self, credential_id: Option<&str>) -> Result<(), ChatError> {
        let id = self.require_active()?.id.clone();
        let result = self
            .store
            .select_credential(&id, credential_id)
            .await
            .map_err(ChatError::from);
        self.surface(result)?;
        if let Some(active) = self.active.as_mut() {
            active.selected_credential_id = credential_id.map(str::to_string);
        }
        Ok(())
    }

    pub async fn select_server(&mut self, server_id: Option<&str>) -> Result<(), ChatError> {
        let id = self.require_active()?.id.clone();
        let result = self
            .store
            .select_server(&id, server_id)
            .await
            .map_err(ChatError::from);
        self.surface(result)?;
        if let Some(active) = self.active.as_mut() {
            active.selected_server_id = server_id.map(str::to_string);
        }
        Ok(())
    }

    /**
     * \brief 提交用户消息：落库用户轮次，追加本地占位消息并打开补全流。
     * \details 成功后状态为 `Streaming`，由 `pump` 逐个消费事件。已有的流会先被取消。
     */
    pub async fn submit(&mut self, text: &str) -> Result<(), ChatError> {
        self.last_error = None;
        if text.trim().is_empty() {
            return self.surface(Err(ChatError::Validation("message is empty".to_string())));
        }
        let conversation = self.require_active()?.clone();
        self.abort_inflight("resubmit");

        let credential = match self.resolve_credential(&conversation).await {
            Ok(credential) => credential,
            Err(err) => return self.surface(Err(err)),
        };

        self.state = SessionState::Sending;
        let user = Message::new(&conversation.id, Role::User, text);
        self.messages.push(user.clone());
        match self.store.append_message(user).await {
            Ok(stored) => {
                if let Some(slot) = self.messages.iter_mut().rev().find(|m| m.id == stored.id) {
                    *slot = stored;
                }
            }
            Err(err) => return self.surface(Err(err.into())),
        }

        let history: Vec<ChatTurn> = self
            .messages
            .iter()
            .filter(|m| m.sequence.is_some())
            .map(Message::to_turn)
            .collect();
        let placeholder = Message::new(&conversation.id, Role::Assistant, "");
        let placeholder_id = placeholder.id.clone();
        self.messages.push(placeholder);

        telemetry::log_event(
            "session",
            &format!(
                "send conversation={} provider={} turns={} chars={}",
                conversation.id,
                credential.provider,
                history.len(),
                text.len()
            ),
        );

        let cancel = CancellationToken::new();
        match self
            .dispatcher
            .stream_completion(&history, &credential, cancel.clone())
            .await
        {
            Ok(stream) => {
                self.inflight = Some(InFlight {
                    conversation_id: conversation.id,
                    placeholder_id,
                    stream,
                    cancel,
                });
                self.state = SessionState::Streaming;
                Ok(())
            }
            Err(err) => {
                self.remove_message(&placeholder_id);
                self.surface(Err(err.into()))
            }
        }
    }

    async fn resolve_credential(&self, conversation: &Conversation) -> Result<Credential, ChatError> {
        let id = conversation
            .selected_credential_id
            .as_deref()
            .ok_or_else(|| ChatError::Validation("no credential selected".to_string()))?;
        self.store
            .get_credential(id)
            .await?
            .ok_or_else(|| ChatError::Validation(format!("credential {} no longer exists", id)))
    }

    /**
     * \brief 等待并应用下一个流事件；增量按到达顺序原样追加。
     */
    pub async fn pump(&mut self) -> Progress {
        let Some(inflight) = self.inflight.as_mut() else {
            return Progress::Idle;
        };
        let event = inflight.stream.next().await;
        if inflight.cancel.is_cancelled() {
            self.abort_inflight("cancelled");
            return Progress::Cancelled;
        }
        match event {
            Some(StreamEvent::Delta(text)) => {
                let id = &inflight.placeholder_id;
                if let Some(slot) = self.messages.iter_mut().rev().find(|m| &m.id == id) {
                    slot.content.push_str(&text);
                }
                Progress::Delta
            }
            Some(StreamEvent::Done) => self.finalize().await,
            Some(StreamEvent::Error(message)) => {
                self.discard_inflight();
                let _ = self.surface::<()>(Err(ChatError::Upstream(message)));
                Progress::Failed
            }
            None => {
                self.discard_inflight();
                let _ = self.surface::<()>(Err(ChatError::Upstream(
                    "stream ended before completion".to_string(),
                )));
                Progress::Failed
            }
        }
    }

    /**
     * \brief 持续消费直到流结束，返回最后一步的结果。
     */
    pub async fn run_to_idle(&mut self) -> Progress {
        loop {
            match self.pump().await {
                Progress::Delta => continue,
                other => return other,
            }
        }
    }

    /**
     * \brief 取消进行中的流，丢弃部分内容。返回是否确有流被取消。
     */
    pub fn cancel_stream(&mut self) -> bool {
        let had = self.inflight.is_some();
        self.abort_inflight("user cancel");
        had
    }

    /**
     * \brief 关闭：中止流并关闭存储。
     */
    pub fn shutdown(&mut self) {
        self.abort_inflight("shutdown");
        self.store.close();
    }

    async fn finalize(&mut self) -> Progress {
        let Some(inflight) = self.inflight.take() else {
            return Progress::Idle;
        };
        self.state = SessionState::Idle;
        let Some(index) = self
            .messages
            .iter()
            .rposition(|m| m.id == inflight.placeholder_id)
        else {
            return Progress::Idle;
        };
        self.messages[index].timestamp = now_rfc3339();
        let reply = self.messages[index].clone();
        let chars = reply.content.len();
        match self.store.append_message(reply).await {
            Ok(stored) => {
                self.messages[index] = stored;
                telemetry::log_event(
                    "session",
                    &format!(
                        "reply stored conversation={} chars={}",
                        inflight.conversation_id, chars
                    ),
                );
                Progress::Finished
            }
            Err(err) => {
                let _ = self.surface::<()>(Err(err.into()));
                Progress::Failed
            }
        }
    }

    fn abort_inflight(&mut self, reason: &str) {
        if let Some(inflight) = &self.inflight {
            telemetry::log_event(
                "session",
                &format!(
                    "abort stream conversation={} reason={}",
                    inflight.conversation_id, reason
                ),
            );
        }
        self.discard_inflight();
    }

    fn discard_inflight(&mut self) {
        if let Some(inflight) = self.inflight.take() {
            inflight.cancel.cancel();
            self.remove_message(&inflight.placeholder_id);
        }
        self.state = SessionState::Idle;
    }

    fn remove_message(&mut self, id: &str) {
        self.messages.retain(|m| m.id != id);
    }

    fn require_active(&mut self) -> Result<&Conversation, ChatError> {
        if self.active.is_none() {
            return self.surface(Err(ChatError::Validation(
                "no active conversation".to_string(),
            )));
        }
        self.active
            .as_ref()
            .ok_or_else(|| ChatError::Validation("no active conversation".to_string()))
    }

    /**
     * \brief 错误统一出口：记录可见提示并回到 `Idle`。
     */
    fn surface<T>(&mut self, result: Result<T, ChatError>) -> Result<T, ChatError> {
        if let Err(err) = &result {
            telemetry::log_error("session", &err.to_string());
            self.last_error = Some(err.to_string());
            if self.inflight.is_none() {
                self.state = SessionState::Idle;
            }
        }
        result
    }
}
