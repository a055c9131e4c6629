use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/** \brief 新建会话的默认标题。 */
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/**
 * \brief 已保存的模型服务凭据。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /** \brief 主键（UUID） */
    pub id: String,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief Provider 标识：openai/anthropic/google/... */
    pub provider: String,
    /** \brief API Key（明文存储，不做加密） */
    pub secret: String,
    /** \brief 是否为默认凭据 */
    pub is_default: bool,
}

impl Credential {
    pub fn new(name: &str, provider: &str, secret: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            provider: provider.to_string(),
            secret: secret.to_string(),
            is_default: false,
        }
    }
}

/**
 * \brief 会话记录。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /** \brief RFC 3339 创建时间 */
    pub created_at: String,
    /** \brief 选中的凭据；为空表示未配置，禁止发送 */
    pub selected_credential_id: Option<String>,
    pub selected_server_id: Option<String>,
}

impl Conversation {
    pub fn new(title: &str, selected_credential_id: Option<String>) -> Self {
        Self {
            id: new_id(),
            title: title.to_string(),
            created_at: now_rfc3339(),
            selected_credential_id,
            selected_server_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/**
 * \brief 会话中的一条消息。
 * \details `sequence` 由存储层分配；仅本地尚未落库的助手占位消息为 `None`。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sequence: Option<i64>,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: String,
}

impl Message {
    pub fn new(conversation_id: &str, role: Role, content: &str) -> Self {
        Self {
            id: new_id(),
            sequence: None,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn to_turn(&self) -> ChatTurn {
        ChatTurn {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/**
 * \brief 发往 Provider 的历史轮次，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: content.to_string(),
        }
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
