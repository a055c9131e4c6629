use thiserror::Error;

/**
 * \brief 持久化层错误；对当前操作视为致命，不做自动重试。
 */
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is closed")]
    Unavailable,
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/**
 * \brief Provider 分发错误。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("Unsupported provider: {0}")]
    Unsupported(String),
}

/**
 * \brief 会话控制器边界上的错误，统一转换为状态迁移与可见提示。
 */
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<DispatchError> for ChatError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidRequest(_) | DispatchError::Unsupported(_) => {
                ChatError::Validation(err.to_string())
            }
            DispatchError::Upstream(msg) => ChatError::Upstream(msg),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
