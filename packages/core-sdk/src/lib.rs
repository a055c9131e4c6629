pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod remote;
pub mod server;
pub mod session;
pub mod sse;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::db::Store;
    pub use crate::error::{ChatError, DispatchError, StorageError};
    pub use crate::llm::{
        CompletionStream, Dispatcher, DispatcherConfig, ProviderDispatcher, StreamEvent,
    };
    pub use crate::models::{ChatTurn, Conversation, Credential, Message, Role};
    pub use crate::remote::RemoteDispatcher;
    pub use crate::session::{Progress, SessionController, SessionState};
}
