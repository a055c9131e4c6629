use crate::db::DEFAULT_DB_PATH;
use crate::llm::DispatcherConfig;

/**
 * \brief 运行配置，来自环境变量；命令行参数可在其上覆盖。
 */
#[derive(Debug, Clone)]
pub struct Settings {
    /** \brief SQLite 文件路径（STUDIOCHAT_DB） */
    pub db_path: String,
    /** \brief Provider 端点与模型 */
    pub dispatcher: DispatcherConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 以任意键值来源构建配置，空值视为未设置。
     */
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Settings::default();
        let d = &mut settings.dispatcher;

        if let Some(v) = get("STUDIOCHAT_DB") {
            settings.db_path = v;
        }
        if let Some(v) = get("STUDIOCHAT_OPENAI_BASE") {
            d.openai_base = v;
        }
        if let Some(v) = get("STUDIOCHAT_ANTHROPIC_BASE") {
            d.anthropic_base = v;
        }
        if let Some(v) = get("STUDIOCHAT_GOOGLE_BASE") {
            d.google_base = v;
        }
        if let Some(v) = get("STUDIOCHAT_OPENAI_MODEL") {
            d.openai_model = v;
        }
        if let Some(v) = get("STUDIOCHAT_ANTHROPIC_MODEL") {
            d.anthropic_model = v;
        }
        if let Some(v) = get("STUDIOCHAT_GOOGLE_MODEL") {
            d.google_model = v;
        }
        if let Some(tokens) = get("STUDIOCHAT_MAX_TOKENS").and_then(|v| v.parse().ok()) {
            d.max_tokens = tokens;
        }
        settings
    }
}
