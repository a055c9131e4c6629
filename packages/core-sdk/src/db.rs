use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crate::error::{StorageError, StorageResult};
use crate::models::{Conversation, Credential, Message, Role, DEFAULT_CHAT_TITLE};
use crate::telemetry;

/** \brief 默认数据库文件（本地目录下）。 */
pub const DEFAULT_DB_PATH: &str = "studiochat.db";

/**
 * \brief 持久化存储句柄。
 * \details 首次使用时打开并迁移；克隆共享同一连接直至进程结束；`close` 之后所有操作返回
 * `StorageError::Unavailable`。SQLite 的阻塞调用放到 `spawn_blocking` 中执行。
 */
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("open", &self.is_open())
            .finish()
    }
}

impl Store {
    /**
     * \brief 打开指定路径的数据库文件并执行迁移。
     */
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /**
     * \brief 打开内存数据库，主要用于测试。
     */
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        migrate(&conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /**
     * \brief 显式关闭存储；所有克隆随之失效。
     */
    pub fn close(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            if guard.take().is_some() {
                telemetry::log_event("store", "closed");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn call<T, F>(&self, action: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| StorageError::Task("store lock poisoned".to_string()))?;
            let conn = guard.as_mut().ok_or(StorageError::Unavailable)?;
            action(conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?;
        if let Err(err) = &result {
            telemetry::log_error("store", &err.to_string());
        }
        result
    }

    pub async fn list_credentials(&self) -> StorageResult<Vec<Credential>> {
        self.call(|conn| list_credentials(conn)).await
    }

    pub async fn get_credential(&self, id: &str) -> StorageResult<Option<Credential>> {
        let id = id.to_string();
        self.call(move |conn| get_credential(conn, &id)).await
    }

    /**
     * \brief 新增凭据；首个凭据自动成为默认。
     */
    pub async fn add_credential(&self, credential: Credential) -> StorageResult<Credential> {
        self.call(move |conn| add_credential(conn, credential)).await
    }

    pub async fn update_credential(&self, credential: Credential) -> StorageResult<()> {
        self.call(move |conn| update_credential(conn, &credential))
            .await
    }

    /**
     * \brief 删除凭据，并清除引用它的会话选择。
     */
    pub async fn delete_credential(&self, id: &str) -> StorageResult<()> {
        let id = id.to_string();
        self.call(move |conn| delete_credential(conn, &id)).await
    }

    pub async fn set_default_credential(&self, id: &str) -> StorageResult<()> {
        let id = id.to_string();
        self.call(move |conn| set_default_credential(conn, &id))
            .await
    }

    pub async fn default_credential(&self) -> StorageResult<Option<Credential>> {
        self.call(|conn| default_credential(conn)).await
    }

    /**
     * \brief 列出会话，新建的在前。
     */
    pub async fn list_conversations(&self) -> StorageResult<Vec<Conversation>> {
        self.call(|conn| list_conversations(conn)).await
    }

    pub async fn get_conversation(&self, id: &str) -> StorageResult<Option<Conversation>> {
        let id = id.to_string();
        self.call(move |conn| get_conversation(conn, &id)).await
    }

    /**
     * \brief 创建会话，预选默认凭据（若存在）。
     */
    pub async fn create_conversation(&self, title: Option<&str>) -> StorageResult<Conversation> {
        let title = title.unwrap_or(DEFAULT_CHAT_TITLE).to_string();
        self.call(move |conn| {
            let default_id = default_credential(conn)?.map(|c| c.id);
            let conversation = Conversation::new(&title, default_id);
            put_conversation(conn, &conversation)?;
            Ok(conversation)
        })
        .await
    }

    /**
     * \brief 整条写入会话记录（后写者胜）。
     */
    pub async fn put_conversation(&self, conversation: Conversation) -> StorageResult<()> {
        self.call(move |conn| put_conversation(conn, &conversation))
            .await
    }

    pub async fn rename_conversation(&self, id: &str, title: &str) -> StorageResult<()> {
        let id = id.to_string();
        let title = title.to_string();
        self.call(move |conn| {
            let rows = retry_on_locked(|| {
                conn.execute(
                    "UPDATE conversations SET title=?1 WHERE id=?2",
                    params![title, id],
                )
            })?;
            ensure_found(rows, "conversation", &id)
        })
        .await
    }

    /**
     * \brief 为会话选择凭据；`None` 表示未配置。
     */
    pub async fn select_credential(
        &self,
        conversation_id: &str,
        credential_id: Option<&str>,
    ) -> StorageResult<()> {
        let conversation_id = conversation_id.to_string();
        let credential_id = credential_id.map(str::to_string);
        self.call(move |conn| {
            if let Some(cid) = &credential_id {
                if get_credential(conn, cid)?.is_none() {
                    return Err(StorageError::NotFound {
                        kind: "credential",
                        id: cid.clone(),
                    });
                }
            }
            let rows = retry_on_locked(|| {
                conn.execute(
                    "UPDATE conversations SET selected_credential_id=?1 WHERE id=?2",
                    params![credential_id, conversation_id],
                )
            })?;
            ensure_found(rows, "conversation", &conversation_id)
        })
        .await
    }

    pub async fn select_server(
        &self,
        conversation_id: &str,
        server_id: Option<&str>,
    ) -> StorageResult<()> {
        let conversation_id = conversation_id.to_string();
        let server_id = server_id.map(str::to_string);
        self.call(move |conn| {
            let rows = retry_on_locked(|| {
                conn.execute(
                    "UPDATE conversations SET selected_server_id=?1 WHERE id=?2",
                    params![server_id, conversation_id],
                )
            })?;
            ensure_found(rows, "conversation", &conversation_id)
        })
        .await
    }

    /**
     * \brief 删除会话并级联删除其全部消息（单个事务）。
     */
    pub async fn delete_conversation(&self, id: &str) -> StorageResult<()> {
        let id = id.to_string();
        self.call(move |conn| delete_conversation(conn, &id)).await
    }

    /**
     * \brief 读取会话消息，按 sequence 升序。
     */
    pub async fn get_messages(&self, conversation_id: &str) -> StorageResult<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.call(move |conn| get_messages(conn, &conversation_id))
            .await
    }

    /**
     * \brief 追加一条消息，返回带 sequence 的记录。
     */
    pub async fn append_message(&self, message: Message) -> StorageResult<Message> {
        self.call(move |conn| append_message(conn, message)).await
    }

    pub async fn append_messages(&self, messages: Vec<Message>) -> StorageResult<Vec<Message>> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut stored = Vec::with_capacity(messages.len());
            for message in messages {
                stored.push(append_message(&tx, message)?);
            }
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    pub async fn update_message(&self, message: Message) -> StorageResult<()> {
        self.call(move |conn| {
            let rows = retry_on_locked(|| {
                conn.execute(
                    "UPDATE messages SET content=?1, timestamp=?2 WHERE id=?3",
                    params![message.content, message.timestamp, message.id],
                )
            })?;
            ensure_found(rows, "message", &message.id)
        })
        .await
    }

    pub async fn delete_message(&self, id: &str) -> StorageResult<()> {
        let id = id.to_string();
        self.call(move |conn| {
            retry_on_locked(|| conn.execute("DELETE FROM messages WHERE id=?1", params![id]))?;
            Ok(())
        })
        .await
    }

    pub async fn latest_message(&self, conversation_id: &str) -> StorageResult<Option<Message>> {
        let conversation_id = conversation_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!("{MESSAGE_SELECT} WHERE conversation_id=?1 ORDER BY seq DESC LIMIT 1"),
                    params![conversation_id],
                    message_row,
                )
                .optional()?;
            row.map(into_message).transpose()
        })
        .await
    }

    pub async fn message_count(&self, conversation_id: &str) -> StorageResult<usize> {
        let conversation_id = conversation_id.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id=?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    /**
     * \brief 清空全部凭据、会话与消息。
     */
    pub async fn clear_all(&self) -> StorageResult<()> {
        self.call(|conn| {
            retry_on_locked(|| {
                conn.execute_batch(
                    "DELETE FROM messages; DELETE FROM conversations; DELETE FROM credentials;",
                )
            })?;
            Ok(())
        })
        .await
    }

    /**
     * \brief 读取遥测开关。
     */
    pub async fn telemetry_enabled(&self) -> StorageResult<bool> {
        self.call(|conn| get_bool_config(conn, "telemetry_enabled", false))
            .await
    }

    /**
     * \brief 更新遥测开关。
     */
    pub async fn set_telemetry_enabled(&self, enabled: bool) -> StorageResult<()> {
        self.call(move |conn| set_bool_config(conn, "telemetry_enabled", enabled))
            .await
    }
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
fn migrate(conn: &Connection) -> StorageResult<()> {
    retry_on_locked(|| conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(())))?;
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            provider TEXT NOT NULL,
            secret TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            selected_credential_id TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages (conversation_id, seq);
        "#,
        )
    })?;

    ensure_column(conn, "conversations", "selected_server_id", "TEXT")?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> StorageResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"),
                [],
            )
        })?;
    }
    Ok(())
}

fn ensure_found(rows: usize, kind: &'static str, id: &str) -> StorageResult<()> {
    if rows == 0 {
        return Err(StorageError::NotFound {
            kind,
            id: id.to_string(),
        });
    }
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> StorageResult<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> StorageResult<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

const CREDENTIAL_SELECT: &str =
    "SELECT id, name, provider, secret, is_default FROM credentials";

fn credential_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: row.get(0)?,
        name: row.get(1)?,
        provider: row.get(2)?,
        secret: row.get(3)?,
        is_default: row.get::<_, i64>(4)? != 0,
    })
}

fn list_credentials(conn: &Connection) -> StorageResult<Vec<Credential>> {
    let mut stmt = conn.prepare(&format!("{CREDENTIAL_SELECT} ORDER BY rowid ASC"))?;
    let rows = stmt
        .query_map([], credential_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn get_credential(conn: &Connection, id: &str) -> StorageResult<Option<Credential>> {
    conn.query_row(
        &format!("{CREDENTIAL_SELECT} WHERE id=?1"),
        params![id],
        credential_row,
    )
    .optional()
    .map_err(Into::into)
}

fn default_credential(conn: &Connection) -> StorageResult<Option<Credential>> {
    conn.query_row(
        &format!("{CREDENTIAL_SELECT} WHERE is_default=1 ORDER BY rowid ASC LIMIT 1"),
        [],
        credential_row,
    )
    .optional()
    .map_err(Into::into)
}

fn add_credential(conn: &mut Connection, mut credential: Credential) -> StorageResult<Credential> {
    retry_on_locked(|| {
        let tx = conn.transaction()?;
        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
        if existing == 0 {
            credential.is_default = true;
        }
        if credential.is_default {
            tx.execute("UPDATE credentials SET is_default=0", [])?;
        }
        tx.execute(
            "INSERT INTO credentials (id, name, provider, secret, is_default) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                credential.id,
                credential.name,
                credential.provider,
                credential.secret,
                credential.is_default as i64
            ],
        )?;
        tx.commit()
    })?;
    telemetry::log_event(
        "store",
        &format!(
            "add credential id={} provider={} default={}",
            credential.id, credential.provider, credential.is_default
        ),
    );
    Ok(credential)
}

fn update_credential(conn: &mut Connection, credential: &Credential) -> StorageResult<()> {
    let rows = retry_on_locked(|| {
        let tx = conn.transaction()?;
        if credential.is_default {
            tx.execute(
                "UPDATE credentials SET is_default=0 WHERE id<>?1",
                params![credential.id],
            )?;
        }
        let rows = tx.execute(
            "UPDATE credentials SET name=?1, provider=?2, secret=?3, is_default=?4 WHERE id=?5",
            params![
                credential.name,
                credential.provider,
                credential.secret,
                credential.is_default as i64,
                credential.id
            ],
        )?;
        if rows == 0 {
            // 未命中：丢弃事务
            return Ok(0);
        }
        tx.commit()?;
        Ok(rows)
    })?;
    ensure_found(rows, "credential", &credential.id)
}

fn delete_credential(conn: &mut Connection, id: &str) -> StorageResult<()> {
    retry_on_locked(|| {
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE conversations SET selected_credential_id=NULL WHERE selected_credential_id=?1",
            params![id],
        )?;
        tx.execute("DELETE FROM credentials WHERE id=?1", params![id])?;
        tx.commit()
    })?;
    telemetry::log_event("store", &format!("delete credential id={}", id));
    Ok(())
}

fn set_default_credential(conn: &mut Connection, id: &str) -> StorageResult<()> {
    if get_credential(conn, id)?.is_none() {
        return Err(StorageError::NotFound {
            kind: "credential",
            id: id.to_string(),
        });
    }
    retry_on_locked(|| {
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE credentials SET is_default = CASE WHEN id=?1 THEN 1 ELSE 0 END",
            params![id],
        )?;
        tx.commit()
    })?;
    telemetry::log_event("store", &format!("set default credential id={}", id));
    Ok(())
}

const CONVERSATION_SELECT: &str =
    "SELECT id, title, created_at, selected_credential_id, selected_server_id FROM conversations";

fn conversation_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        selected_credential_id: row.get(3)?,
        selected_server_id: row.get(4)?,
    })
}

fn list_conversations(conn: &Connection) -> StorageResult<Vec<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "{CONVERSATION_SELECT} ORDER BY created_at DESC, rowid DESC"
    ))?;
    let rows = stmt
        .query_map([], conversation_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn get_conversation(conn: &Connection, id: &str) -> StorageResult<Option<Conversation>> {
    conn.query_row(
        &format!("{CONVERSATION_SELECT} WHERE id=?1"),
        params![id],
        conversation_row,
    )
    .optional()
    .map_err(Into::into)
}

fn put_conversation(conn: &Connection, conversation: &Conversation) -> StorageResult<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO conversations (id, title, created_at, selected_credential_id, selected_server_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                title=excluded.title,
                created_at=excluded.created_at,
                selected_credential_id=excluded.selected_credential_id,
                selected_server_id=excluded.selected_server_id",
            params![
                conversation.id,
                conversation.title,
                conversation.created_at,
                conversation.selected_credential_id,
                conversation.selected_server_id
            ],
        )
    })?;
    Ok(())
}

fn delete_conversation(conn: &mut Connection, id: &str) -> StorageResult<()> {
    let removed = retry_on_locked(|| {
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM messages WHERE conversation_id=?1",
            params![id],
        )?;
        tx.execute("DELETE FROM conversations WHERE id=?1", params![id])?;
        tx.commit()?;
        Ok(removed)
    })?;
    telemetry::log_event(
        "store",
        &format!("delete conversation id={} messages={}", id, removed),
    );
    Ok(())
}

const MESSAGE_SELECT: &str =
    "SELECT seq, id, conversation_id, role, content, timestamp FROM messages";

type MessageRow = (i64, String, String, String, String, String);

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_message(row: MessageRow) -> StorageResult<Message> {
    let (seq, id, conversation_id, role, content, timestamp) = row;
    let role = Role::parse(&role)
        .ok_or_else(|| StorageError::Corrupt(format!("message {} has role {:?}", id, role)))?;
    Ok(Message {
        id,
        sequence: Some(seq),
        conversation_id,
        role,
        content,
        timestamp,
    })
}

fn get_messages(conn: &Connection, conversation_id: &str) -> StorageResult<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "{MESSAGE_SELECT} WHERE conversation_id=?1 ORDER BY seq ASC"
    ))?;
    let rows = stmt
        .query_map(params![conversation_id], message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_message).collect()
}

fn append_message(conn: &Connection, mut message: Message) -> StorageResult<Message> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.conversation_id,
                message.role.as_str(),
                message.content,
                message.timestamp
            ],
        )
    })?;
    message.sequence = Some(conn.last_insert_rowid());
    Ok(message)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> StorageResult<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_store() -> Store {
        Store::open_in_memory().expect("open in-memory store")
    }

    async fn seeded(store: &Store) -> (Credential, Conversation) {
        let cred = store
            .add_credential(Credential::new("work", "openai", "k1"))
            .await
            .expect("add credential");
        let conv = store
            .create_conversation(None)
            .await
            .expect("create conversation");
        (cred, conv)
    }

    #[tokio::test]
    async fn test_first_credential_becomes_default() {
        let store = mem_store();
        let first = store
            .add_credential(Credential::new("a", "openai", "k1"))
            .await
            .expect("add a");
        let second = store
            .add_credential(Credential::new("b", "anthropic", "k2"))
            .await
            .expect("add b");
        assert!(first.is_default);
        assert!(!second.is_default);

        let def = store.default_credential().await.expect("default").unwrap();
        assert_eq!(def.id, first.id);
    }

    #[tokio::test]
    async fn test_at_most_one_default_after_updates() {
        let store = mem_store();
        let a = store
            .add_credential(Credential::new("a", "openai", "k1"))
            .await
            .unwrap();
        let mut b = store
            .add_credential(Credential::new("b", "openai", "k2"))
            .await
            .unwrap();
        let mut c = Credential::new("c", "anthropic", "k3");
        c.is_default = true;
        let c = store.add_credential(c).await.unwrap();

        store.set_default_credential(&a.id).await.unwrap();
        b.is_default = true;
        store.update_credential(b.clone()).await.unwrap();
        store.set_default_credential(&c.id).await.unwrap();

        let defaults: Vec<_> = store
            .list_credentials()
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, c.id);
    }

    #[tokio::test]
    async fn test_update_missing_credential_keeps_existing_default() {
        let store = mem_store();
        let a = store
            .add_credential(Credential::new("a", "openai", "k1"))
            .await
            .unwrap();
        let mut ghost = Credential::new("ghost", "openai", "k");
        ghost.is_default = true;
        let err = store.update_credential(ghost).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        let def = store.default_credential().await.unwrap().unwrap();
        assert_eq!(def.id, a.id);
    }

    #[tokio::test]
    async fn test_set_default_unknown_credential_fails() {
        let store = mem_store();
        let err = store.set_default_credential("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { kind: "credential", .. }));
    }

    #[tokio::test]
    async fn test_new_conversation_preselects_default_credential() {
        let store = mem_store();
        let (cred, conv) = seeded(&store).await;
        assert_eq!(conv.title, DEFAULT_CHAT_TITLE);
        assert_eq!(conv.selected_credential_id.as_deref(), Some(cred.id.as_str()));

        let empty = mem_store();
        let conv = empty.create_conversation(Some("solo")).await.unwrap();
        assert_eq!(conv.selected_credential_id, None);
    }

    #[tokio::test]
    async fn test_delete_credential_clears_selection() {
        let store = mem_store();
        let (cred, conv) = seeded(&store).await;
        store.delete_credential(&cred.id).await.unwrap();
        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.selected_credential_id, None);
    }

    #[tokio::test]
    async fn test_select_credential_requires_existing_record() {
        let store = mem_store();
        let (_, conv) = seeded(&store).await;
        let err = store
            .select_credential(&conv.id, Some("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { kind: "credential", .. }));

        store.select_credential(&conv.id, None).await.unwrap();
        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.selected_credential_id, None);
    }

    #[tokio::test]
    async fn test_messages_read_back_in_write_order() {
        let store = mem_store();
        let (_, conv) = seeded(&store).await;
        let mut first = Message::new(&conv.id, Role::User, "hello");
        let mut second = Message::new(&conv.id, Role::Assistant, "hi");
        // 相同时间戳不影响顺序
        second.timestamp = first.timestamp.clone();
        first = store.append_message(first).await.unwrap();
        second = store.append_message(second).await.unwrap();
        let third = store
            .append_message(Message::new(&conv.id, Role::User, "again"))
            .await
            .unwrap();
        assert!(first.sequence < second.sequence);
        assert!(second.sequence < third.sequence);

        let loaded = store.get_messages(&conv.id).await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str(), third.id.as_str()]);
        assert_eq!(store.message_count(&conv.id).await.unwrap(), 3);
        let latest = store.latest_message(&conv.id).await.unwrap().unwrap();
        assert_eq!(latest.id, third.id);
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades_only_its_messages() {
        let store = mem_store();
        let (_, doomed) = seeded(&store).await;
        let kept = store.create_conversation(Some("kept")).await.unwrap();
        store
            .append_messages(vec![
                Message::new(&doomed.id, Role::User, "a"),
                Message::new(&kept.id, Role::User, "b"),
                Message::new(&doomed.id, Role::Assistant, "c"),
            ])
            .await
            .unwrap();

        store.delete_conversation(&doomed.id).await.unwrap();

        assert!(store.get_conversation(&doomed.id).await.unwrap().is_none());
        assert!(store.get_messages(&doomed.id).await.unwrap().is_empty());
        let survivors = store.get_messages(&kept.id).await.unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].content, "b");
    }

    #[tokio::test]
    async fn test_put_conversation_last_write_wins() {
        let store = mem_store();
        let (_, mut conv) = seeded(&store).await;
        conv.title = "first".to_string();
        store.put_conversation(conv.clone()).await.unwrap();
        conv.title = "second".to_string();
        conv.selected_server_id = Some("srv".to_string());
        store.put_conversation(conv.clone()).await.unwrap();

        let loaded = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(loaded, conv);
        assert_eq!(store.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_message() {
        let store = mem_store();
        let (_, conv) = seeded(&store).await;
        let mut msg = store
            .append_message(Message::new(&conv.id, Role::Assistant, "Hi"))
            .await
            .unwrap();
        msg.content.push_str(" there");
        store.update_message(msg.clone()).await.unwrap();
        assert_eq!(store.get_messages(&conv.id).await.unwrap()[0].content, "Hi there");

        store.delete_message(&msg.id).await.unwrap();
        assert_eq!(store.message_count(&conv.id).await.unwrap(), 0);
        let err = store.update_message(msg).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { kind: "message", .. }));
    }

    #[tokio::test]
    async fn test_rename_missing_conversation_fails() {
        let store = mem_store();
        let err = store.rename_conversation("nope", "t").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { kind: "conversation", .. }));
    }

    #[tokio::test]
    async fn test_closed_store_is_unavailable() {
        let store = mem_store();
        let clone = store.clone();
        store.close();
        assert!(!clone.is_open());
        let err = clone.list_conversations().await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable));
    }

    #[tokio::test]
    async fn test_clear_all_and_telemetry_flag() {
        let store = mem_store();
        let (_, conv) = seeded(&store).await;
        store
            .append_message(Message::new(&conv.id, Role::User, "x"))
            .await
            .unwrap();
        assert!(!store.telemetry_enabled().await.unwrap());
        store.set_telemetry_enabled(true).await.unwrap();

        store.clear_all().await.unwrap();
        assert!(store.list_credentials().await.unwrap().is_empty());
        assert!(store.list_conversations().await.unwrap().is_empty());
        assert_eq!(store.message_count(&conv.id).await.unwrap(), 0);
        assert!(store.telemetry_enabled().await.unwrap());
    }
}
