//! Relational store: scenes, completions, sessions, QA markers, and the
//! knowledge file/segment/summary tables, backed by SQLite.
//!
//! `rusqlite::Connection` is not `Sync`, so every query runs inside
//! `spawn_blocking` against a `Mutex`-guarded connection — the same shape
//! any `tokio` service takes when it embeds a synchronous DB driver.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("not found")]
    NotFound,
}

#[derive(Debug, Clone)]
pub struct SceneRow {
    pub scene_code: String,
    pub provider_code: String,
    pub model_code: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub enable_stream: bool,
    pub system_prompt: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingSceneRow {
    pub scene_code: String,
    pub provider_code: String,
    pub model_code: String,
    pub vector_dimension: i64,
    pub collection_name: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub request_id: String,
    pub scene_code: String,
    pub provider_code: String,
    pub model_code: String,
    pub prompt: String,
    pub completion: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub user_id: String,
    pub response_time_secs: f64,
    /// 0 = failure, 1 = success.
    pub status: i64,
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: i64,
    pub name: String,
    pub scene_code: String,
    pub user_id: String,
    pub is_active: bool,
}

/// Opens a store backed by `data_source`. An empty string or the literal
/// `:memory:` opens an ephemeral in-memory database — the dev-mode
/// behavior of "writes silently succeed" is honored by giving dev an
/// always-available, always-empty store rather than literally dropping
/// writes, which keeps read-after-write semantics intact for local runs.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(data_source: &str) -> Result<Self, StoreError> {
        let conn = if data_source.is_empty() || data_source == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(data_source)?
        };
        Self::migrate(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS llm_scene (
                scene_code TEXT PRIMARY KEY,
                provider_code TEXT NOT NULL,
                model_code TEXT NOT NULL,
                temperature REAL NOT NULL,
                max_tokens INTEGER NOT NULL,
                enable_stream INTEGER NOT NULL,
                system_prompt TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS embedding_scene (
                scene_code TEXT PRIMARY KEY,
                provider_code TEXT NOT NULL,
                model_code TEXT NOT NULL,
                vector_dimension INTEGER NOT NULL,
                collection_name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS llm_completion (
                request_id TEXT PRIMARY KEY,
                scene_code TEXT NOT NULL,
                provider_code TEXT NOT NULL DEFAULT '',
                model_code TEXT NOT NULL DEFAULT '',
                prompt TEXT NOT NULL,
                completion TEXT NOT NULL DEFAULT '',
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                user_id TEXT NOT NULL,
                response_time REAL NOT NULL DEFAULT 0,
                status INTEGER NOT NULL DEFAULT 0,
                error_msg TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS chat_session (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                scene_code TEXT NOT NULL,
                user_id TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_interact_time TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS chat_session_qas (
                session_id INTEGER NOT NULL,
                sequence_num INTEGER NOT NULL,
                llm_completion_id INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS knowledge_file (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                oss_path TEXT NOT NULL DEFAULT '',
                file_name TEXT NOT NULL DEFAULT '',
                file_size INTEGER NOT NULL DEFAULT 0,
                file_type TEXT NOT NULL DEFAULT '',
                file_md5 TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS knowledge_segment (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                knowledge_file_id INTEGER NOT NULL,
                segment_text TEXT NOT NULL,
                segment_md5 TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS knowledge_summary_sentence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                knowledge_file_id INTEGER NOT NULL,
                knowledge_segment_id INTEGER NOT NULL,
                summary_sentence_text TEXT NOT NULL,
                summary_sentence_md5 TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("store mutex poisoned");
            f(&guard).map_err(StoreError::from)
        })
        .await?
    }

    pub async fn find_scene_by_code(&self, scene_code: &str) -> Result<Option<SceneRow>, StoreError> {
        let scene_code = scene_code.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT scene_code, provider_code, model_code, temperature, max_tokens, enable_stream, system_prompt
                 FROM llm_scene WHERE scene_code = ?1",
                params![scene_code],
                |row| {
                    Ok(SceneRow {
                        scene_code: row.get(0)?,
                        provider_code: row.get(1)?,
                        model_code: row.get(2)?,
                        temperature: row.get(3)?,
                        max_tokens: row.get(4)?,
                        enable_stream: row.get::<_, i64>(5)? != 0,
                        system_prompt: row.get(6)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn find_embedding_scene_by_code(
        &self,
        scene_code: &str,
    ) -> Result<Option<EmbeddingSceneRow>, StoreError> {
        let scene_code = scene_code.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT scene_code, provider_code, model_code, vector_dimension, collection_name
                 FROM embedding_scene WHERE scene_code = ?1",
                params![scene_code],
                |row| {
                    Ok(EmbeddingSceneRow {
                        scene_code: row.get(0)?,
                        provider_code: row.get(1)?,
                        model_code: row.get(2)?,
                        vector_dimension: row.get(3)?,
                        collection_name: row.get(4)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn upsert_scene(&self, scene: SceneRow) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO llm_scene (scene_code, provider_code, model_code, temperature, max_tokens, enable_stream, system_prompt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(scene_code) DO UPDATE SET
                    provider_code = excluded.provider_code,
                    model_code = excluded.model_code,
                    temperature = excluded.temperature,
                    max_tokens = excluded.max_tokens,
                    enable_stream = excluded.enable_stream,
                    system_prompt = excluded.system_prompt",
                params![
                    scene.scene_code,
                    scene.provider_code,
                    scene.model_code,
                    scene.temperature,
                    scene.max_tokens,
                    scene.enable_stream as i64,
                    scene.system_prompt,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_embedding_scene(&self, scene: EmbeddingSceneRow) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO embedding_scene (scene_code, provider_code, model_code, vector_dimension, collection_name)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(scene_code) DO UPDATE SET
                    provider_code = excluded.provider_code,
                    model_code = excluded.model_code,
                    vector_dimension = excluded.vector_dimension,
                    collection_name = excluded.collection_name",
                params![
                    scene.scene_code,
                    scene.provider_code,
                    scene.model_code,
                    scene.vector_dimension,
                    scene.collection_name,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Persists with a bounded timeout detached from any caller-supplied
    /// cancellation; callers that need the detached-context discipline
    /// call this from a guard whose `Drop` is not itself cancellable.
    pub async fn save_completion(&self, record: CompletionRecord) -> Result<(), StoreError> {
        let fut = self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO llm_completion
                    (request_id, scene_code, provider_code, model_code, prompt, completion,
                     input_tokens, output_tokens, total_tokens, user_id, response_time, status, error_msg)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(request_id) DO UPDATE SET
                    completion = excluded.completion,
                    input_tokens = excluded.input_tokens,
                    output_tokens = excluded.output_tokens,
                    total_tokens = excluded.total_tokens,
                    response_time = excluded.response_time,
                    status = excluded.status,
                    error_msg = excluded.error_msg",
                params![
                    record.request_id,
                    record.scene_code,
                    record.provider_code,
                    record.model_code,
                    record.prompt,
                    record.completion,
                    record.input_tokens,
                    record.output_tokens,
                    record.total_tokens,
                    record.user_id,
                    record.response_time_secs,
                    record.status,
                    record.error_msg,
                ],
            )?;
            Ok(())
        });

        match tokio::time::timeout(std::time::Duration::from_secs(5), fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::NotFound), // timed out; caller logs and moves on
        }
    }

    pub async fn find_session(&self, id: i64) -> Result<Option<ChatSession>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, scene_code, user_id, is_active FROM chat_session WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ChatSession {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        scene_code: row.get(2)?,
                        user_id: row.get(3)?,
                        is_active: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn create_session(&self, name: String, scene_code: String, user_id: String) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chat_session (name, scene_code, user_id, is_active) VALUES (?1, ?2, ?3, 1)",
                params![name, scene_code, user_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Best-effort; callers should treat errors as non-fatal to the turn.
    pub async fn touch_session_interact_time(&self, session_id: i64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE chat_session SET last_interact_time = datetime('now'), updated_at = datetime('now')
                 WHERE id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Best-effort; collisions on (session_id, sequence_num) are accepted.
    pub async fn insert_qa_marker(
        &self,
        session_id: i64,
        sequence_num: i64,
        completion_id: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chat_session_qas (session_id, sequence_num, llm_completion_id) VALUES (?1, ?2, ?3)",
                params![session_id, sequence_num, completion_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn find_file_by_md5(&self, md5: &str) -> Result<Option<i64>, StoreError> {
        let md5 = md5.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT id FROM knowledge_file WHERE file_md5 = ?1", params![md5], |row| row.get(0))
                .optional()
        })
        .await
    }

    pub async fn insert_file(
        &self,
        oss_path: &str,
        file_name: &str,
        file_size: i64,
        file_type: &str,
        md5: &str,
    ) -> Result<i64, StoreError> {
        let (oss_path, file_name, file_type, md5) =
            (oss_path.to_string(), file_name.to_string(), file_type.to_string(), md5.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO knowledge_file (oss_path, file_name, file_size, file_type, file_md5)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![oss_path, file_name, file_size, file_type, md5],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn insert_segment(&self, file_id: i64, text: &str, md5: &str) -> Result<i64, StoreError> {
        let (text, md5) = (text.to_string(), md5.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO knowledge_segment (knowledge_file_id, segment_text, segment_md5) VALUES (?1, ?2, ?3)",
                params![file_id, text, md5],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn insert_summary(
        &self,
        file_id: i64,
        segment_id: i64,
        text: &str,
        md5: &str,
    ) -> Result<i64, StoreError> {
        let (text, md5) = (text.to_string(), md5.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO knowledge_summary_sentence
                    (knowledge_file_id, knowledge_segment_id, summary_sentence_text, summary_sentence_md5)
                 VALUES (?1, ?2, ?3, ?4)",
                params![file_id, segment_id, text, md5],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_opens_and_migrates() {
        let store = Store::open(":memory:").unwrap();
        assert!(store.find_scene_by_code("chat").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scene_upsert_then_find_round_trips() {
        let store = Store::open(":memory:").unwrap();
        store
            .upsert_scene(SceneRow {
                scene_code: "chat".into(),
                provider_code: "unified".into(),
                model_code: "gpt".into(),
                temperature: 0.7,
                max_tokens: 512,
                enable_stream: true,
                system_prompt: String::new(),
            })
            .await
            .unwrap();

        let found = store.find_scene_by_code("chat").await.unwrap().unwrap();
        assert_eq!(found.provider_code, "unified");
        assert!(found.enable_stream);
    }

    #[tokio::test]
    async fn file_dedup_by_md5() {
        let store = Store::open(":memory:").unwrap();
        let id = store.insert_file("", "a.txt", 10, "text/plain", "abc123").await.unwrap();
        assert_eq!(store.find_file_by_md5("abc123").await.unwrap(), Some(id));
        assert!(store.find_file_by_md5("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_create_and_lookup() {
        let store = Store::open(":memory:").unwrap();
        let id = store.create_session("Chat-2026-01-01 00:00:00".into(), "chat".into(), "u1".into()).await.unwrap();
        let session = store.find_session(id).await.unwrap().unwrap();
        assert_eq!(session.scene_code, "chat");
        assert!(session.is_active);
    }

    #[tokio::test]
    async fn qa_marker_insert_never_enforces_uniqueness() {
        let store = Store::open(":memory:").unwrap();
        let id = store.create_session("s".into(), "chat".into(), "u1".into()).await.unwrap();
        store.insert_qa_marker(id, 1000, 0).await.unwrap();
        // A second marker at the same sequence_num is accepted, not rejected.
        store.insert_qa_marker(id, 1000, 0).await.unwrap();
    }
}
