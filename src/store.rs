//! Append-only storage for answered questions.
//!
//! The pipelines hand finished records to a [`QuestionStore`]. Storage is
//! best-effort from the pipeline's point of view: callers bound each save
//! with a short timeout and log failures instead of surfacing them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::DbConfig;
use crate::models::{InferenceRecord, QuestionRecord, StoredInference, StoredQuestion};
use crate::{db, migrate};

#[async_trait]
pub trait QuestionStore: Send + Sync {
    /// Stores a document question and returns its ID. The creation time is
    /// assigned here.
    async fn save_question(&self, record: &QuestionRecord) -> Result<String>;

    /// Stores a plain completion and returns its ID.
    async fn save_inference(&self, record: &InferenceRecord) -> Result<String>;

    /// Most recent questions first, optionally for one document. Stores
    /// without read support return nothing.
    async fn recent_questions(
        &self,
        _document_id: Option<&str>,
        _limit: i64,
    ) -> Result<Vec<StoredQuestion>> {
        Ok(Vec::new())
    }

    /// Most recent plain completions first.
    async fn recent_inferences(&self, _limit: i64) -> Result<Vec<StoredInference>> {
        Ok(Vec::new())
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects and makes sure the tables exist.
    pub async fn open(config: &DbConfig) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl QuestionStore for SqliteStore {
    async fn save_question(&self, record: &QuestionRecord) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO document_questions (
                id, document_id, index_name, embed_prompt, doc_prompt, response,
                keywords_json, prompt_type, embedding_args_json, completion_args_json,
                created_at, processing_time_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&record.document_id)
        .bind(&record.index_name)
        .bind(&record.embed_prompt)
        .bind(&record.doc_prompt)
        .bind(&record.response)
        .bind(serde_json::to_string(&record.keywords)?)
        .bind(&record.prompt_type)
        .bind(serde_json::to_string(&record.embedding_args)?)
        .bind(serde_json::to_string(&record.completion_args)?)
        .bind(Utc::now().timestamp_millis())
        .bind(record.processing_time_ms)
        .execute(&self.pool)
        .await
        .context("Failed to insert document question")?;
        Ok(id)
    }

    async fn save_inference(&self, record: &InferenceRecord) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO inference_questions (
                id, question, response, prompt_type, args_json, created_at, processing_time_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&record.question)
        .bind(&record.response)
        .bind(&record.prompt_type)
        .bind(serde_json::to_string(&record.completion_args)?)
        .bind(Utc::now().timestamp_millis())
        .bind(record.processing_time_ms)
        .execute(&self.pool)
        .await
        .context("Failed to insert inference question")?;
        Ok(id)
    }

    async fn recent_questions(
        &self,
        document_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<StoredQuestion>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, index_name, embed_prompt, doc_prompt, response,
                   keywords_json, prompt_type, created_at, processing_time_ms
            FROM document_questions
            WHERE (?1 IS NULL OR document_id = ?1)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(document_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let keywords_json: String = row.get("keywords_json");
                let created_at: i64 = row.get("created_at");
                Ok::<_, anyhow::Error>(StoredQuestion {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    index_name: row.get("index_name"),
                    embed_prompt: row.get("embed_prompt"),
                    doc_prompt: row.get("doc_prompt"),
                    response: row.get("response"),
                    keywords: serde_json::from_str(&keywords_json)
                        .context("corrupt keywords_json")?,
                    prompt_type: row.get("prompt_type"),
                    created_at: DateTime::<Utc>::from_timestamp_millis(created_at)
                        .unwrap_or_default(),
                    processing_time_ms: row.get("processing_time_ms"),
                })
            })
            .collect()
    }

    async fn recent_inferences(&self, limit: i64) -> Result<Vec<StoredInference>> {
        let rows = sqlx::query(
            r#"
            SELECT id, question, response, prompt_type, args_json, created_at, processing_time_ms
            FROM inference_questions
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let args_json: String = row.get("args_json");
                let created_at: i64 = row.get("created_at");
                Ok::<_, anyhow::Error>(StoredInference {
                    id: row.get("id"),
                    question: row.get("question"),
                    response: row.get("response"),
                    prompt_type: row.get("prompt_type"),
                    completion_args: serde_json::from_str(&args_json)
                        .context("corrupt args_json")?,
                    created_at: DateTime::<Utc>::from_timestamp_millis(created_at)
                        .unwrap_or_default(),
                    processing_time_ms: row.get("processing_time_ms"),
                })
            })
            .collect()
    }
}
