use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::DbConfig;
use crate::db;

/// Opens the database and creates any missing tables.
pub async fn run_migrations(config: &DbConfig) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the question tables. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Document questions: one row per successful query run
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_questions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            index_name TEXT NOT NULL,
            embed_prompt TEXT NOT NULL,
            doc_prompt TEXT NOT NULL,
            response TEXT NOT NULL,
            keywords_json TEXT NOT NULL DEFAULT '[]',
            prompt_type TEXT NOT NULL DEFAULT '',
            embedding_args_json TEXT NOT NULL DEFAULT '{}',
            completion_args_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            processing_time_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_questions_document ON document_questions(document_id, created_at)",
    )
    .execute(pool)
    .await?;

    // Inference questions: plain completions without retrieval
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inference_questions (
            id TEXT PRIMARY KEY,
            question TEXT NOT NULL,
            response TEXT NOT NULL,
            prompt_type TEXT NOT NULL DEFAULT '',
            args_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            processing_time_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
