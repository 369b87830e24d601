use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// `ragline init`: create the schema in the configured SQLite file.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(&config.store.path).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema setup.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // seq doubles as insertion order; AUTOINCREMENT keeps it from being reused
    // after a superseded row is deleted.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            text TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(tenant_id, document_id, chunk_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_tenant ON chunk_vectors(tenant_id, seq)")
        .execute(pool)
        .await?;

    Ok(())
}
