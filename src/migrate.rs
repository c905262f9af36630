use anyhow::Result;
use sqlx::SqlitePool;

/// Create every table the engine persists to. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Indexed passages; the embedding is a little-endian f32 blob
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-row snapshot generation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            generation INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS experiments (
            id TEXT PRIMARY KEY,
            config_json TEXT NOT NULL,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assignments (
            session_id TEXT NOT NULL,
            experiment_id TEXT NOT NULL,
            variant_id TEXT NOT NULL,
            assigned_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, experiment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metric_records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            ts INTEGER NOT NULL,
            name TEXT NOT NULL,
            value REAL NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feedback_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            ts INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            reward REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_metric_records_name ON metric_records(name, ts)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_assignments_experiment ON assignments(experiment_id)")
        .execute(pool)
        .await?;

    Ok(())
}
