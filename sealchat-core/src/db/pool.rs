//! Database pool setup

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::error::CoreResult;

/// Open (creating if needed) the SQLite database and apply migrations
pub async fn open_pool(db_path: &str) -> CoreResult<SqlitePool> {
    if db_path == ":memory:" {
        return open_in_memory().await;
    }

    // Connect to SQLite with WAL mode for concurrent access
    let db_url = format!("sqlite:{}?mode=rwc", db_path);
    let db = SqlitePool::connect(&db_url).await?;

    sqlx::query("PRAGMA journal_mode=WAL;").execute(&db).await?;
    sqlx::query("PRAGMA synchronous=NORMAL;").execute(&db).await?;

    sqlx::migrate!("./migrations").run(&db).await?;

    tracing::info!("Database initialized with WAL mode at: {}", db_path);
    Ok(db)
}

/// Single-connection in-memory database; the connection is never recycled
/// since that would drop the data
pub async fn open_in_memory() -> CoreResult<SqlitePool> {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations").run(&db).await?;

    tracing::debug!("In-memory database initialized");
    Ok(db)
}
