use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

pub type DbPool = PgPool;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/thornwood".to_string()),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DbConfig {
    /// Environment-driven configuration, loading `.env` first.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::default()
    }
}

/// Initialize database connection pool with configuration
pub async fn init_db(config: DbConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Initialize database with default configuration
pub async fn init_db_default() -> Result<DbPool> {
    init_db(DbConfig::default()).await
}

// =============================================================================
// System info
// =============================================================================

/// Reserved key holding this game's identifier.
pub const GAME_ID_KEY: &str = "game_id";

pub async fn system_info_get(pool: &DbPool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM system_info WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to read system info")?;

    Ok(value)
}

pub async fn system_info_set(pool: &DbPool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO system_info (key, value)
        VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET value = $2
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to write system info")?;

    Ok(())
}

/// The game identifier, minted on first boot and stable afterwards.
pub async fn game_id(pool: &DbPool) -> Result<String> {
    if let Some(existing) = system_info_get(pool, GAME_ID_KEY).await? {
        return Ok(existing);
    }

    // Another process may be booting for the first time too; whoever wins
    // the insert decides, and everyone reads the winner back.
    let minted = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO system_info (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING")
        .bind(GAME_ID_KEY)
        .bind(&minted)
        .execute(pool)
        .await
        .context("Failed to initialize game id")?;

    system_info_get(pool, GAME_ID_KEY)
        .await?
        .context("game id missing after initialization")
}
