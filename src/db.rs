#![cfg(not(tarpaulin_include))]

use crate::config::Config;
use crate::error::Result;
use crate::models::{Role, UserInput};
use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open (and create if needed) the database file named in the configuration.
///
/// The pool runs in WAL mode with foreign keys enforced, and the schema is
/// brought up to date before the pool is returned.
///
/// # Errors
/// * Returns an error if the parent directory or the file cannot be created,
///   or if a migration fails
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    info!(path = %config.db_path.display(), "database opened");
    migrate(&pool).await?;

    if config.seed_demo_users {
        seed_demo_users(&pool).await?;
    }

    Ok(pool)
}

/// Single-connection in-memory database with the schema applied.
///
/// Used by tests; every call yields an independent, empty database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Apply the embedded migrations. Already-applied migrations are skipped.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Create the demo admin and field agent accounts on an empty users table.
///
/// Returns the number of accounts created.
pub async fn seed_demo_users(pool: &SqlitePool) -> Result<usize> {
    let mut conn = pool.acquire().await?;
    let (existing,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&mut *conn)
        .await?;
    if existing > 0 {
        return Ok(0);
    }

    let demo = [
        UserInput {
            username: "admin".into(),
            password: "admin123".into(),
            full_name: "System Administrator".into(),
            role: Role::Admin.as_str().into(),
            region: "ALL".into(),
            state: "ALL".into(),
            ..Default::default()
        },
        UserInput {
            username: "field_agent_demo".into(),
            password: "agent123".into(),
            full_name: "Demo Field Agent".into(),
            role: Role::FieldAgent.as_str().into(),
            region: "SW".into(),
            state: "LAGOS".into(),
            lga: "Ikeja".into(),
            ..Default::default()
        },
    ];

    for input in demo {
        let username = input.username.clone();
        crate::users::create(&mut conn, input).await?;
        info!(%username, "demo user created");
    }
    Ok(2)
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub users: i64,
    pub outlets: i64,
    pub executions: i64,
}

/// Row counts reported by the health endpoint.
pub async fn database_stats(pool: &SqlitePool) -> Result<DatabaseStats> {
    let (users, outlets, executions): (i64, i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM users), (SELECT COUNT(*) FROM outlets), (SELECT COUNT(*) FROM executions)",
    )
    .fetch_one(pool)
    .await?;
    Ok(DatabaseStats {
        users,
        outlets,
        executions,
    })
}
