//! Tables owned by msgsrv and the seeded administrator

use sqlx::SqlitePool;
use tracing::{debug, info};

use errors::HeraldResult;

use crate::auth::password::hash_password;

pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "123456";

/// `sys_user.status` for an enabled account
pub const USER_STATUS_ENABLED: i64 = 1;

/// Create tables if missing
pub async fn init_schema(pool: &SqlitePool) -> HeraldResult<()> {
    debug!("Init msgsrv tables");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sys_user (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            nickname TEXT,
            password TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 1,
            create_time INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // target_type: 1 = all users, 2 = listed users (comma separated)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sys_notice (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            target_type INTEGER NOT NULL CHECK(target_type IN (1, 2)),
            target_users TEXT,
            publisher TEXT NOT NULL,
            publish_time INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sys_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            status INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            ip TEXT,
            create_time INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert the default administrator unless it exists
pub async fn seed_admin(pool: &SqlitePool, now_millis: i64) -> HeraldResult<()> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM sys_user WHERE username = ?")
        .bind(DEFAULT_ADMIN_USERNAME)
        .fetch_optional(pool)
        .await?;
    if exists.is_some() {
        return Ok(());
    }

    let hash = hash_password(DEFAULT_ADMIN_PASSWORD)?;
    sqlx::query(
        "INSERT OR IGNORE INTO sys_user (username, nickname, password, status, create_time) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(DEFAULT_ADMIN_USERNAME)
    .bind("System Administrator")
    .bind(hash)
    .bind(USER_STATUS_ENABLED)
    .bind(now_millis)
    .execute(pool)
    .await?;

    info!("Seeded default user '{}'", DEFAULT_ADMIN_USERNAME);
    Ok(())
}

/// Add a user with an argon2-hashed password; returns its id
pub async fn create_user(
    pool: &SqlitePool,
    username: &str,
    password: &str,
    status: i64,
    now_millis: i64,
) -> HeraldResult<i64> {
    let hash = hash_password(password)?;
    let result = sqlx::query(
        "INSERT INTO sys_user (username, nickname, password, status, create_time) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(username)
    .bind(username)
    .bind(hash)
    .bind(status)
    .bind(now_millis)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_and_seed_are_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();
        seed_admin(&pool, 0).await.unwrap();
        seed_admin(&pool, 0).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sys_user")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
