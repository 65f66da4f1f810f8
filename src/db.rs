//! SQLite 连接池与表结构初始化。

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::metadata::MetadataError;

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_millis(1500);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        parent_id INTEGER REFERENCES folders(id),
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        display_name TEXT NOT NULL,
        content_type TEXT NOT NULL,
        storage_path TEXT NOT NULL UNIQUE,
        size INTEGER NOT NULL CHECK (size >= 0),
        owner_id TEXT NOT NULL,
        folder_id INTEGER REFERENCES folders(id),
        created_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_files_owner ON files(owner_id, is_deleted)",
    "CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id, is_deleted)",
    "CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id, is_deleted)",
    r#"
    CREATE TABLE IF NOT EXISTS blob_orphans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        storage_path TEXT NOT NULL,
        reason TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
];

/// 元数据库连接池。
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// 打开（必要时创建）数据库文件并初始化表结构。
    pub async fn open(path: &Path) -> Result<Self, MetadataError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| MetadataError::Unavailable(err.to_string()))?;
        }
        let options = base_options().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        info!(path = %path.display(), "metadata database ready");
        Ok(db)
    }

    /// 内存数据库只能使用单个连接，否则每个连接看到的是不同的库。
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, MetadataError> {
        let options = base_options().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), MetadataError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn base_options() -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
}
