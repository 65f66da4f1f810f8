//! 文件元数据：记录类型、存储接口与 SQLite 实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::Database;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// 一个已存储 blob 的元数据。
///
/// `storage_path` 为存储根目录下的相对路径，只在进程内部使用。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub display_name: String,
    pub content_type: String,
    pub(crate) storage_path: String,
    pub size: i64,
    pub owner_id: String,
    pub folder_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub display_name: String,
    pub content_type: String,
    pub storage_path: String,
    pub size: i64,
    pub owner_id: String,
    pub folder_id: Option<i64>,
}

/// 对外返回的文件信息，不含存储路径。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    pub id: i64,
    pub display_name: String,
    pub content_type: String,
    pub size: i64,
    pub owner_id: String,
    pub folder_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<&FileRecord> for FileView {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id,
            display_name: record.display_name.clone(),
            content_type: record.content_type.clone(),
            size: record.size,
            owner_id: record.owner_id.clone(),
            folder_id: record.folder_id,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftDelete {
    Deleted,
    AlreadyDeleted,
    Missing,
}

/// 物理删除失败、等待对账的 blob。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrphanEntry {
    pub id: i64,
    pub storage_path: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert(&self, record: &NewFileRecord) -> Result<FileRecord, MetadataError>;

    /// 按 id 查询，包括已软删除的记录。
    async fn get_by_id(&self, id: i64) -> Result<Option<FileRecord>, MetadataError>;

    /// 条件更新：只有未删除的记录会被标记。
    async fn mark_soft_deleted(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<SoftDelete, MetadataError>;

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, MetadataError>;

    /// `owner_id` 为 `None` 时返回目录下所有用户的文件。
    async fn list_by_folder(
        &self,
        folder_id: i64,
        owner_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, MetadataError>;

    async fn folder_is_active(&self, folder_id: i64) -> Result<bool, MetadataError>;

    /// 是否有未删除的记录指向该路径。
    async fn is_path_referenced(&self, storage_path: &str) -> Result<bool, MetadataError>;

    async fn record_orphan(&self, storage_path: &str, reason: &str) -> Result<(), MetadataError>;

    async fn list_orphans(&self, limit: i64) -> Result<Vec<OrphanEntry>, MetadataError>;

    async fn clear_orphan(&self, id: i64) -> Result<(), MetadataError>;
}

const FILE_COLUMNS: &str = "id, display_name, content_type, storage_path, size, owner_id, folder_id, created_at, is_deleted, deleted_at";

#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, record: &NewFileRecord) -> Result<FileRecord, MetadataError> {
        let sql = format!(
            "INSERT INTO files (display_name, content_type, storage_path, size, owner_id, folder_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {FILE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(&record.display_name)
            .bind(&record.content_type)
            .bind(&record.storage_path)
            .bind(record.size)
            .bind(&record.owner_id)
            .bind(record.folder_id)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        Ok(inserted)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<FileRecord>, MetadataError> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?");
        let record = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn mark_soft_deleted(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<SoftDelete, MetadataError> {
        let result =
            sqlx::query("UPDATE files SET is_deleted = 1, deleted_at = ? WHERE id = ? AND is_deleted = 0")
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() > 0 {
            return Ok(SoftDelete::Deleted);
        }
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match exists {
            Some(_) => SoftDelete::AlreadyDeleted,
            None => SoftDelete::Missing,
        })
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, MetadataError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE owner_id = ? AND is_deleted = 0 \
             ORDER BY created_at DESC, id DESC"
        );
        let records = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn list_by_folder(
        &self,
        folder_id: i64,
        owner_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, MetadataError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE folder_id = ? AND is_deleted = 0 \
             AND (? IS NULL OR owner_id = ?) ORDER BY created_at DESC, id DESC"
        );
        let records = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(folder_id)
            .bind(owner_id)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn folder_is_active(&self, folder_id: i64) -> Result<bool, MetadataError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM folders WHERE id = ? AND is_deleted = 0")
                .bind(folder_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn is_path_referenced(&self, storage_path: &str) -> Result<bool, MetadataError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM files WHERE storage_path = ? AND is_deleted = 0 LIMIT 1",
        )
        .bind(storage_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn record_orphan(&self, storage_path: &str, reason: &str) -> Result<(), MetadataError> {
        sqlx::query("INSERT INTO blob_orphans (storage_path, reason, created_at) VALUES (?, ?, ?)")
            .bind(storage_path)
            .bind(reason)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_orphans(&self, limit: i64) -> Result<Vec<OrphanEntry>, MetadataError> {
        let entries = sqlx::query_as::<_, OrphanEntry>(
            "SELECT id, storage_path, reason, created_at FROM blob_orphans ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn clear_orphan(&self, id: i64) -> Result<(), MetadataError> {
        sqlx::query("DELETE FROM blob_orphans WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
