//! Blob 存储协调器：保证磁盘文件与元数据记录一致。
//!
//! - 写入：暂存文件 -> 校验长度 -> rename -> 插入记录，插入失败时删除文件。
//! - 读取：记录存在且未删除才读盘，文件缺失与记录缺失分开报告。
//! - 删除：先软删除记录，再删除文件；文件删除失败进入对账队列。

use chrono::Utc;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::atomic::{BlobGuard, InFlightEntry, InFlightPaths, is_staging_name, staging_path};
use crate::metadata::{FileRecord, MetadataError, MetadataStore, NewFileRecord, SoftDelete};
use crate::storage::{BlobBackend, WriteError};

/// 存储文件名（不含 `{token}_` 前缀）的最大字节数，加上前缀后仍低于 NAME_MAX。
pub const MAX_STORED_NAME_BYTES: usize = 200;
const RECONCILE_BATCH: i64 = 256;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage write failed: {0}")]
    StorageWriteFailed(#[source] io::Error),
    #[error("metadata write failed: {0}")]
    MetadataWriteFailed(#[source] MetadataError),
    #[error("metadata lookup failed: {0}")]
    MetadataReadFailed(#[source] MetadataError),
    #[error("file {0} has an active record but its blob is missing or damaged")]
    StorageInconsistent(i64),
    #[error("storage read failed: {0}")]
    StorageReadFailed(#[source] io::Error),
    #[error("file {0} not found")]
    NotFound(i64),
    #[error("file {0} is already deleted")]
    AlreadyDeleted(i64),
    #[error("permission denied")]
    PermissionDenied,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 单个文件的最大字节数，必须大于 0。
    pub max_size: u64,
    /// 读取时是否由协调器自己检查归属。
    pub enforce_retrieve_ownership: bool,
}

/// 发起请求的用户。`elevated` 表示管理员等可访问他人文件的角色。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub owner_id: String,
    pub elevated: bool,
}

impl Requester {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            elevated: false,
        }
    }

    pub fn elevated(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            elevated: true,
        }
    }

    /// 读取权限检查：所有者或提升角色。
    pub fn can_access(&self, record: &FileRecord) -> bool {
        self.elevated || record.owner_id == self.owner_id
    }
}

#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub display_name: String,
    pub content_type: String,
    pub owner_id: String,
    pub folder_id: Option<i64>,
    /// 调用方声明的长度（如 Content-Length），未知时为 `None`。
    pub declared_len: Option<u64>,
}

#[derive(Debug)]
pub struct RetrievedBlob {
    pub content: Vec<u8>,
    pub content_type: String,
    pub display_name: String,
    pub record: FileRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Complete,
    /// 记录已软删除，但磁盘文件未能删除，已记入对账队列。
    PendingReconciliation,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub staging_removed: usize,
    pub unreferenced_removed: usize,
}

pub struct BlobCoordinator {
    metadata: Arc<dyn MetadataStore>,
    backend: Arc<dyn BlobBackend>,
    config: CoordinatorConfig,
    in_flight: InFlightPaths,
}

impl BlobCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        backend: Arc<dyn BlobBackend>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            metadata,
            backend,
            config,
            in_flight: InFlightPaths::default(),
        }
    }

    /// 写入一个新文件并创建记录。
    ///
    /// 成功返回已插入的记录；失败时既不留记录也不留文件。
    pub async fn store<R>(&self, request: StoreRequest, mut content: R) -> Result<FileRecord, BlobError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let display_name = request.display_name.trim();
        if display_name.is_empty() {
            return Err(BlobError::InvalidInput("file name is required".into()));
        }
        let stored_name = sanitize_file_name(display_name).ok_or_else(|| {
            BlobError::InvalidInput("file name has no usable characters".into())
        })?;
        let content_type = request.content_type.trim();
        if content_type.is_empty() {
            return Err(BlobError::InvalidInput("content type is required".into()));
        }
        let owner_dir = owner_dir(&request.owner_id)
            .ok_or_else(|| BlobError::InvalidInput("owner is required".into()))?;
        let max_size = self.config.max_size;
        if max_size == 0 {
            return Err(BlobError::InvalidInput("uploads are disabled".into()));
        }
        if let Some(declared) = request.declared_len
            && declared > max_size
        {
            return Err(BlobError::InvalidInput(format!(
                "file exceeds the {max_size} byte limit"
            )));
        }
        if let Some(folder_id) = request.folder_id {
            let active = self
                .metadata
                .folder_is_active(folder_id)
                .await
                .map_err(BlobError::MetadataReadFailed)?;
            if !active {
                return Err(BlobError::InvalidInput(format!(
                    "folder {folder_id} does not exist"
                )));
            }
        }

        self.backend
            .create_dir_all(&owner_dir)
            .await
            .map_err(BlobError::StorageWriteFailed)?;

        let token = Uuid::new_v4().simple().to_string();
        let storage_path = format!("{owner_dir}/{token}_{stored_name}");
        let staging = staging_path(&owner_dir, &token);
        let in_flight = self
            .in_flight
            .register(vec![staging.clone(), storage_path.clone()]);
        let staged = BlobGuard::new(self.backend.clone(), staging);

        let written = match self
            .backend
            .write(staged.path(), &mut content, max_size)
            .await
        {
            Ok(written) => written,
            Err(WriteError::LimitExceeded(limit)) => {
                staged.cleanup().await;
                return Err(BlobError::InvalidInput(format!(
                    "file exceeds the {limit} byte limit"
                )));
            }
            Err(WriteError::Source(err)) => {
                staged.cleanup().await;
                return Err(BlobError::InvalidInput(format!("upload stream failed: {err}")));
            }
            Err(WriteError::Io(err)) => {
                staged.cleanup().await;
                return Err(BlobError::StorageWriteFailed(err));
            }
        };
        if let Some(declared) = request.declared_len
            && declared != written
        {
            staged.cleanup().await;
            return Err(BlobError::InvalidInput(format!(
                "declared {declared} bytes but received {written}"
            )));
        }
        match self.backend.stat(staged.path()).await {
            Ok(stat) if stat.len == written => {}
            Ok(stat) => {
                staged.cleanup().await;
                return Err(BlobError::StorageWriteFailed(io::Error::other(format!(
                    "wrote {written} bytes but {} are on disk",
                    stat.len
                ))));
            }
            Err(err) => {
                staged.cleanup().await;
                return Err(BlobError::StorageWriteFailed(err));
            }
        }
        let size = i64::try_from(written)
            .map_err(|_| BlobError::InvalidInput("file is too large".into()))?;

        let record = NewFileRecord {
            display_name: request.display_name.clone(),
            content_type: content_type.to_string(),
            storage_path,
            size,
            owner_id: request.owner_id.clone(),
            folder_id: request.folder_id,
        };
        // 提交阶段不受调用方取消影响：要么插入成功，要么删除文件。
        let commit = tokio::spawn(commit_blob(
            self.backend.clone(),
            self.metadata.clone(),
            staged,
            record,
            in_flight,
        ));
        match commit.await {
            Ok(result) => result,
            Err(err) => Err(BlobError::StorageWriteFailed(io::Error::other(format!(
                "commit task failed: {err}"
            )))),
        }
    }

    /// 读取文件内容。
    pub async fn retrieve(&self, id: i64, requester: &Requester) -> Result<RetrievedBlob, BlobError> {
        let record = self.describe(id, requester).await?;

        let content = match self.backend.read(&record.storage_path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                error!(file_id = id, "active record has no blob on disk");
                return Err(BlobError::StorageInconsistent(id));
            }
            Err(err) => return Err(BlobError::StorageReadFailed(err)),
        };
        if i64::try_from(content.len()).ok() != Some(record.size) {
            error!(
                file_id = id,
                expected = record.size,
                actual = content.len(),
                "blob length does not match record"
            );
            return Err(BlobError::StorageInconsistent(id));
        }

        Ok(RetrievedBlob {
            content,
            content_type: record.content_type.clone(),
            display_name: record.display_name.clone(),
            record,
        })
    }

    /// 查询未删除的记录，并按配置执行归属检查。
    pub async fn describe(&self, id: i64, requester: &Requester) -> Result<FileRecord, BlobError> {
        let record = self
            .metadata
            .get_by_id(id)
            .await
            .map_err(BlobError::MetadataReadFailed)?
            .filter(|record| !record.is_deleted)
            .ok_or(BlobError::NotFound(id))?;
        if self.config.enforce_retrieve_ownership && !requester.can_access(&record) {
            warn!(file_id = id, requester = %requester.owner_id, "access to foreign file denied");
            return Err(BlobError::PermissionDenied);
        }
        Ok(record)
    }

    /// 删除文件：先软删除记录，再删除磁盘文件。
    ///
    /// 只有记录的所有者可以删除。
    pub async fn remove(&self, id: i64, requester: &Requester) -> Result<Removal, BlobError> {
        let record = self
            .metadata
            .get_by_id(id)
            .await
            .map_err(BlobError::MetadataReadFailed)?
            .ok_or(BlobError::NotFound(id))?;
        if record.owner_id != requester.owner_id {
            warn!(file_id = id, requester = %requester.owner_id, "delete of foreign file denied");
            return Err(BlobError::PermissionDenied);
        }
        if record.is_deleted {
            debug!(file_id = id, deleted_at = ?record.deleted_at, "file already deleted");
            return Err(BlobError::AlreadyDeleted(id));
        }

        match self
            .metadata
            .mark_soft_deleted(id, Utc::now())
            .await
            .map_err(BlobError::MetadataWriteFailed)?
        {
            SoftDelete::Deleted => {}
            SoftDelete::AlreadyDeleted => return Err(BlobError::AlreadyDeleted(id)),
            SoftDelete::Missing => return Err(BlobError::NotFound(id)),
        }

        match self.backend.remove(&record.storage_path).await {
            Ok(()) => {
                info!(file_id = id, owner = %record.owner_id, "file removed");
                Ok(Removal::Complete)
            }
            Err(err) => {
                warn!(
                    file_id = id,
                    error = %err,
                    "blob removal failed after soft delete, queued for reconciliation"
                );
                if let Err(ledger_err) = self
                    .metadata
                    .record_orphan(&record.storage_path, &err.to_string())
                    .await
                {
                    error!(file_id = id, error = %ledger_err, "failed to record orphaned blob");
                }
                Ok(Removal::PendingReconciliation)
            }
        }
    }

    pub async fn list_owned(&self, owner_id: &str) -> Result<Vec<FileRecord>, BlobError> {
        self.metadata
            .list_by_owner(owner_id)
            .await
            .map_err(BlobError::MetadataReadFailed)
    }

    /// 目录内的文件；普通用户只能看到自己的文件。
    pub async fn list_in_folder(
        &self,
        folder_id: i64,
        requester: &Requester,
    ) -> Result<Vec<FileRecord>, BlobError> {
        let owner = (!requester.elevated).then_some(requester.owner_id.as_str());
        self.metadata
            .list_by_folder(folder_id, owner)
            .await
            .map_err(BlobError::MetadataReadFailed)
    }

    /// 重试对账队列中的物理删除，返回已清理的条数。
    pub async fn reconcile(&self) -> Result<usize, MetadataError> {
        let entries = self.metadata.list_orphans(RECONCILE_BATCH).await?;
        let mut cleared = 0;
        for entry in entries {
            // 路径重新被活动记录引用时只清除队列项。
            if self.metadata.is_path_referenced(&entry.storage_path).await? {
                self.metadata.clear_orphan(entry.id).await?;
                continue;
            }
            let present = match self.backend.exists(&entry.storage_path).await {
                Ok(present) => present,
                Err(err) => {
                    debug!(orphan_id = entry.id, error = %err, "cannot inspect orphaned blob");
                    continue;
                }
            };
            if present {
                match self.backend.remove(&entry.storage_path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        debug!(
                            orphan_id = entry.id,
                            queued_at = %entry.created_at,
                            first_failure = %entry.reason,
                            error = %err,
                            "orphaned blob still not removable"
                        );
                        continue;
                    }
                }
            }
            self.metadata.clear_orphan(entry.id).await?;
            cleared += 1;
        }
        if cleared > 0 {
            info!(cleared, "reconciled orphaned blobs");
        }
        Ok(cleared)
    }

    /// 清理超过 `ttl` 的暂存文件和没有记录引用的 blob。
    pub async fn sweep(&self, ttl: Duration) -> io::Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = SystemTime::now();
        let is_stale = |modified: Option<SystemTime>| {
            modified
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= ttl)
        };

        for dir in self.backend.list_dir("").await? {
            if !dir.is_dir {
                continue;
            }
            let entries = match self.backend.list_dir(&dir.name).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(dir = %dir.name, error = %err, "failed to list owner directory");
                    continue;
                }
            };
            for entry in entries {
                if entry.is_dir || !is_stale(entry.modified) {
                    continue;
                }
                let path = format!("{}/{}", dir.name, entry.name);
                if self.in_flight.contains(&path) {
                    continue;
                }
                if is_staging_name(&entry.name) {
                    if remove_swept(self.backend.as_ref(), &path).await {
                        report.staging_removed += 1;
                    }
                    continue;
                }
                match self.metadata.is_path_referenced(&path).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(path, "removing blob without an active record");
                        if remove_swept(self.backend.as_ref(), &path).await {
                            report.unreferenced_removed += 1;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "metadata unavailable, sweep stopped");
                        return Ok(report);
                    }
                }
            }
        }
        Ok(report)
    }
}

async fn commit_blob(
    backend: Arc<dyn BlobBackend>,
    metadata: Arc<dyn MetadataStore>,
    staged: BlobGuard,
    record: NewFileRecord,
    _in_flight: InFlightEntry,
) -> Result<FileRecord, BlobError> {
    if let Err(err) = backend.rename(staged.path(), &record.storage_path).await {
        staged.cleanup().await;
        return Err(BlobError::StorageWriteFailed(err));
    }
    staged.disarm();

    let committed = BlobGuard::new(backend, record.storage_path.clone());
    match metadata.insert(&record).await {
        Ok(inserted) => {
            committed.disarm();
            info!(
                file_id = inserted.id,
                owner = %inserted.owner_id,
                size = inserted.size,
                "file stored"
            );
            Ok(inserted)
        }
        Err(err) => {
            error!(owner = %record.owner_id, error = %err, "metadata insert failed, removing blob");
            committed.cleanup().await;
            Err(BlobError::MetadataWriteFailed(err))
        }
    }
}

async fn remove_swept(backend: &dyn BlobBackend, path: &str) -> bool {
    match backend.remove(path).await {
        Ok(()) => true,
        Err(err) => {
            warn!(path, error = %err, "sweep failed to remove file");
            false
        }
    }
}

/// 把客户端提供的文件名变成可以安全放进存储路径的名字。
///
/// 只保留最后一段，去掉控制字符和 `..`，结果为空时返回 `None`。
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    let mut cleaned = cleaned;
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "");
    }
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    let mut end = trimmed.len().min(MAX_STORED_NAME_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = trimmed[..end].trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    if truncated.is_empty() {
        None
    } else {
        Some(truncated.to_string())
    }
}

/// 每个用户一个目录。非安全字符的 id 用 `~` 加十六进制编码。
pub fn owner_dir(owner_id: &str) -> Option<String> {
    if owner_id.is_empty() {
        return None;
    }
    if owner_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Some(owner_id.to_string());
    }
    let encoded: String = owner_id
        .as_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    Some(format!("~{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::metadata::{OrphanEntry, SqliteMetadataStore};
    use crate::storage::{BlobEntry, BlobStat, LocalBlobBackend};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{TempDir, tempdir};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Notify;

    struct FlakyMetadata {
        inner: SqliteMetadataStore,
        fail_insert: AtomicBool,
        hold_insert: AtomicBool,
        insert_started: Notify,
        insert_released: Notify,
    }

    #[async_trait]
    impl MetadataStore for FlakyMetadata {
        async fn insert(&self, record: &NewFileRecord) -> Result<FileRecord, MetadataError> {
            if self.fail_insert.load(Ordering::SeqCst) {
                return Err(MetadataError::Unavailable("insert disabled".into()));
            }
            if self.hold_insert.load(Ordering::SeqCst) {
                self.insert_started.notify_one();
                self.insert_released.notified().await;
            }
            self.inner.insert(record).await
        }
        async fn get_by_id(&self, id: i64) -> Result<Option<FileRecord>, MetadataError> {
            self.inner.get_by_id(id).await
        }
        async fn mark_soft_deleted(
            &self,
            id: i64,
            at: DateTime<Utc>,
        ) -> Result<SoftDelete, MetadataError> {
            self.inner.mark_soft_deleted(id, at).await
        }
        async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, MetadataError> {
            self.inner.list_by_owner(owner_id).await
        }
        async fn list_by_folder(
            &self,
            folder_id: i64,
            owner_id: Option<&str>,
        ) -> Result<Vec<FileRecord>, MetadataError> {
            self.inner.list_by_folder(folder_id, owner_id).await
        }
        async fn folder_is_active(&self, folder_id: i64) -> Result<bool, MetadataError> {
            self.inner.folder_is_active(folder_id).await
        }
        async fn is_path_referenced(&self, storage_path: &str) -> Result<bool, MetadataError> {
            self.inner.is_path_referenced(storage_path).await
        }
        async fn record_orphan(&self, storage_path: &str, reason: &str) -> Result<(), MetadataError> {
            self.inner.record_orphan(storage_path, reason).await
        }
        async fn list_orphans(&self, limit: i64) -> Result<Vec<OrphanEntry>, MetadataError> {
            self.inner.list_orphans(limit).await
        }
        async fn clear_orphan(&self, id: i64) -> Result<(), MetadataError> {
            self.inner.clear_orphan(id).await
        }
    }

    struct FlakyBackend {
        inner: LocalBlobBackend,
        fail_remove: AtomicBool,
    }

    #[async_trait]
    impl BlobBackend for FlakyBackend {
        async fn create_dir_all(&self, relative: &str) -> io::Result<()> {
            self.inner.create_dir_all(relative).await
        }
        async fn write(
            &self,
            relative: &str,
            content: &mut (dyn AsyncRead + Send + Unpin),
            limit: u64,
        ) -> Result<u64, WriteError> {
            self.inner.write(relative, content, limit).await
        }
        async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
            self.inner.rename(from, to).await
        }
        async fn read(&self, relative: &str) -> io::Result<Vec<u8>> {
            self.inner.read(relative).await
        }
        async fn remove(&self, relative: &str) -> io::Result<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "remove disabled"));
            }
            self.inner.remove(relative).await
        }
        async fn exists(&self, relative: &str) -> io::Result<bool> {
            self.inner.exists(relative).await
        }
        async fn stat(&self, relative: &str) -> io::Result<BlobStat> {
            self.inner.stat(relative).await
        }
        async fn list_dir(&self, relative: &str) -> io::Result<Vec<BlobEntry>> {
            self.inner.list_dir(relative).await
        }
    }

    struct Harness {
        _temp: TempDir,
        db: Database,
        metadata: Arc<FlakyMetadata>,
        backend: Arc<FlakyBackend>,
        coordinator: BlobCoordinator,
    }

    async fn harness() -> Harness {
        harness_with(CoordinatorConfig {
            max_size: 1024,
            enforce_retrieve_ownership: true,
        })
        .await
    }

    async fn harness_with(config: CoordinatorConfig) -> Harness {
        let temp = tempdir().expect("tempdir");
        let db = Database::open_in_memory().await.expect("open database");
        let metadata = Arc::new(FlakyMetadata {
            inner: SqliteMetadataStore::new(&db),
            fail_insert: AtomicBool::new(false),
            hold_insert: AtomicBool::new(false),
            insert_started: Notify::new(),
            insert_released: Notify::new(),
        });
        let backend = Arc::new(FlakyBackend {
            inner: LocalBlobBackend::new(temp.path().to_path_buf()),
            fail_remove: AtomicBool::new(false),
        });
        let coordinator = BlobCoordinator::new(metadata.clone(), backend.clone(), config);
        Harness {
            _temp: temp,
            db,
            metadata,
            backend,
            coordinator,
        }
    }

    fn request(name: &str, owner: &str) -> StoreRequest {
        StoreRequest {
            display_name: name.to_string(),
            content_type: "text/plain".to_string(),
            owner_id: owner.to_string(),
            folder_id: None,
            declared_len: None,
        }
    }

    async fn dir_names(backend: &dyn BlobBackend, dir: &str) -> Vec<String> {
        backend
            .list_dir(dir)
            .await
            .map(|entries| entries.into_iter().map(|entry| entry.name).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn store_then_retrieve_returns_original_content() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("a.txt", "u1"), &b"hello"[..])
            .await
            .expect("store");
        assert_eq!(record.size, 5);
        assert_eq!(record.owner_id, "u1");
        assert!(record.folder_id.is_none());

        let blob = h
            .coordinator
            .retrieve(record.id, &Requester::owner("u1"))
            .await
            .expect("retrieve");
        assert_eq!(blob.content, b"hello");
        assert_eq!(blob.content_type, "text/plain");
        assert_eq!(blob.display_name, "a.txt");
    }

    #[tokio::test]
    async fn traversal_name_stays_inside_owner_dir() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("../../etc/passwd", "u1"), &b"root"[..])
            .await
            .expect("store");
        assert!(!record.storage_path.contains(".."));
        assert!(record.storage_path.starts_with("u1/"));
        assert_eq!(record.storage_path.matches('/').count(), 1);
        assert!(record.storage_path.ends_with("_passwd"));
        assert_eq!(record.display_name, "../../etc/passwd");
        assert_eq!(dir_names(h.backend.as_ref(), "u1").await.len(), 1);
    }

    #[tokio::test]
    async fn insert_failure_leaves_no_file() {
        let h = harness().await;
        h.metadata.fail_insert.store(true, Ordering::SeqCst);

        let result = h
            .coordinator
            .store(request("a.txt", "u1"), &b"hello"[..])
            .await;
        assert!(matches!(result, Err(BlobError::MetadataWriteFailed(_))));
        assert!(dir_names(h.backend.as_ref(), "u1").await.is_empty());
        assert!(h.coordinator.list_owned("u1").await.expect("list").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_same_name_stores_do_not_collide() {
        let h = harness().await;
        let (first, second) = tokio::join!(
            h.coordinator.store(request("same.txt", "u1"), &b"one"[..]),
            h.coordinator.store(request("same.txt", "u1"), &b"two"[..]),
        );
        let first = first.expect("first store");
        let second = second.expect("second store");
        assert_ne!(first.storage_path, second.storage_path);

        let owner = Requester::owner("u1");
        let first_blob = h.coordinator.retrieve(first.id, &owner).await.expect("first");
        let second_blob = h.coordinator.retrieve(second.id, &owner).await.expect("second");
        assert_eq!(first_blob.content, b"one");
        assert_eq!(second_blob.content, b"two");
        assert_eq!(dir_names(h.backend.as_ref(), "u1").await.len(), 2);
    }

    #[tokio::test]
    async fn foreign_requester_is_denied() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("a.txt", "u2"), &b"hello"[..])
            .await
            .expect("store");

        let intruder = Requester::owner("u1");
        let read = h.coordinator.retrieve(record.id, &intruder).await;
        assert!(matches!(read, Err(BlobError::PermissionDenied)));
        let removal = h.coordinator.remove(record.id, &intruder).await;
        assert!(matches!(removal, Err(BlobError::PermissionDenied)));

        let blob = h
            .coordinator
            .retrieve(record.id, &Requester::owner("u2"))
            .await
            .expect("owner still reads");
        assert_eq!(blob.content, b"hello");
    }

    #[tokio::test]
    async fn elevated_requester_reads_but_cannot_remove() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("a.txt", "u2"), &b"hello"[..])
            .await
            .expect("store");
        let admin = Requester::elevated("admin");
        h.coordinator
            .retrieve(record.id, &admin)
            .await
            .expect("elevated read");
        let removal = h.coordinator.remove(record.id, &admin).await;
        assert!(matches!(removal, Err(BlobError::PermissionDenied)));
    }

    #[tokio::test]
    async fn ownership_hook_can_be_left_to_caller() {
        let h = harness_with(CoordinatorConfig {
            max_size: 1024,
            enforce_retrieve_ownership: false,
        })
        .await;
        let record = h
            .coordinator
            .store(request("a.txt", "u2"), &b"hello"[..])
            .await
            .expect("store");
        let intruder = Requester::owner("u1");
        h.coordinator
            .retrieve(record.id, &intruder)
            .await
            .expect("coordinator does not enforce");
        let described = h.coordinator.describe(record.id, &intruder).await.expect("describe");
        assert!(!intruder.can_access(&described));
    }

    #[tokio::test]
    async fn second_remove_reports_already_deleted() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("a.txt", "u1"), &b"hello"[..])
            .await
            .expect("store");
        let owner = Requester::owner("u1");

        let first = h.coordinator.remove(record.id, &owner).await.expect("remove");
        assert_eq!(first, Removal::Complete);
        let second = h.coordinator.remove(record.id, &owner).await;
        assert!(matches!(second, Err(BlobError::AlreadyDeleted(id)) if id == record.id));

        let read = h.coordinator.retrieve(record.id, &owner).await;
        assert!(matches!(read, Err(BlobError::NotFound(_))));
        assert!(dir_names(h.backend.as_ref(), "u1").await.is_empty());
    }

    #[tokio::test]
    async fn remove_of_unknown_id_is_not_found() {
        let h = harness().await;
        let result = h.coordinator.remove(42, &Requester::owner("u1")).await;
        assert!(matches!(result, Err(BlobError::NotFound(42))));
    }

    #[tokio::test]
    async fn failed_physical_delete_keeps_soft_delete_and_queues_reconciliation() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("a.txt", "u1"), &b"hello"[..])
            .await
            .expect("store");
        let owner = Requester::owner("u1");
        h.backend.fail_remove.store(true, Ordering::SeqCst);

        let outcome = h.coordinator.remove(record.id, &owner).await.expect("remove");
        assert_eq!(outcome, Removal::PendingReconciliation);

        let loaded = h
            .metadata
            .get_by_id(record.id)
            .await
            .expect("get")
            .expect("record kept");
        assert!(loaded.is_deleted);
        let orphans = h.metadata.list_orphans(10).await.expect("orphans");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].storage_path, record.storage_path);

        let read = h.coordinator.retrieve(record.id, &owner).await;
        assert!(matches!(
            read,
            Err(BlobError::NotFound(_)) | Err(BlobError::StorageInconsistent(_))
        ));

        h.backend.fail_remove.store(false, Ordering::SeqCst);
        assert_eq!(h.coordinator.reconcile().await.expect("reconcile"), 1);
        assert!(h.metadata.list_orphans(10).await.expect("orphans").is_empty());
        assert!(dir_names(h.backend.as_ref(), "u1").await.is_empty());
    }

    #[tokio::test]
    async fn missing_blob_is_inconsistent_not_absent() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("a.txt", "u1"), &b"hello"[..])
            .await
            .expect("store");
        h.backend
            .inner
            .remove(&record.storage_path)
            .await
            .expect("tamper");

        let read = h.coordinator.retrieve(record.id, &Requester::owner("u1")).await;
        assert!(matches!(read, Err(BlobError::StorageInconsistent(id)) if id == record.id));
    }

    #[tokio::test]
    async fn truncated_blob_is_inconsistent() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("a.txt", "u1"), &b"hello"[..])
            .await
            .expect("store");
        let path = h.backend.inner.root_path().join(&record.storage_path);
        std::fs::write(&path, b"hel").expect("truncate");

        let read = h.coordinator.retrieve(record.id, &Requester::owner("u1")).await;
        assert!(matches!(read, Err(BlobError::StorageInconsistent(_))));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_writing() {
        let h = harness().await;
        for (name, content_type, owner) in [
            ("", "text/plain", "u1"),
            ("   ", "text/plain", "u1"),
            ("..", "text/plain", "u1"),
            ("dir/", "text/plain", "u1"),
            ("a.txt", "", "u1"),
            ("a.txt", "text/plain", ""),
        ] {
            let mut req = request(name, owner);
            req.content_type = content_type.to_string();
            let result = h.coordinator.store(req, &b"x"[..]).await;
            assert!(
                matches!(result, Err(BlobError::InvalidInput(_))),
                "expected invalid input for {name:?}/{content_type:?}/{owner:?}"
            );
        }
        assert!(dir_names(h.backend.as_ref(), "").await.is_empty());
    }

    #[tokio::test]
    async fn size_limit_is_enforced() {
        let h = harness_with(CoordinatorConfig {
            max_size: 4,
            enforce_retrieve_ownership: true,
        })
        .await;

        let mut declared = request("a.txt", "u1");
        declared.declared_len = Some(10);
        let result = h.coordinator.store(declared, &b"0123456789"[..]).await;
        assert!(matches!(result, Err(BlobError::InvalidInput(_))));

        let result = h
            .coordinator
            .store(request("a.txt", "u1"), &b"0123456789"[..])
            .await;
        assert!(matches!(result, Err(BlobError::InvalidInput(_))));
        assert!(dir_names(h.backend.as_ref(), "u1").await.is_empty());

        let mut short = request("a.txt", "u1");
        short.declared_len = Some(4);
        let result = h.coordinator.store(short, &b"012"[..]).await;
        assert!(matches!(result, Err(BlobError::InvalidInput(_))));
        assert!(dir_names(h.backend.as_ref(), "u1").await.is_empty());

        h.coordinator
            .store(request("a.txt", "u1"), &b"0123"[..])
            .await
            .expect("exactly at the limit");
    }

    #[tokio::test]
    async fn unknown_folder_is_invalid_input() {
        let h = harness().await;
        let mut req = request("a.txt", "u1");
        req.folder_id = Some(7);
        let result = h.coordinator.store(req, &b"hello"[..]).await;
        assert!(matches!(result, Err(BlobError::InvalidInput(_))));

        sqlx::query("INSERT INTO folders (name, created_by, created_at) VALUES ('docs', 'u1', ?)")
            .bind(Utc::now())
            .execute(h.db.pool())
            .await
            .expect("insert folder");
        let mut req = request("a.txt", "u1");
        req.folder_id = Some(1);
        let record = h.coordinator.store(req, &b"hello"[..]).await.expect("store");
        assert_eq!(record.folder_id, Some(1));

        let listed = h
            .coordinator
            .list_in_folder(1, &Requester::owner("u2"))
            .await
            .expect("list");
        assert!(listed.is_empty());
        let listed = h
            .coordinator
            .list_in_folder(1, &Requester::elevated("admin"))
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_store_leaves_no_file() {
        let h = harness().await;
        let (mut sender, receiver) = tokio::io::duplex(64);
        sender.write_all(b"partial").await.expect("send");

        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            h.coordinator.store(request("a.txt", "u1"), receiver),
        )
        .await;
        assert!(outcome.is_err(), "store should still be waiting for input");

        for _ in 0..50 {
            if dir_names(h.backend.as_ref(), "u1").await.is_empty() {
                drop(sender);
                assert!(h.coordinator.list_owned("u1").await.expect("list").is_empty());
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("staging file survived cancellation");
    }

    #[tokio::test]
    async fn sweep_removes_stale_staging_and_unreferenced_blobs() {
        let h = harness().await;
        let kept = h
            .coordinator
            .store(request("kept.txt", "u1"), &b"keep"[..])
            .await
            .expect("store");
        h.backend.inner.create_dir_all("u1").await.expect("mkdir");
        let mut stray: &[u8] = b"stray";
        h.backend
            .inner
            .write("u1/.deadbeef.tmp", &mut stray, 64)
            .await
            .expect("stray staging");
        let mut orphan: &[u8] = b"orphan";
        h.backend
            .inner
            .write("u1/deadbeef_lost.txt", &mut orphan, 64)
            .await
            .expect("orphan blob");

        let fresh = h.coordinator.sweep(Duration::from_secs(3600)).await.expect("sweep");
        assert_eq!(fresh, SweepReport::default());

        let report = h.coordinator.sweep(Duration::ZERO).await.expect("sweep");
        assert_eq!(report.staging_removed, 1);
        assert_eq!(report.unreferenced_removed, 1);

        let remaining = dir_names(h.backend.as_ref(), "u1").await;
        assert_eq!(remaining.len(), 1);
        assert!(kept.storage_path.ends_with(&remaining[0]));
    }

    #[tokio::test]
    async fn sweep_skips_blob_waiting_for_its_record() {
        let h = harness().await;
        h.metadata.hold_insert.store(true, Ordering::SeqCst);

        let store = h.coordinator.store(request("slow.txt", "u1"), &b"slow"[..]);
        let sweep = async {
            h.metadata.insert_started.notified().await;
            let report = h.coordinator.sweep(Duration::ZERO).await.expect("sweep");
            h.metadata.insert_released.notify_one();
            report
        };
        let (stored, report) = tokio::join!(store, sweep);
        let record = stored.expect("store");
        assert_eq!(report, SweepReport::default());

        let blob = h
            .coordinator
            .retrieve(record.id, &Requester::owner("u1"))
            .await
            .expect("retrieve after sweep");
        assert_eq!(blob.content, b"slow");

        let report = h.coordinator.sweep(Duration::ZERO).await.expect("sweep");
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn long_multibyte_name_is_stored() {
        let h = harness().await;
        let name = format!("{}.txt", "报".repeat(90));
        let record = h
            .coordinator
            .store(request(&name, "u1"), &b"report"[..])
            .await
            .expect("store long name");
        assert_eq!(record.display_name, name);

        let blob = h
            .coordinator
            .retrieve(record.id, &Requester::owner("u1"))
            .await
            .expect("retrieve");
        assert_eq!(blob.display_name, name);
        assert_eq!(blob.content, b"report");
    }

    #[tokio::test]
    async fn display_name_is_kept_as_declared() {
        let h = harness().await;
        let record = h
            .coordinator
            .store(request("  notes.txt ", "u1"), &b"n"[..])
            .await
            .expect("store");
        let blob = h
            .coordinator
            .retrieve(record.id, &Requester::owner("u1"))
            .await
            .expect("retrieve");
        assert_eq!(blob.display_name, "  notes.txt ");
        assert!(record.storage_path.ends_with("_notes.txt"));
    }

    #[tokio::test]
    async fn broken_upload_stream_is_invalid_input() {
        let h = harness().await;
        let chunks: Vec<io::Result<&'static [u8]>> = vec![
            Ok(&b"partial"[..]),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let reader = tokio_util::io::StreamReader::new(futures_util::stream::iter(chunks));
        let result = h.coordinator.store(request("a.txt", "u1"), reader).await;
        assert!(matches!(result, Err(BlobError::InvalidInput(_))));
        assert!(dir_names(h.backend.as_ref(), "u1").await.is_empty());
        assert!(h.coordinator.list_owned("u1").await.expect("list").is_empty());
    }

    #[test]
    fn sanitize_strips_paths_and_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("..\\..\\boot.ini").as_deref(), Some("boot.ini"));
        assert_eq!(sanitize_file_name("a....b.txt").as_deref(), Some("ab.txt"));
        assert_eq!(sanitize_file_name("...hidden").as_deref(), Some("hidden"));
        assert_eq!(sanitize_file_name("bad\u{0}name\n.txt").as_deref(), Some("badname.txt"));
        assert_eq!(sanitize_file_name("what?.txt").as_deref(), Some("what_.txt"));
        assert_eq!(sanitize_file_name("报告.pdf").as_deref(), Some("报告.pdf"));
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("folder/"), None);
        assert_eq!(sanitize_file_name(" . "), None);

        let long = "x".repeat(300);
        let sanitized = sanitize_file_name(&long).expect("long name");
        assert_eq!(sanitized.len(), MAX_STORED_NAME_BYTES);

        let cjk = format!("{}.txt", "报".repeat(90));
        let sanitized = sanitize_file_name(&cjk).expect("cjk name");
        assert!(sanitized.len() <= MAX_STORED_NAME_BYTES);
        assert!(sanitized.chars().all(|c| c == '报'));
    }

    #[test]
    fn owner_dir_is_safe_and_injective() {
        assert_eq!(owner_dir("u1").as_deref(), Some("u1"));
        assert_eq!(owner_dir("user-01_a").as_deref(), Some("user-01_a"));
        assert_eq!(owner_dir("../x").as_deref(), Some("~2e2e2f78"));
        assert_eq!(owner_dir("a b").as_deref(), Some("~612062"));
        assert_ne!(owner_dir("a.b"), owner_dir("a_b"));
        assert_eq!(owner_dir(""), None);
    }
}
