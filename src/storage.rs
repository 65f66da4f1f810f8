//! Blob 存储后端：根目录内的受检路径解析与文件原语。

use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ErrorKind};

use crate::atomic::sync_dir;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// 写入暂存文件时的失败原因。
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("content exceeds the {0} byte limit")]
    LimitExceeded(u64),
    /// 读取来源流失败（客户端中断等），与磁盘错误区分。
    #[error("content stream failed: {0}")]
    Source(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct BlobStat {
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub name: String,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
}

/// 文件系统（或对象存储）边界。
///
/// 所有路径都是相对于后端根目录的 `/` 分隔路径，绝对路径不会离开后端。
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// 创建目录（含父级），目录已存在时视为成功。
    async fn create_dir_all(&self, relative: &str) -> io::Result<()>;

    /// 把内容流写入新文件并落盘，超过 `limit` 字节时中止。
    async fn write(
        &self,
        relative: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
        limit: u64,
    ) -> Result<u64, WriteError>;

    /// 原子重命名（同目录内）。
    async fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    async fn read(&self, relative: &str) -> io::Result<Vec<u8>>;

    async fn remove(&self, relative: &str) -> io::Result<()>;

    async fn exists(&self, relative: &str) -> io::Result<bool>;

    async fn stat(&self, relative: &str) -> io::Result<BlobStat>;

    /// 列出目录下的直接子项，空字符串表示根目录。
    async fn list_dir(&self, relative: &str) -> io::Result<Vec<BlobEntry>>;
}

/// 本地磁盘实现。
#[derive(Clone, Debug)]
pub struct LocalBlobBackend {
    root: PathBuf,
}

impl LocalBlobBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    async fn resolve_checked(&self, relative: &str, allow_missing_leaf: bool) -> io::Result<PathBuf> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        let mut normalized = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid_path(relative));
                }
            }
        }
        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> io::Result<()> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| invalid_path(&target.to_string_lossy()))?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(invalid_path(&current.to_string_lossy()));
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(invalid_path(&current.to_string_lossy()));
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl BlobBackend for LocalBlobBackend {
    async fn create_dir_all(&self, relative: &str) -> io::Result<()> {
        let target = self.resolve_checked(relative, true).await?;
        match fs::create_dir_all(&target).await {
            Ok(()) => Ok(()),
            // 并发创建同一目录时另一方可能先完成。
            Err(err) if err.kind() == ErrorKind::AlreadyExists && target.is_dir() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn write(
        &self,
        relative: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
        limit: u64,
    ) -> Result<u64, WriteError> {
        let target = self.resolve_checked(relative, true).await?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut total_written: u64 = 0;
        loop {
            let read = content.read(&mut buffer).await.map_err(WriteError::Source)?;
            if read == 0 {
                break;
            }
            total_written += read as u64;
            if total_written > limit {
                return Err(WriteError::LimitExceeded(limit));
            }
            file.write_all(&buffer[..read]).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(total_written)
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let source = self.resolve_checked(from, false).await?;
        let target = self.resolve_checked(to, true).await?;
        fs::rename(&source, &target).await?;
        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    async fn read(&self, relative: &str) -> io::Result<Vec<u8>> {
        let target = self.resolve_checked(relative, false).await?;
        fs::read(&target).await
    }

    async fn remove(&self, relative: &str) -> io::Result<()> {
        let target = self.resolve_checked(relative, false).await?;
        fs::remove_file(&target).await
    }

    async fn exists(&self, relative: &str) -> io::Result<bool> {
        let target = self.resolve_checked(relative, true).await?;
        fs::try_exists(&target).await
    }

    async fn stat(&self, relative: &str) -> io::Result<BlobStat> {
        let target = self.resolve_checked(relative, false).await?;
        let metadata = fs::metadata(&target).await?;
        Ok(BlobStat {
            len: metadata.len(),
        })
    }

    async fn list_dir(&self, relative: &str) -> io::Result<Vec<BlobEntry>> {
        let target = self.resolve_checked(relative, false).await?;
        let mut dir = fs::read_dir(&target).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(BlobEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: metadata.is_dir(),
                modified: metadata.modified().ok(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn invalid_path(path: &str) -> io::Error {
    io::Error::new(
        ErrorKind::InvalidInput,
        format!("invalid storage path: {path}"),
    )
}
