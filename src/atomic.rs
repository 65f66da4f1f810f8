//! 暂存写入与原子提交的辅助方法。

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, warn};

use crate::storage::BlobBackend;

pub const STAGING_SUFFIX: &str = ".tmp";

/// 返回目标目录下的暂存文件相对路径。
pub fn staging_path(dir: &str, token: &str) -> String {
    format!("{dir}/.{token}{STAGING_SUFFIX}")
}

pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}

/// 持有一个尚未被元数据确认的 blob。
///
/// 未调用 [`BlobGuard::disarm`] 就被丢弃时（包括所在的 future 被取消），
/// 会在后台删除该文件。
pub struct BlobGuard {
    backend: Arc<dyn BlobBackend>,
    path: Option<String>,
}

impl BlobGuard {
    pub fn new(backend: Arc<dyn BlobBackend>, path: String) -> Self {
        Self {
            backend,
            path: Some(path),
        }
    }

    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or_default()
    }

    /// 文件已被确认，不再清理。
    pub fn disarm(mut self) {
        self.path = None;
    }

    /// 立即删除文件，返回是否成功（文件已不存在也算成功）。
    pub async fn cleanup(mut self) -> bool {
        let Some(path) = self.path.take() else {
            return true;
        };
        remove_quietly(self.backend.as_ref(), &path).await
    }
}

impl Drop for BlobGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_quietly(backend.as_ref(), &path).await;
                });
            }
            Err(_) => warn!(path, "no runtime available to remove abandoned blob"),
        }
    }
}

/// 正在写入或等待元数据确认的相对路径。
///
/// 清扫任务跳过这些路径：rename 之后、插入记录之前的 blob 还没有被引用，
/// 但不能被当成孤儿删除。
#[derive(Debug, Clone, Default)]
pub struct InFlightPaths {
    paths: Arc<Mutex<HashSet<String>>>,
}

impl InFlightPaths {
    /// 登记一组路径，返回的句柄被丢弃时自动注销。
    pub fn register(&self, paths: Vec<String>) -> InFlightEntry {
        let mut set = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        for path in &paths {
            set.insert(path.clone());
        }
        InFlightEntry {
            registry: self.clone(),
            paths,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }
}

pub struct InFlightEntry {
    registry: InFlightPaths,
    paths: Vec<String>,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let mut set = self
            .registry
            .paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for path in &self.paths {
            set.remove(path);
        }
    }
}

async fn remove_quietly(backend: &dyn BlobBackend, path: &str) -> bool {
    match backend.remove(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            error!(path, error = %err, "failed to remove uncommitted blob");
            false
        }
    }
}

/// 同步目录项，使 rename 结果落盘。
pub async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
