//! 会话清理、孤立文件对账与暂存文件清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::{AuthConfig, prune_expired_sessions};
use crate::blob::BlobCoordinator;
use crate::config::SESSION_PRUNE_INTERVAL_SECS;

#[derive(Debug, Clone, Copy)]
pub struct SweepSchedule {
    /// 为零时不启动对账任务。
    pub interval: Duration,
    pub temp_ttl: Duration,
}

/// 启动后台任务。
pub fn spawn_background_tasks(
    coordinator: Arc<BlobCoordinator>,
    auth: Arc<AuthConfig>,
    schedule: SweepSchedule,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            prune_expired_sessions(&auth).await;
        }
    });

    if schedule.interval.is_zero() {
        info!("blob sweeping disabled");
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(schedule.interval);
        loop {
            interval.tick().await;
            run_maintenance(&coordinator, schedule.temp_ttl).await;
        }
    });
}

async fn run_maintenance(coordinator: &BlobCoordinator, temp_ttl: Duration) {
    if let Err(err) = coordinator.reconcile().await {
        warn!(error = %err, "orphan reconciliation failed");
    }
    match coordinator.sweep(temp_ttl).await {
        Ok(report) if report.staging_removed + report.unreferenced_removed > 0 => {
            info!(
                staging = report.staging_removed,
                unreferenced = report.unreferenced_removed,
                "storage sweep removed files"
            );
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "storage sweep failed"),
    }
}
