//! 同步调度器
//!
//! 同一对目录同时只运行一个周期；持续模式下两次周期之间等待固定间隔（从上一周期结束算起）。

use crate::config::SyncSettings;
use crate::core::engine::{CycleState, SyncEngine};
use crate::core::report::{ActionReport, CycleStatus};
use crate::error::{Result, SyncError};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// 同步调度器
pub struct Scheduler {
    engine: SyncEngine,
    interval: Duration,
    state: Arc<RwLock<SchedulerState>>,
    /// 持有锁即表示有周期在运行；内容是上一周期的快照
    previous: Mutex<CycleState>,
}

impl Scheduler {
    /// 创建调度器，拒绝 interactive 策略
    pub fn new(settings: SyncSettings, interval: Duration) -> Result<Self> {
        settings.validate(true)?;
        if interval.is_zero() {
            return Err(SyncError::Config("同步间隔必须大于 0".to_string()));
        }
        let engine = SyncEngine::new(settings, None)?;
        Ok(Self {
            engine,
            interval,
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
            previous: Mutex::new(CycleState::default()),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn set_state(state: &RwLock<SchedulerState>, value: SchedulerState) {
        *state.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// 立即运行一个周期；已有周期在运行时返回 `AlreadyRunning`
    pub async fn trigger(&self, cancel: &CancellationToken) -> Result<ActionReport> {
        let mut previous = self
            .previous
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        Self::set_state(&self.state, SchedulerState::Running);
        let _idle = scopeguard::guard(self.state.clone(), |state| {
            let mut current = state.write().unwrap_or_else(PoisonError::into_inner);
            if *current == SchedulerState::Running {
                *current = SchedulerState::Idle;
            }
        });

        match self.engine.run(&previous, cancel).await {
            Ok(outcome) => {
                *previous = outcome.state;
                Ok(outcome.report)
            }
            Err(e) => {
                *previous = CycleState::default();
                Err(e)
            }
        }
    }

    /// 持续运行直到取消，每个周期产出一个报告
    ///
    /// 致命扫描错误会作为错误项产出，然后结束。
    pub fn run_continuous(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> ReceiverStream<Result<ActionReport>> {
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let state = self.state.clone();
            let stopped = scopeguard::guard(state, |state| {
                Self::set_state(&state, SchedulerState::Stopped);
            });

            info!("持续同步已启动 (间隔: {} 秒)", self.interval.as_secs());

            while !cancel.is_cancelled() {
                match self.trigger(&cancel).await {
                    Ok(report) => {
                        let cancelled = report.status == CycleStatus::Cancelled;
                        if tx.send(Ok(report)).await.is_err() {
                            info!("报告接收端已关闭");
                            break;
                        }
                        if cancelled {
                            break;
                        }
                    }
                    Err(SyncError::AlreadyRunning) => {
                        warn!("上一周期仍在运行，跳过本次触发");
                    }
                    Err(e) => {
                        let fatal = e.is_fatal();
                        error!("同步周期失败: {}", e);
                        let _ = tx.send(Err(e)).await;
                        if fatal {
                            break;
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }

            info!("持续同步已停止");
            drop(stopped);
            drop(tx);
        });

        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conflict::ConflictStrategy;
    use std::fs;
    use tokio_stream::StreamExt;

    #[test]
    fn test_rejects_interactive() {
        let settings =
            SyncSettings::new("/a", "/b").with_strategy(ConflictStrategy::Interactive);
        let result = Scheduler::new(settings, Duration::from_secs(1));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let result = Scheduler::new(SyncSettings::new("/a", "/b"), Duration::ZERO);
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_trigger_returns_to_idle() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();

        let scheduler =
            Scheduler::new(SyncSettings::new(src.path(), dst.path()), Duration::from_secs(1))
                .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let report = scheduler.trigger(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.copied.len(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_overlapping_trigger_refused() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let scheduler =
            Scheduler::new(SyncSettings::new(src.path(), dst.path()), Duration::from_secs(1))
                .unwrap();

        // 模拟正在运行的周期
        let _running = scheduler.previous.lock().await;
        let result = scheduler.trigger(&CancellationToken::new()).await;
        assert!(matches!(result, Err(SyncError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_continuous_stops_on_cancel() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();

        let scheduler = Arc::new(
            Scheduler::new(
                SyncSettings::new(src.path(), dst.path()),
                Duration::from_millis(20),
            )
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        let mut stream = scheduler.clone().run_continuous(cancel.clone());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.status, CycleStatus::Completed);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.status, CycleStatus::InSync);

        cancel.cancel();
        while stream.next().await.is_some() {}
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_fatal_scan_ends_stream() {
        let dst = tempfile::tempdir().unwrap();
        let missing = dst.path().join("missing");
        let target = tempfile::tempdir().unwrap();

        let scheduler = Arc::new(
            Scheduler::new(
                SyncSettings::new(&missing, target.path()),
                Duration::from_millis(10),
            )
            .unwrap(),
        );
        let mut stream = scheduler.run_continuous(CancellationToken::new());

        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(SyncError::FatalScan { .. })));
        assert!(stream.next().await.is_none());
    }
}
