use crate::config::SyncSettings;
use crate::core::comparator::FileComparator;
use crate::core::conflict::{ConflictDecider, ConflictResolver};
use crate::core::executor::{ActionExecutor, ExecutorConfig};
use crate::core::report::{ActionReport, CycleStatus};
use crate::core::snapshot::{DirectorySnapshot, ScanConfig, SnapshotBuilder};
use crate::error::Result;
use chrono::Utc;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 上一周期留下的快照，供下一周期复用摘要
#[derive(Debug, Clone, Default)]
pub struct CycleState {
    pub source: Option<Arc<DirectorySnapshot>>,
    pub target: Option<Arc<DirectorySnapshot>>,
}

impl CycleState {
    fn from_snapshots(source: DirectorySnapshot, target: DirectorySnapshot) -> Self {
        Self {
            source: Some(Arc::new(source)),
            target: Some(Arc::new(target)),
        }
    }
}

/// 一个周期的结果
#[derive(Debug)]
pub struct CycleOutcome {
    pub report: ActionReport,
    pub state: CycleState,
}

/// 同步引擎
pub struct SyncEngine {
    settings: SyncSettings,
    scan_config: ScanConfig,
    comparator: FileComparator,
    resolver: ConflictResolver,
    executor: ActionExecutor,
}

impl SyncEngine {
    /// 校验配置并构建各阶段组件
    pub fn new(settings: SyncSettings, decider: Option<Arc<dyn ConflictDecider>>) -> Result<Self> {
        settings.validate(false)?;
        let scan_config = ScanConfig::from_settings(&settings)?;
        let comparator = FileComparator::new(settings.time_tolerance());
        let resolver = ConflictResolver::new(settings.conflict_strategy, decider)?;
        let executor = ActionExecutor::new(ExecutorConfig::from_settings(&settings));

        Ok(Self {
            settings,
            scan_config,
            comparator,
            resolver,
            executor,
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// 运行一个完整周期：扫描、比较、解决冲突、执行
    ///
    /// 取消和超时只在执行之前生效；执行阶段一旦开始就会完成，
    /// 不会留下执行了一半的计划。
    pub async fn run(
        &self,
        previous: &CycleState,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let started = Instant::now();
        let cycle_timestamp = Utc::now();
        let settings = &self.settings;
        let mut report = ActionReport::new(cycle_timestamp, settings.dry_run);
        let deadline = settings
            .cycle_timeout()
            .map(|timeout| tokio::time::Instant::now() + timeout);

        info!(
            "开始同步周期 {}: {} -> {} (模式: {}{})",
            report.cycle_id,
            settings.source_root.display(),
            settings.target_root.display(),
            settings.mode,
            if settings.dry_run { ", 预演" } else { "" }
        );

        // 1. 扫描两侧
        let source_builder =
            SnapshotBuilder::new(self.scan_config.clone()).with_previous(previous.source.clone());
        let target_builder =
            SnapshotBuilder::new(self.scan_config.clone()).with_previous(previous.target.clone());
        let scanned = within(deadline, async {
            tokio::try_join!(
                source_builder.build(&settings.source_root),
                target_builder.build(&settings.target_root)
            )
        })
        .await;
        let Some(scanned) = scanned else {
            return Ok(self.timed_out(report, started));
        };
        let (source, target) = scanned?;

        info!(
            "扫描完成: 源 {} 项, 目标 {} 项 ({}ms)",
            source.len(),
            target.len(),
            started.elapsed().as_millis()
        );
        report
            .warnings
            .extend(source.warnings().iter().chain(target.warnings()).cloned());

        if cancel.is_cancelled() {
            return Ok(Self::cancelled(report, started, source, target));
        }

        // 2. 比较
        let plan = self.comparator.diff(&source, &target, settings.mode);
        let summary = plan.summarize(&source, &target);
        info!(
            "比较完成: 正向复制 {} ({} 字节), 反向复制 {} ({} 字节), 删除 {}, 冲突 {}",
            summary.forward_copy_count,
            summary.forward_copy_bytes,
            summary.reverse_copy_count,
            summary.reverse_copy_bytes,
            summary.delete_count,
            summary.conflict_count
        );

        if cancel.is_cancelled() {
            return Ok(Self::cancelled(report, started, source, target));
        }

        // 3. 解决冲突（整体在执行之前完成）
        let resolved = within(
            deadline,
            self.resolver.resolve_all(&plan, &source, &target, cycle_timestamp),
        )
        .await;
        let Some(resolved) = resolved else {
            return Ok(self.timed_out(report, started));
        };

        if cancel.is_cancelled() {
            return Ok(Self::cancelled(report, started, source, target));
        }
        if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
            return Ok(self.timed_out(report, started));
        }

        // 4. 执行
        let outcomes = self
            .executor
            .apply(&plan, &resolved, &source, &target, settings.dry_run)
            .await;
        for outcome in outcomes {
            report.push(outcome);
        }
        report.finish(started.elapsed());

        info!(
            "同步周期 {} 结束: 复制 {}, 删除 {}, 冲突 {}, 失败 {}, 耗时 {}ms",
            report.cycle_id,
            report.copied.len(),
            report.deleted.len(),
            report.conflicts_resolved.len(),
            report.failures.len(),
            report.duration_ms
        );

        let state = if settings.dry_run || report.status == CycleStatus::InSync {
            CycleState::from_snapshots(source, target)
        } else {
            // 被写入或重命名的路径不能复用旧摘要
            let touched = touched_paths(&report);
            debug!("失效 {} 个路径的摘要缓存", touched.len());
            CycleState::from_snapshots(
                source.without(touched.iter().map(String::as_str)),
                target.without(touched.iter().map(String::as_str)),
            )
        };

        Ok(CycleOutcome { report, state })
    }

    /// 超时发生在执行之前，目标未被修改；丢弃快照，下一周期从头扫描
    fn timed_out(&self, mut report: ActionReport, started: Instant) -> CycleOutcome {
        let timeout = self.settings.cycle_timeout().unwrap_or_default();
        warn!(
            "同步周期 {} 超时 ({} 秒)，未执行任何动作",
            report.cycle_id,
            timeout.as_secs()
        );
        report.mark_timed_out(timeout, started.elapsed());
        CycleOutcome {
            report,
            state: CycleState::default(),
        }
    }

    fn cancelled(
        mut report: ActionReport,
        started: Instant,
        source: DirectorySnapshot,
        target: DirectorySnapshot,
    ) -> CycleOutcome {
        info!("同步周期 {} 已取消", report.cycle_id);
        report.cancel(started.elapsed());
        CycleOutcome {
            report,
            state: CycleState::from_snapshots(source, target),
        }
    }
}

/// 在截止时间之前完成 `fut`，超时返回 None
async fn within<F: Future>(
    deadline: Option<tokio::time::Instant>,
    fut: F,
) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// 本周期可能修改过的全部路径（失败的也算）
fn touched_paths(report: &ActionReport) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    paths.extend(report.copied.iter().map(|c| c.path.clone()));
    paths.extend(report.deleted.iter().cloned());
    for resolved in &report.conflicts_resolved {
        paths.insert(resolved.path.clone());
        if let Some(renamed) = &resolved.renamed_to {
            paths.insert(renamed.clone());
        }
    }
    paths.extend(report.failures.iter().map(|f| f.path.clone()));
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::core::conflict::{ConflictStrategy, Resolution};
    use crate::error::{ErrorKind, SyncError};
    use std::fs;

    fn settings(src: &std::path::Path, dst: &std::path::Path) -> SyncSettings {
        SyncSettings::new(src, dst)
    }

    #[tokio::test]
    async fn test_cycle_then_in_sync() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"alpha").unwrap();

        let engine = SyncEngine::new(settings(src.path(), dst.path()), None).unwrap();
        let cancel = CancellationToken::new();

        let first = engine.run(&CycleState::default(), &cancel).await.unwrap();
        assert_eq!(first.report.status, CycleStatus::Completed);
        assert_eq!(first.report.copied.len(), 1);
        // 写入过的路径不在缓存里
        assert!(!first.state.source.as_ref().unwrap().contains("a.txt"));

        let second = engine.run(&first.state, &cancel).await.unwrap();
        assert_eq!(second.report.status, CycleStatus::InSync);
        assert!(second.report.is_in_sync());
    }

    #[tokio::test]
    async fn test_cancelled_before_execution() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"alpha").unwrap();

        let engine = SyncEngine::new(settings(src.path(), dst.path()), None).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine.run(&CycleState::default(), &cancel).await.unwrap();
        assert_eq!(outcome.report.status, CycleStatus::Cancelled);
        assert!(!dst.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let missing = src.path().join("missing");

        let engine = SyncEngine::new(settings(&missing, dst.path()), None).unwrap();
        let err = engine
            .run(&CycleState::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::FatalScan { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_interactive_without_decider_rejected() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let result = SyncEngine::new(
            settings(src.path(), dst.path()).with_strategy(ConflictStrategy::Interactive),
            None,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    /// 永远等不到回答的决策者
    struct Stalled;

    #[async_trait::async_trait]
    impl ConflictDecider for Stalled {
        async fn ask(&self, _conflict: &crate::core::conflict::Conflict) -> Option<Resolution> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Some(Resolution::KeepSource)
        }

        fn is_interactive(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_timeout_before_execution_leaves_target_untouched() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("c.txt"), b"source edit").unwrap();
        fs::write(dst.path().join("c.txt"), b"target edit").unwrap();
        fs::write(src.path().join("new.txt"), b"fresh").unwrap();

        let mut settings = settings(src.path(), dst.path())
            .with_mode(SyncMode::Merge)
            .with_strategy(ConflictStrategy::Interactive);
        settings.cycle_timeout_secs = Some(1);
        let engine = SyncEngine::new(settings, Some(Arc::new(Stalled))).unwrap();

        let outcome = engine
            .run(&CycleState::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.report.status, CycleStatus::TimedOut);
        assert_eq!(outcome.report.failures.len(), 1);
        assert_eq!(outcome.report.failures[0].error_kind, ErrorKind::Timeout);
        assert!(outcome.report.copied.is_empty());
        assert!(outcome.state.source.is_none());
        assert!(outcome.state.target.is_none());

        assert!(!dst.path().join("new.txt").exists());
        assert_eq!(fs::read(dst.path().join("c.txt")).unwrap(), b"target edit");
        assert_eq!(fs::read(src.path().join("c.txt")).unwrap(), b"source edit");
    }

    #[tokio::test]
    async fn test_timeout_not_reached_runs_normally() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();

        let mut settings = settings(src.path(), dst.path());
        settings.cycle_timeout_secs = Some(60);
        let engine = SyncEngine::new(settings, None).unwrap();

        let outcome = engine
            .run(&CycleState::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.report.status, CycleStatus::Completed);
        assert_eq!(fs::read(dst.path().join("a.txt")).unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_merge_cycle_copies_forward() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();

        let engine = SyncEngine::new(
            settings(src.path(), dst.path()).with_mode(SyncMode::Merge),
            None,
        )
        .unwrap();
        let outcome = engine
            .run(&CycleState::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.report.warnings.is_empty());
        assert_eq!(outcome.report.copied.len(), 1);
        assert_eq!(fs::read(dst.path().join("a.txt")).unwrap(), b"a");
    }
}
