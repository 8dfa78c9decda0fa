//! 动作执行器
//!
//! 按阶段执行同步计划：先删除，再创建目录，最后复制文件和处理冲突。
//! 每个阶段内部由信号量限制并发，结果统一交给一个收集任务按计划顺序整理。

use crate::config::SyncSettings;
use crate::core::comparator::{CopyDirection, SyncPlan};
use crate::core::conflict::{Resolution, ResolvedAction, ResolvedConflict};
use crate::core::report::{ActionOutcome, ConflictResolvedEntry, CopiedEntry, FailureEntry};
use crate::core::snapshot::{DirectorySnapshot, TEMP_SUFFIX};
use crate::error::{Result, SyncError};
use filetime::FileTime;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 每个阶段的最大并发数
    pub max_concurrency: usize,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），按 2 的指数增长
    pub retry_base_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 2,
            retry_base_delay_ms: 200,
        }
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.max(1),
            max_retries: settings.max_retries,
            retry_base_delay_ms: settings.retry_base_delay_ms,
        }
    }
}

/// 计划中的单个动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlannedAction {
    Delete {
        path: String,
    },
    CreateDir {
        path: String,
        direction: CopyDirection,
    },
    CopyFile {
        path: String,
        direction: CopyDirection,
    },
    Resolve {
        path: String,
        resolution: Resolution,
        action: ResolvedAction,
    },
    /// 冲突未得到决定
    Pending {
        path: String,
    },
}

impl PlannedAction {
    pub(crate) fn path(&self) -> &str {
        match self {
            PlannedAction::Delete { path }
            | PlannedAction::CreateDir { path, .. }
            | PlannedAction::CopyFile { path, .. }
            | PlannedAction::Resolve { path, .. }
            | PlannedAction::Pending { path } => path,
        }
    }

    /// 成功时写入报告的条目
    fn success_outcome(&self) -> ActionOutcome {
        match self {
            PlannedAction::Delete { path } => ActionOutcome::Deleted(path.clone()),
            PlannedAction::CreateDir { path, direction }
            | PlannedAction::CopyFile { path, direction } => ActionOutcome::Copied(CopiedEntry {
                path: path.clone(),
                direction: *direction,
            }),
            PlannedAction::Resolve {
                path,
                resolution,
                action,
            } => ActionOutcome::ConflictResolved(ConflictResolvedEntry {
                path: path.clone(),
                strategy: *resolution,
                renamed_to: match action {
                    ResolvedAction::KeepBoth { renamed_to } => Some(renamed_to.clone()),
                    _ => None,
                },
            }),
            PlannedAction::Pending { path } => {
                ActionOutcome::Failed(FailureEntry::from_error(
                    path.clone(),
                    &SyncError::ConflictPending { path: path.clone() },
                ))
            }
        }
    }
}

/// 把计划拆成三个有序阶段：删除、目录、文件与冲突
pub(crate) fn schedule(
    plan: &SyncPlan,
    conflicts: &[ResolvedConflict],
    source: &DirectorySnapshot,
    target: &DirectorySnapshot,
) -> [Vec<PlannedAction>; 3] {
    let deletes: Vec<PlannedAction> = plan
        .to_delete()
        .iter()
        .map(|path| PlannedAction::Delete { path: path.clone() })
        .collect();

    let mut dirs = Vec::new();
    let mut files: BTreeMap<String, PlannedAction> = BTreeMap::new();

    for (path, direction) in plan.to_copy() {
        let authoritative = match direction {
            CopyDirection::Forward => source,
            CopyDirection::Reverse => target,
        };
        let is_dir = authoritative
            .get(path)
            .map(|r| r.is_directory)
            .unwrap_or(false);
        if is_dir {
            dirs.push(PlannedAction::CreateDir {
                path: path.clone(),
                direction: *direction,
            });
        } else {
            files.insert(
                path.clone(),
                PlannedAction::CopyFile {
                    path: path.clone(),
                    direction: *direction,
                },
            );
        }
    }

    for resolved in conflicts {
        let action = match (resolved.resolution, &resolved.action) {
            (Some(resolution), action) if *action != ResolvedAction::Pending => {
                PlannedAction::Resolve {
                    path: resolved.path.clone(),
                    resolution,
                    action: action.clone(),
                }
            }
            _ => PlannedAction::Pending {
                path: resolved.path.clone(),
            },
        };
        files.insert(resolved.path.clone(), action);
    }

    [deletes, dirs, files.into_values().collect()]
}

/// 动作执行器
#[derive(Debug, Clone, Default)]
pub struct ActionExecutor {
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// 执行计划，返回按计划顺序排列的结果
    ///
    /// 预演模式不会修改文件系统，但返回的条目与实际执行一致。
    pub async fn apply(
        &self,
        plan: &SyncPlan,
        conflicts: &[ResolvedConflict],
        source: &DirectorySnapshot,
        target: &DirectorySnapshot,
        dry_run: bool,
    ) -> Vec<ActionOutcome> {
        let phases = schedule(plan, conflicts, source, target);
        let total: usize = phases.iter().map(Vec::len).sum();
        if total == 0 {
            debug!("没有需要执行的动作");
            return Vec::new();
        }

        info!(
            "开始执行 {} 个动作 (删除 {}, 目录 {}, 文件/冲突 {}){}",
            total,
            phases[0].len(),
            phases[1].len(),
            phases[2].len(),
            if dry_run { " [预演]" } else { "" }
        );

        let roots = Arc::new(Roots {
            source: source.root().to_path_buf(),
            target: target.root().to_path_buf(),
        });

        // 单一收集者，按计划序号排序
        let (tx, mut rx) = mpsc::channel::<(usize, ActionOutcome)>(64);
        let collector = tokio::spawn(async move {
            let mut entries = BTreeMap::new();
            while let Some((index, outcome)) = rx.recv().await {
                entries.insert(index, outcome);
            }
            entries.into_values().collect::<Vec<_>>()
        });

        let mut index = 0usize;
        for (phase_no, phase) in phases.into_iter().enumerate() {
            if phase.is_empty() {
                continue;
            }
            let len = phase.len();
            debug!("执行阶段 {} ({} 个动作)", phase_no + 1, len);
            self.run_phase(phase, index, &roots, dry_run, &tx).await;
            index += len;
        }
        drop(tx);

        match collector.await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!("结果收集任务异常: {}", e);
                Vec::new()
            }
        }
    }

    /// 在信号量限制下执行一个阶段，等待全部完成后返回
    async fn run_phase(
        &self,
        actions: Vec<PlannedAction>,
        base_index: usize,
        roots: &Arc<Roots>,
        dry_run: bool,
        tx: &mpsc::Sender<(usize, ActionOutcome)>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut handles = Vec::with_capacity(actions.len());

        for (offset, action) in actions.into_iter().enumerate() {
            let index = base_index + offset;
            let path = action.path().to_string();

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    let err = SyncError::Worker(e.to_string());
                    let _ = tx
                        .send((index, ActionOutcome::Failed(FailureEntry::from_error(path, &err))))
                        .await;
                    continue;
                }
            };

            let action = Arc::new(action);
            let roots = roots.clone();
            let tx_task = tx.clone();
            let max_retries = self.config.max_retries;
            let retry_delay = self.config.retry_base_delay_ms;

            let handle = tokio::spawn(async move {
                let result = if dry_run {
                    simulate(&action)
                } else {
                    execute_action_with_retry(action.clone(), roots, max_retries, retry_delay)
                        .await
                };

                let outcome = match result {
                    Ok(()) => {
                        debug!("完成: {:?}", action);
                        action.success_outcome()
                    }
                    Err(e) => {
                        warn!("动作失败 {}: {}", action.path(), e);
                        ActionOutcome::Failed(FailureEntry::from_error(action.path(), &e))
                    }
                };
                let _ = tx_task.send((index, outcome)).await;
                drop(permit);
            });

            handles.push((index, path, handle));
        }

        for (index, path, handle) in handles {
            if let Err(e) = handle.await {
                let err = SyncError::Worker(e.to_string());
                error!("工作任务异常退出 {}: {}", path, err);
                let _ = tx
                    .send((index, ActionOutcome::Failed(FailureEntry::from_error(path, &err))))
                    .await;
            }
        }
    }
}

struct Roots {
    source: PathBuf,
    target: PathBuf,
}

impl Roots {
    /// (读取侧, 写入侧)
    fn sides(&self, direction: CopyDirection) -> (&Path, &Path) {
        match direction {
            CopyDirection::Forward => (&self.source, &self.target),
            CopyDirection::Reverse => (&self.target, &self.source),
        }
    }
}

/// 预演：不触碰文件系统
fn simulate(action: &PlannedAction) -> Result<()> {
    match action {
        PlannedAction::Pending { path } => Err(SyncError::ConflictPending { path: path.clone() }),
        _ => Ok(()),
    }
}

/// 带重试的动作执行
async fn execute_action_with_retry(
    action: Arc<PlannedAction>,
    roots: Arc<Roots>,
    max_retries: u32,
    base_delay_ms: u64,
) -> Result<()> {
    let mut last_error = None;

    for attempt in 0..=max_retries {
        let task_action = action.clone();
        let task_roots = roots.clone();
        let result = tokio::task::spawn_blocking(move || execute_action(&task_action, &task_roots))
            .await
            .map_err(|e| SyncError::Worker(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(()) => return Ok(()),
            // 未决冲突不重试
            Err(e @ SyncError::ConflictPending { .. }) => return Err(e),
            Err(e)
                if matches!(&e, SyncError::ItemIo { source, .. }
                    if source.kind() == io::ErrorKind::AlreadyExists) =>
            {
                return Err(e);
            }
            Err(e) => {
                if attempt < max_retries {
                    // 指数退避
                    let delay = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
                    warn!(
                        "操作失败，{}ms 后重试 ({}/{}): {}",
                        delay,
                        attempt + 1,
                        max_retries,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                } else {
                    error!("操作最终失败 (已重试{}次): {}", max_retries, e);
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| SyncError::Worker(format!("{}: 未执行", action.path()))))
}

/// 执行单个动作（阻塞）
fn execute_action(action: &PlannedAction, roots: &Roots) -> Result<()> {
    fn item(path: &str) -> impl FnOnce(io::Error) -> SyncError {
        let path = path.to_string();
        move |e| SyncError::item_io(path, e)
    }

    match action {
        PlannedAction::Delete { path } => {
            debug!("删除: {}", path);
            remove_entry(&roots.target.join(path)).map_err(item(path))
        }
        PlannedAction::CreateDir { path, direction } => {
            let (_, to) = roots.sides(*direction);
            debug!("创建目录: {} ({})", path, direction);
            ensure_dir(&to.join(path)).map_err(item(path))
        }
        PlannedAction::CopyFile { path, direction } => {
            let (from, to) = roots.sides(*direction);
            let bytes = copy_file(&from.join(path), &to.join(path)).map_err(item(path))?;
            debug!("复制: {} ({}字节, {})", path, bytes, direction);
            Ok(())
        }
        PlannedAction::Resolve { path, action, .. } => match action {
            ResolvedAction::Copy(direction) => {
                let (from, to) = roots.sides(*direction);
                copy_entry(&from.join(path), &to.join(path)).map_err(item(path))
            }
            ResolvedAction::KeepBoth { renamed_to } => {
                let original = roots.target.join(path);
                let renamed = roots.target.join(renamed_to);
                // 只有原文件不在时才说明上次重试已完成重命名
                if renamed.symlink_metadata().is_ok() {
                    if original.symlink_metadata().is_ok() {
                        return Err(SyncError::item_io(
                            path.as_str(),
                            io::Error::new(
                                io::ErrorKind::AlreadyExists,
                                format!("冲突文件已存在: {}", renamed_to),
                            ),
                        ));
                    }
                } else {
                    debug!("重命名冲突文件: {} -> {}", path, renamed_to);
                    fs::rename(&original, &renamed).map_err(item(path))?;
                }
                copy_entry(&roots.source.join(path), &original).map_err(item(path))
            }
            ResolvedAction::Pending => Err(SyncError::ConflictPending { path: path.clone() }),
        },
        PlannedAction::Pending { path } => Err(SyncError::ConflictPending { path: path.clone() }),
    }
}

/// 删除文件或整个目录树，不存在视为成功
fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// 创建目录；目标位置是文件时先删除
fn ensure_dir(path: &Path) -> io::Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.is_dir() {
            return Ok(());
        }
        fs::remove_file(path)?;
    }
    fs::create_dir_all(path)
}

/// 按读取侧的实际类型复制目录或文件
fn copy_entry(from: &Path, to: &Path) -> io::Result<()> {
    if fs::metadata(from)?.is_dir() {
        ensure_dir(to)
    } else {
        copy_file(from, to).map(|_| ())
    }
}

/// 先写入同目录下的临时文件，复制权限和修改时间后再重命名到位
fn copy_file(from: &Path, to: &Path) -> io::Result<u64> {
    let meta = fs::metadata(from)?;

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    // 目标位置是目录（类型不一致）
    if fs::symlink_metadata(to).map(|m| m.is_dir()).unwrap_or(false) {
        fs::remove_dir_all(to)?;
    }

    let tmp = temp_path(to);
    let guard = scopeguard::guard(tmp.clone(), |p| {
        let _ = fs::remove_file(p);
    });

    let mut reader = File::open(from)?;
    let mut writer = File::create(&tmp)?;
    let bytes = io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    drop(writer);

    fs::set_permissions(&tmp, meta.permissions())?;
    filetime::set_file_mtime(&tmp, FileTime::from_last_modification_time(&meta))?;
    fs::rename(&tmp, to)?;

    scopeguard::ScopeGuard::into_inner(guard);
    Ok(bytes)
}

/// `dir/.name.dirsync-part`
fn temp_path(to: &Path) -> PathBuf {
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    to.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}
