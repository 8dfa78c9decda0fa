use crate::config::SyncMode;
use crate::core::snapshot::{DirectorySnapshot, FileRecord};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// 复制方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyDirection {
    /// 源 -> 目标
    Forward,
    /// 目标 -> 源（仅合并模式）
    Reverse,
}

impl std::fmt::Display for CopyDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyDirection::Forward => write!(f, "forward"),
            CopyDirection::Reverse => write!(f, "reverse"),
        }
    }
}

/// 同步计划，由两个快照比较得出，生成后不再修改
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    to_copy: BTreeMap<String, CopyDirection>,
    to_delete: BTreeSet<String>,
    conflicts: BTreeSet<String>,
}

impl SyncPlan {
    pub fn to_copy(&self) -> &BTreeMap<String, CopyDirection> {
        &self.to_copy
    }

    pub fn to_delete(&self) -> &BTreeSet<String> {
        &self.to_delete
    }

    pub fn conflicts(&self) -> &BTreeSet<String> {
        &self.conflicts
    }

    pub fn is_empty(&self) -> bool {
        self.to_copy.is_empty() && self.to_delete.is_empty() && self.conflicts.is_empty()
    }

    /// 统计计划
    pub fn summarize(&self, source: &DirectorySnapshot, target: &DirectorySnapshot) -> PlanSummary {
        let mut summary = PlanSummary::default();

        for (path, direction) in &self.to_copy {
            match direction {
                CopyDirection::Forward => {
                    summary.forward_copy_count += 1;
                    summary.forward_copy_bytes += source.get(path).map_or(0, |r| r.size);
                }
                CopyDirection::Reverse => {
                    summary.reverse_copy_count += 1;
                    summary.reverse_copy_bytes += target.get(path).map_or(0, |r| r.size);
                }
            }
        }
        summary.delete_count = self.to_delete.len();
        summary.conflict_count = self.conflicts.len();

        summary
    }
}

/// 计划统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub forward_copy_count: usize,
    pub forward_copy_bytes: u64,
    pub reverse_copy_count: usize,
    pub reverse_copy_bytes: u64,
    pub delete_count: usize,
    pub conflict_count: usize,
}

impl PlanSummary {
    pub fn total_actions(&self) -> usize {
        self.forward_copy_count + self.reverse_copy_count + self.delete_count + self.conflict_count
    }

    pub fn total_transfer_bytes(&self) -> u64 {
        self.forward_copy_bytes + self.reverse_copy_bytes
    }
}

/// 两个修改过的文件之间的先后关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    /// 源文件更新（超出容差）
    SourceNewer,
    /// 目标文件更新（超出容差）
    TargetNewer,
    /// 时间差在容差内，无法判断哪一侧可信
    Concurrent,
}

/// 比较配置
#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// 时间容差，用于吸收文件系统时间戳精度差异
    pub time_tolerance: TimeDelta,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            time_tolerance: TimeDelta::seconds(1),
        }
    }
}

/// 文件比较器
#[derive(Debug, Clone, Default)]
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn new(time_tolerance: TimeDelta) -> Self {
        Self {
            config: CompareConfig { time_tolerance },
        }
    }

    pub fn with_config(config: CompareConfig) -> Self {
        Self { config }
    }

    /// 两个文件内容是否相同
    ///
    /// 有摘要时只看摘要；任一侧缺少摘要（超过大小上限）时退化为大小和时间比较。
    pub fn same_content(&self, source: &FileRecord, target: &FileRecord) -> bool {
        if let (Some(src_sum), Some(dst_sum)) = (&source.content_digest, &target.content_digest) {
            return src_sum == dst_sum;
        }
        source.size == target.size
            && self.relation(source, target) == FileRelation::Concurrent
    }

    /// 按修改时间排序
    pub fn relation(&self, source: &FileRecord, target: &FileRecord) -> FileRelation {
        let delta = source.modified_at - target.modified_at;
        let epsilon = self.config.time_tolerance;

        if delta > epsilon {
            FileRelation::SourceNewer
        } else if delta < -epsilon {
            FileRelation::TargetNewer
        } else {
            FileRelation::Concurrent
        }
    }

    /// 比较两个快照，生成同步计划
    pub fn diff(
        &self,
        source: &DirectorySnapshot,
        target: &DirectorySnapshot,
        mode: SyncMode,
    ) -> SyncPlan {
        let mut plan = SyncPlan::default();

        let all_paths: BTreeSet<&String> = source.paths().chain(target.paths()).collect();

        for path in all_paths {
            match (source.get(path), target.get(path)) {
                (Some(_), None) => {
                    plan.to_copy.insert(path.clone(), CopyDirection::Forward);
                }

                // 合并模式从不单方面删除
                (None, Some(_)) => {
                    if mode != SyncMode::Mirror {
                        continue;
                    }
                    // 源端读取失败或被跳过的路径不能当作已删除
                    if source.is_unreadable(path) {
                        debug!("源端扫描告警，保留目标: {}", path);
                        continue;
                    }
                    plan.to_delete.insert(path.clone());
                }

                (Some(src), Some(dst)) => match (src.is_directory, dst.is_directory) {
                    (true, true) => {}
                    (false, false) => {
                        if self.same_content(src, dst) {
                            continue;
                        }
                        match mode {
                            SyncMode::Mirror => {
                                plan.to_copy.insert(path.clone(), CopyDirection::Forward);
                            }
                            SyncMode::Merge => match self.relation(src, dst) {
                                FileRelation::SourceNewer => {
                                    plan.to_copy.insert(path.clone(), CopyDirection::Forward);
                                }
                                FileRelation::TargetNewer => {
                                    plan.to_copy.insert(path.clone(), CopyDirection::Reverse);
                                }
                                FileRelation::Concurrent => {
                                    debug!("检测到冲突: {}", path);
                                    plan.conflicts.insert(path.clone());
                                }
                            },
                        }
                    }
                    // 一侧是文件一侧是目录
                    _ => match mode {
                        SyncMode::Mirror => {
                            plan.to_delete.insert(path.clone());
                            plan.to_copy.insert(path.clone(), CopyDirection::Forward);
                        }
                        SyncMode::Merge => {
                            debug!("类型不一致，视为冲突: {}", path);
                            plan.conflicts.insert(path.clone());
                        }
                    },
                },

                (None, None) => unreachable!(),
            }
        }

        plan.to_delete = collapse_nested(plan.to_delete);
        plan
    }
}

/// 去掉祖先目录已在删除列表中的路径
fn collapse_nested(paths: BTreeSet<String>) -> BTreeSet<String> {
    paths
        .iter()
        .filter(|path| !ancestors(path).any(|a| paths.contains(a)))
        .cloned()
        .collect()
}

fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let idx = current.rfind('/')?;
        current = &current[..idx];
        Some(current)
    })
}

/// 使用默认容差（1 秒）比较
pub fn diff(source: &DirectorySnapshot, target: &DirectorySnapshot, mode: SyncMode) -> SyncPlan {
    FileComparator::default().diff(source, target, mode)
}
