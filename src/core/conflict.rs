use crate::core::comparator::{CopyDirection, SyncPlan};
use crate::core::snapshot::{DirectorySnapshot, FileRecord};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 冲突解决策略（一次运行内不混用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    KeepSource,
    KeepTarget,
    #[default]
    KeepBoth,
    /// 逐个询问外部决策者，仅允许单次运行
    Interactive,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::KeepSource => write!(f, "keep-source"),
            ConflictStrategy::KeepTarget => write!(f, "keep-target"),
            ConflictStrategy::KeepBoth => write!(f, "keep-both"),
            ConflictStrategy::Interactive => write!(f, "interactive"),
        }
    }
}

/// 对单个冲突的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    KeepSource,
    KeepTarget,
    KeepBoth,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::KeepSource => write!(f, "keep-source"),
            Resolution::KeepTarget => write!(f, "keep-target"),
            Resolution::KeepBoth => write!(f, "keep-both"),
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keep-source" | "keep_source" | "source" | "s" => Ok(Resolution::KeepSource),
            "keep-target" | "keep_target" | "target" | "t" => Ok(Resolution::KeepTarget),
            "keep-both" | "keep_both" | "both" | "b" => Ok(Resolution::KeepBoth),
            other => Err(format!("未知的冲突处理方式: {}", other)),
        }
    }
}

impl TryFrom<ConflictStrategy> for Resolution {
    type Error = SyncError;

    fn try_from(strategy: ConflictStrategy) -> Result<Self> {
        match strategy {
            ConflictStrategy::KeepSource => Ok(Resolution::KeepSource),
            ConflictStrategy::KeepTarget => Ok(Resolution::KeepTarget),
            ConflictStrategy::KeepBoth => Ok(Resolution::KeepBoth),
            ConflictStrategy::Interactive => Err(SyncError::Config(
                "interactive 策略需要外部决策者".to_string(),
            )),
        }
    }
}

/// 检测到的冲突
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    pub source: FileRecord,
    pub target: FileRecord,
}

/// 冲突决策端口
#[async_trait]
pub trait ConflictDecider: Send + Sync {
    /// 返回 None 表示没有得到答案，冲突保持未解决
    async fn ask(&self, conflict: &Conflict) -> Option<Resolution>;

    /// 是否会阻塞等待人工输入
    fn is_interactive(&self) -> bool {
        false
    }
}

/// 按固定策略决策
#[derive(Debug, Clone, Copy)]
pub struct PolicyDecider {
    resolution: Resolution,
}

impl PolicyDecider {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }
}

#[async_trait]
impl ConflictDecider for PolicyDecider {
    async fn ask(&self, _conflict: &Conflict) -> Option<Resolution> {
        Some(self.resolution)
    }
}

/// 冲突解决后要执行的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    Copy(CopyDirection),
    /// 先把目标侧文件重命名，再正向复制
    KeepBoth { renamed_to: String },
    /// 没有得到决定，两侧文件保持不变
    Pending,
}

/// 已解决的冲突
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConflict {
    pub path: String,
    pub resolution: Option<Resolution>,
    pub action: ResolvedAction,
}

/// 冲突解决器
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    decider: Arc<dyn ConflictDecider>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("strategy", &self.strategy)
            .field("interactive", &self.decider.is_interactive())
            .finish()
    }
}

impl ConflictResolver {
    /// 非交互策略使用固定决策；interactive 策略必须提供决策者
    pub fn new(
        strategy: ConflictStrategy,
        interactive: Option<Arc<dyn ConflictDecider>>,
    ) -> Result<Self> {
        let decider: Arc<dyn ConflictDecider> = match strategy {
            ConflictStrategy::Interactive => interactive.ok_or_else(|| {
                SyncError::Config("interactive 策略需要外部决策者".to_string())
            })?,
            fixed => Arc::new(PolicyDecider::new(Resolution::try_from(fixed)?)),
        };
        Ok(Self { strategy, decider })
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn is_interactive(&self) -> bool {
        self.strategy == ConflictStrategy::Interactive
    }

    /// 逐个解决计划中的冲突（每个冲突恰好一次）
    pub async fn resolve_all(
        &self,
        plan: &SyncPlan,
        source: &DirectorySnapshot,
        target: &DirectorySnapshot,
        cycle_timestamp: DateTime<Utc>,
    ) -> Vec<ResolvedConflict> {
        let mut resolved = Vec::with_capacity(plan.conflicts().len());
        let mut taken = BTreeSet::new();

        for path in plan.conflicts() {
            let (Some(src), Some(dst)) = (source.get(path), target.get(path)) else {
                // 计划只会把两侧都存在的路径标为冲突
                warn!("冲突路径不在快照中: {}", path);
                resolved.push(ResolvedConflict {
                    path: path.clone(),
                    resolution: None,
                    action: ResolvedAction::Pending,
                });
                continue;
            };

            let conflict = Conflict {
                path: path.clone(),
                source: src.clone(),
                target: dst.clone(),
            };
            let decision = self.decider.ask(&conflict).await;
            let action = match decision {
                Some(Resolution::KeepSource) => ResolvedAction::Copy(CopyDirection::Forward),
                Some(Resolution::KeepTarget) => ResolvedAction::Copy(CopyDirection::Reverse),
                Some(Resolution::KeepBoth) => {
                    let base = Self::conflict_name(path, cycle_timestamp);
                    let renamed_to = unused_name(base, |name| {
                        source.contains(name) || target.contains(name) || taken.contains(name)
                    });
                    taken.insert(renamed_to.clone());
                    ResolvedAction::KeepBoth { renamed_to }
                }
                None => {
                    warn!("冲突未得到决定，保持两侧不变: {}", path);
                    ResolvedAction::Pending
                }
            };
            debug!("冲突 {} -> {:?}", path, action);

            resolved.push(ResolvedConflict {
                path: path.clone(),
                resolution: decision,
                action,
            });
        }

        if !resolved.is_empty() {
            info!("已处理 {} 个冲突 (策略: {})", resolved.len(), self.strategy);
        }
        resolved
    }

    /// 生成冲突文件名: `<name>.conflict_<YYYYmmdd_HHMMSS>`
    pub fn conflict_name(path: &str, timestamp: DateTime<Utc>) -> String {
        format!("{}.conflict_{}", path, timestamp.format("%Y%m%d_%H%M%S"))
    }
}

/// 名称已被占用时依次追加 `_1`、`_2` ...
fn unused_name(base: String, occupied: impl Fn(&str) -> bool) -> String {
    if !occupied(&base) {
        return base;
    }
    (1u32..)
        .map(|n| format!("{}_{}", base, n))
        .find(|name| !occupied(name))
        .unwrap_or(base)
}
