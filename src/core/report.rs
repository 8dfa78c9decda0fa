//! 同步报告

use crate::core::comparator::CopyDirection;
use crate::core::conflict::Resolution;
use crate::core::snapshot::ScanWarning;
use crate::error::{ErrorKind, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// 周期结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// 没有任何需要执行的动作
    InSync,
    Completed,
    CompletedWithFailures,
    /// 在阶段边界响应了取消
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopiedEntry {
    pub path: String,
    pub direction: CopyDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolvedEntry {
    pub path: String,
    pub strategy: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub path: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

impl FailureEntry {
    pub fn from_error(path: impl Into<String>, err: &SyncError) -> Self {
        Self {
            path: path.into(),
            error_kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// 单个动作的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Copied(CopiedEntry),
    Deleted(String),
    ConflictResolved(ConflictResolvedEntry),
    Failed(FailureEntry),
}

/// 一个同步周期的报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionReport {
    pub cycle_id: Uuid,
    pub cycle_timestamp: DateTime<Utc>,
    pub dry_run: bool,
    pub status: CycleStatus,
    pub copied: Vec<CopiedEntry>,
    pub deleted: Vec<String>,
    pub conflicts_resolved: Vec<ConflictResolvedEntry>,
    pub failures: Vec<FailureEntry>,
    pub warnings: Vec<ScanWarning>,
    pub duration_ms: u64,
}

impl ActionReport {
    pub fn new(cycle_timestamp: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            cycle_timestamp,
            dry_run,
            status: CycleStatus::InSync,
            copied: Vec::new(),
            deleted: Vec::new(),
            conflicts_resolved: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    /// 标记为超时：在执行阶段开始前超时，没有执行任何动作
    pub fn mark_timed_out(&mut self, timeout: Duration, elapsed: Duration) {
        self.failures.push(FailureEntry {
            path: String::new(),
            error_kind: ErrorKind::Timeout,
            message: format!("同步周期超过 {} 秒未完成", timeout.as_secs()),
        });
        self.status = CycleStatus::TimedOut;
        self.duration_ms = elapsed.as_millis() as u64;
    }

    pub fn push(&mut self, outcome: ActionOutcome) {
        match outcome {
            ActionOutcome::Copied(entry) => self.copied.push(entry),
            ActionOutcome::Deleted(path) => self.deleted.push(path),
            ActionOutcome::ConflictResolved(entry) => self.conflicts_resolved.push(entry),
            ActionOutcome::Failed(entry) => self.failures.push(entry),
        }
    }

    /// 没有执行也没有失败任何动作
    pub fn is_in_sync(&self) -> bool {
        self.copied.is_empty()
            && self.deleted.is_empty()
            && self.conflicts_resolved.is_empty()
            && self.failures.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn total_actions(&self) -> usize {
        self.copied.len() + self.deleted.len() + self.conflicts_resolved.len() + self.failures.len()
    }

    /// 根据内容确定最终状态
    pub fn finish(&mut self, elapsed: Duration) {
        self.duration_ms = elapsed.as_millis() as u64;
        self.status = if self.has_failures() {
            CycleStatus::CompletedWithFailures
        } else if self.is_in_sync() {
            CycleStatus::InSync
        } else {
            CycleStatus::Completed
        };
    }

    /// 标记为已取消（在执行阶段开始前）
    pub fn cancel(&mut self, elapsed: Duration) {
        self.duration_ms = elapsed.as_millis() as u64;
        self.status = CycleStatus::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report_is_in_sync() {
        let mut report = ActionReport::new(Utc::now(), false);
        report.finish(Duration::from_millis(3));
        assert!(report.is_in_sync());
        assert_eq!(report.status, CycleStatus::InSync);
        assert_eq!(report.duration_ms, 3);
    }

    #[test]
    fn test_status_reflects_failures() {
        let mut report = ActionReport::new(Utc::now(), false);
        report.push(ActionOutcome::Copied(CopiedEntry {
            path: "a".into(),
            direction: CopyDirection::Forward,
        }));
        report.finish(Duration::ZERO);
        assert_eq!(report.status, CycleStatus::Completed);

        report.push(ActionOutcome::Failed(FailureEntry {
            path: "b".into(),
            error_kind: ErrorKind::NotFound,
            message: "gone".into(),
        }));
        report.finish(Duration::ZERO);
        assert_eq!(report.status, CycleStatus::CompletedWithFailures);
        assert_eq!(report.total_actions(), 2);
    }

    #[test]
    fn test_json_shape() {
        let mut report = ActionReport::new(Utc::now(), true);
        report.push(ActionOutcome::Copied(CopiedEntry {
            path: "a.txt".into(),
            direction: CopyDirection::Reverse,
        }));
        report.push(ActionOutcome::ConflictResolved(ConflictResolvedEntry {
            path: "c.txt".into(),
            strategy: Resolution::KeepBoth,
            renamed_to: Some("c.txt.conflict_20240101_000000".into()),
        }));
        report.push(ActionOutcome::Failed(FailureEntry {
            path: "d.txt".into(),
            error_kind: ErrorKind::ConflictPending,
            message: "pending".into(),
        }));

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["dryRun"], true);
        assert_eq!(value["copied"][0]["direction"], "reverse");
        assert_eq!(value["conflictsResolved"][0]["strategy"], "keep-both");
        assert_eq!(
            value["conflictsResolved"][0]["renamedTo"],
            "c.txt.conflict_20240101_000000"
        );
        assert_eq!(value["failures"][0]["errorKind"], "conflict_pending");
        assert!(value["cycleTimestamp"].is_string());
    }

    #[test]
    fn test_timed_out_report() {
        let mut report = ActionReport::new(Utc::now(), false);
        report.mark_timed_out(Duration::from_secs(5), Duration::from_millis(5_002));
        assert_eq!(report.status, CycleStatus::TimedOut);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error_kind, ErrorKind::Timeout);
        assert_eq!(report.duration_ms, 5_002);
        assert!(report.copied.is_empty() && report.deleted.is_empty());
    }
}
