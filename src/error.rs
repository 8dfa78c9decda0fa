//! 错误类型

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SyncError>;

/// 同步错误
///
/// 只有 `FatalScan` 和 `Config` 会终止一次运行，其余错误都会降级为报告中的单项失败。
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// 根目录不存在或无法读取
    #[error("无法扫描根目录 {root}: {source}")]
    FatalScan {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 配置无效（在任何周期开始前拒绝）
    #[error("配置错误: {0}")]
    Config(String),

    /// 单个文件读写失败
    #[error("{path}: {source}")]
    ItemIo {
        path: String,
        #[source]
        source: io::Error,
    },

    /// 冲突未得到决定，两侧文件保持不变
    #[error("冲突未解决: {path}")]
    ConflictPending { path: String },

    /// 同一对目录已有周期在运行
    #[error("同步周期正在运行")]
    AlreadyRunning,

    /// 工作任务异常退出
    #[error("工作任务失败: {0}")]
    Worker(String),
}

impl SyncError {
    pub fn item_io(path: impl Into<String>, source: io::Error) -> Self {
        SyncError::ItemIo {
            path: path.into(),
            source,
        }
    }

    /// 是否需要终止整个运行
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::FatalScan { .. } | SyncError::Config(_))
    }

    /// 映射到报告中的错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::ItemIo { source, .. } | SyncError::FatalScan { source, .. } => {
                ErrorKind::from(source.kind())
            }
            SyncError::ConflictPending { .. } => ErrorKind::ConflictPending,
            SyncError::Worker(_) => ErrorKind::Worker,
            SyncError::Config(_) | SyncError::AlreadyRunning => ErrorKind::Io,
        }
    }
}

/// 报告中的失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    NotFound,
    PermissionDenied,
    ConflictPending,
    Timeout,
    Worker,
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Io => write!(f, "io"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::PermissionDenied => write!(f, "permission_denied"),
            ErrorKind::ConflictPending => write!(f, "conflict_pending"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Worker => write!(f, "worker"),
        }
    }
}
