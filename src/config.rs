//! 应用配置模块

use crate::core::conflict::ConflictStrategy;
use crate::error::{Result, SyncError};
use crate::logging::LogConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// 同步模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 镜像：目标与源保持一致，包括删除
    Mirror,
    /// 合并：双向同步，从不单方面删除
    Merge,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Mirror => write!(f, "mirror"),
            SyncMode::Merge => write!(f, "merge"),
        }
    }
}

/// 单个同步任务的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    #[serde(default = "default_mode")]
    pub mode: SyncMode,
    /// 仅包含匹配的文件名（glob）
    #[serde(default)]
    pub include_pattern: Option<String>,
    /// 排除匹配的文件名（glob）
    #[serde(default)]
    pub exclude_pattern: Option<String>,
    /// 超过此大小的文件不计算摘要（0 表示不限制）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub dry_run: bool,
    /// 扫描时并发计算摘要的数量
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    /// 最大并发执行数
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 修改时间容差（毫秒）
    #[serde(default = "default_time_tolerance_ms")]
    pub time_tolerance_ms: i64,
    /// 单个周期的超时时间（秒）
    #[serde(default)]
    pub cycle_timeout_secs: Option<u64>,
}

fn default_mode() -> SyncMode {
    SyncMode::Mirror
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_scan_concurrency() -> usize {
    8
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_time_tolerance_ms() -> i64 {
    1000
}

impl SyncSettings {
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
            mode: default_mode(),
            include_pattern: None,
            exclude_pattern: None,
            max_file_size: default_max_file_size(),
            conflict_strategy: ConflictStrategy::default(),
            dry_run: false,
            scan_concurrency: default_scan_concurrency(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            time_tolerance_ms: default_time_tolerance_ms(),
            cycle_timeout_secs: None,
        }
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn time_tolerance(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::milliseconds(self.time_tolerance_ms)
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        self.cycle_timeout_secs.map(Duration::from_secs)
    }

    /// 校验配置，`continuous` 表示是否用于定时/持续运行
    pub fn validate(&self, continuous: bool) -> Result<()> {
        if self.source_root.as_os_str().is_empty() || self.target_root.as_os_str().is_empty() {
            return Err(SyncError::Config("源目录和目标目录不能为空".to_string()));
        }
        let source = resolve_root(&self.source_root);
        let target = resolve_root(&self.target_root);
        if source == target {
            return Err(SyncError::Config(format!(
                "源目录与目标目录相同: {}",
                source.display()
            )));
        }
        // 互相嵌套时一侧的写入会出现在另一侧的扫描中
        if source.starts_with(&target) || target.starts_with(&source) {
            return Err(SyncError::Config(format!(
                "源目录与目标目录不能互相包含: {} / {}",
                source.display(),
                target.display()
            )));
        }
        if self.time_tolerance_ms < 0 {
            return Err(SyncError::Config(format!(
                "时间容差不能为负数: {}",
                self.time_tolerance_ms
            )));
        }
        if self.scan_concurrency == 0 || self.max_concurrency == 0 {
            return Err(SyncError::Config("并发数必须大于 0".to_string()));
        }
        if self.cycle_timeout_secs == Some(0) {
            return Err(SyncError::Config("周期超时必须大于 0".to_string()));
        }
        // 无人值守的循环不能阻塞等待输入
        if continuous && self.conflict_strategy == ConflictStrategy::Interactive {
            return Err(SyncError::Config(
                "持续同步模式不能使用 interactive 冲突策略".to_string(),
            ));
        }
        Ok(())
    }

    /// 命令行启动前准备目录：源目录必须存在，目标目录不存在时创建
    pub fn prepare_roots(&self) -> anyhow::Result<()> {
        if !self.source_root.is_dir() {
            anyhow::bail!("源目录不存在或不是目录: {}", self.source_root.display());
        }
        if !self.target_root.exists() {
            fs::create_dir_all(&self.target_root)
                .with_context(|| format!("创建目标目录失败: {}", self.target_root.display()))?;
            tracing::info!("已创建目标目录: {}", self.target_root.display());
        }
        Ok(())
    }
}

/// 转为绝对路径，并解析最近一个已存在祖先中的符号链接
fn resolve_root(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    // 先按字面处理 . 和 ..
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }

    let mut existing = normalized.as_path();
    let mut missing = Vec::new();
    let mut resolved = loop {
        if let Ok(real) = existing.canonicalize() {
            break real;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => break existing.to_path_buf(),
        }
    };
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    resolved
}

/// 配置文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub sync: SyncSettings,
    #[serde(default)]
    pub log: LogConfig,
    /// 是否持续同步
    #[serde(default)]
    pub continuous: bool,
    /// 持续同步的间隔（秒）
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

impl AppConfig {
    /// 从配置文件加载
    pub fn load(config_file: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("读取配置文件失败: {}", config_file.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", config_file.display()))?;
        config.sync.validate(config.continuous)?;
        Ok(config)
    }

    /// 保存配置
    pub fn save(&self, config_file: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(config_file, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// 获取默认配置目录
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("dirsync"))
        .unwrap_or_else(|| PathBuf::from(".dirsync"))
}

/// 默认配置文件路径
pub fn default_config_file() -> PathBuf {
    config_dir().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = r#"{ "sync": { "sourceRoot": "/a", "targetRoot": "/b" } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.sync.mode, SyncMode::Mirror);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::KeepBoth);
        assert_eq!(config.sync.time_tolerance_ms, 1000);
        assert_eq!(config.sync.max_concurrency, 4);
        assert!(!config.continuous);
        assert_eq!(config.interval_secs, 30);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_parse_strategy_and_mode() {
        let json = r#"{
            "sourceRoot": "/a",
            "targetRoot": "/b",
            "mode": "merge",
            "conflictStrategy": "keep-target",
            "includePattern": "*.txt",
            "dryRun": true
        }"#;
        let settings: SyncSettings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.mode, SyncMode::Merge);
        assert_eq!(settings.conflict_strategy, ConflictStrategy::KeepTarget);
        assert_eq!(settings.include_pattern.as_deref(), Some("*.txt"));
        assert!(settings.dry_run);
    }

    #[test]
    fn test_interactive_rejected_for_continuous() {
        let settings =
            SyncSettings::new("/a", "/b").with_strategy(ConflictStrategy::Interactive);

        assert!(settings.validate(false).is_ok());
        assert!(matches!(settings.validate(true), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_same_root_rejected() {
        let settings = SyncSettings::new("/a", "/a");
        assert!(matches!(settings.validate(false), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_nested_roots_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data");
        fs::create_dir_all(&source).unwrap();

        let inside = SyncSettings::new(&source, source.join("backup"));
        assert!(matches!(inside.validate(false), Err(SyncError::Config(_))));

        let outside = SyncSettings::new(source.join("sub"), &source);
        assert!(matches!(outside.validate(false), Err(SyncError::Config(_))));

        let dotted = SyncSettings::new(&source, source.join("x").join(".."));
        assert!(matches!(dotted.validate(false), Err(SyncError::Config(_))));

        // 名称前缀相同但不是子目录
        let sibling = SyncSettings::new(&source, dir.path().join("data-backup"));
        assert!(sibling.validate(false).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_target_into_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data");
        fs::create_dir_all(source.join("inner")).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(source.join("inner"), &link).unwrap();

        let settings = SyncSettings::new(&source, &link);
        assert!(matches!(settings.validate(false), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_prepare_roots_creates_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        let target = dir.path().join("out").join("backup");

        SyncSettings::new(&source, &target).prepare_roots().unwrap();
        assert!(target.is_dir());

        let missing = SyncSettings::new(dir.path().join("nope"), &target);
        assert!(missing.prepare_roots().is_err());
    }

    #[test]
    fn test_load_and_save_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        let mut config = AppConfig {
            sync: SyncSettings::new("/src", "/dst").with_mode(SyncMode::Merge),
            log: LogConfig::default(),
            continuous: true,
            interval_secs: 5,
        };
        config.sync.cycle_timeout_secs = Some(60);
        config.save(&file).unwrap();

        let loaded = AppConfig::load(&file).unwrap();
        assert_eq!(loaded.sync.mode, SyncMode::Merge);
        assert_eq!(loaded.interval(), Duration::from_secs(5));
        assert_eq!(loaded.sync.cycle_timeout(), Some(Duration::from_secs(60)));
    }
}
