//! 目录快照：某一时刻目录树的不可变清单

use crate::core::hash::hash_file;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 执行器写入中的临时文件后缀，扫描时忽略
pub const TEMP_SUFFIX: &str = ".dirsync-part";

/// 单个条目的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// 相对于根目录的路径，使用 / 分隔
    pub relative_path: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// 目录和超过大小上限的文件没有摘要
    pub content_digest: Option<String>,
    pub is_directory: bool,
}

impl FileRecord {
    pub fn file(
        relative_path: impl Into<String>,
        size: u64,
        modified_at: DateTime<Utc>,
        content_digest: Option<String>,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            size,
            modified_at,
            content_digest,
            is_directory: false,
        }
    }

    pub fn directory(relative_path: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            relative_path: relative_path.into(),
            size: 0,
            modified_at,
            content_digest: None,
            is_directory: true,
        }
    }
}

/// 扫描过程中可恢复的问题（条目被忽略，扫描继续）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanWarning {
    pub path: String,
    pub message: String,
}

/// 目录快照，构建后不再修改
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    root: PathBuf,
    records: BTreeMap<String, FileRecord>,
    warnings: Vec<ScanWarning>,
}

impl DirectorySnapshot {
    pub fn from_records(
        root: impl Into<PathBuf>,
        records: impl IntoIterator<Item = FileRecord>,
    ) -> Self {
        Self {
            root: root.into(),
            records: records
                .into_iter()
                .map(|r| (r.relative_path.clone(), r))
                .collect(),
            warnings: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    pub fn records(&self) -> &BTreeMap<String, FileRecord> {
        &self.records
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    pub fn with_warnings(mut self, warnings: Vec<ScanWarning>) -> Self {
        self.warnings = warnings;
        self
    }

    /// 路径本身或其祖先目录在扫描时出错，内容未知
    pub fn is_unreadable(&self, path: &str) -> bool {
        self.warnings.iter().any(|w| {
            path == w.path
                || (path.len() > w.path.len()
                    && path.starts_with(w.path.as_str())
                    && path.as_bytes()[w.path.len()] == b'/')
        })
    }

    /// 去掉指定路径后得到新快照（用于下一周期的摘要复用）
    pub fn without<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut records = self.records.clone();
        for path in paths {
            records.remove(path);
        }
        Self {
            root: self.root.clone(),
            records,
            warnings: Vec::new(),
        }
    }
}

/// 文件名匹配模式（glob: `*`、`?`、`[...]`）
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    regex: Regex,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| SyncError::Config(format!("无效的匹配模式 {:?}: {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// 把 glob 转换为锚定的正则表达式
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    class.push('^');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if c == '\\' || c == '[' {
                        class.push('\\');
                    }
                    class.push(c);
                }
                if closed {
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                } else {
                    // 未闭合的 [ 按字面量处理
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(class.trim_start_matches('^')));
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// 扫描配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub include: Option<NamePattern>,
    pub exclude: Option<NamePattern>,
    /// 超过此大小不计算摘要（0 表示不限制）
    pub max_file_size: u64,
    /// 并发计算摘要的数量
    pub concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include: None,
            exclude: None,
            max_file_size: 0,
            concurrency: 8,
        }
    }
}

impl ScanConfig {
    pub fn from_settings(settings: &crate::config::SyncSettings) -> Result<Self> {
        Ok(Self {
            include: settings
                .include_pattern
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(NamePattern::new)
                .transpose()?,
            exclude: settings
                .exclude_pattern
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(NamePattern::new)
                .transpose()?,
            max_file_size: settings.max_file_size,
            concurrency: settings.scan_concurrency.max(1),
        })
    }

    /// 文件名是否被过滤掉：先排除，再检查包含
    fn filters_out(&self, name: &str) -> bool {
        if name.ends_with(TEMP_SUFFIX) {
            return true;
        }
        if self.exclude.as_ref().is_some_and(|p| p.matches(name)) {
            return true;
        }
        if self.include.as_ref().is_some_and(|p| !p.matches(name)) {
            return true;
        }
        false
    }

    fn wants_digest(&self, size: u64) -> bool {
        self.max_file_size == 0 || size <= self.max_file_size
    }
}

/// 等待计算摘要的文件
struct PendingFile {
    absolute: PathBuf,
    record: FileRecord,
}

/// 遍历结果
#[derive(Default)]
struct WalkOutput {
    records: Vec<FileRecord>,
    pending: Vec<PendingFile>,
    warnings: Vec<ScanWarning>,
}

/// 快照构建器
pub struct SnapshotBuilder {
    config: ScanConfig,
    previous: Option<Arc<DirectorySnapshot>>,
}

impl SnapshotBuilder {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    /// 提供上一周期同一根目录的快照，大小与修改时间未变的文件复用其摘要
    pub fn with_previous(mut self, previous: Option<Arc<DirectorySnapshot>>) -> Self {
        self.previous = previous;
        self
    }

    /// 扫描根目录并构建快照
    pub async fn build(&self, root: &Path) -> Result<DirectorySnapshot> {
        let fatal = |source| SyncError::FatalScan {
            root: root.to_path_buf(),
            source,
        };

        let meta = tokio::fs::metadata(root).await.map_err(fatal)?;
        if !meta.is_dir() {
            return Err(fatal(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "不是目录",
            )));
        }
        // 能打开才算可读
        let _entries = tokio::fs::read_dir(root).await.map_err(fatal)?;

        info!("开始扫描: {}", root.display());

        let walk_root = root.to_path_buf();
        let config = self.config.clone();
        let walked = tokio::task::spawn_blocking(move || walk(&walk_root, &config))
            .await
            .map_err(|e| SyncError::Worker(e.to_string()))?;

        let WalkOutput {
            records,
            pending,
            mut warnings,
        } = walked;

        let mut tree: BTreeMap<String, FileRecord> = records
            .into_iter()
            .map(|r| (r.relative_path.clone(), r))
            .collect();

        let mut reused = 0usize;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::new();

        for PendingFile { absolute, mut record } in pending {
            if let Some(digest) = self.reusable_digest(&record) {
                record.content_digest = Some(digest);
                reused += 1;
                tree.insert(record.relative_path.clone(), record);
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SyncError::Worker(e.to_string()))?;
            let rel = record.relative_path.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let result = hash_file(&absolute);
                drop(permit);
                result.map(|digest| {
                    record.content_digest = Some(digest);
                    record
                })
            });
            handles.push((rel, handle));
        }

        for (rel, handle) in handles {
            match handle.await {
                Ok(Ok(record)) => {
                    tree.insert(record.relative_path.clone(), record);
                }
                Ok(Err(e)) => {
                    // 文件在扫描期间消失或无法读取
                    warn!("计算摘要失败，忽略该文件: {} - {}", rel, e);
                    warnings.push(ScanWarning {
                        path: rel,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!("摘要任务失败: {} - {}", rel, e);
                    warnings.push(ScanWarning {
                        path: rel,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "扫描完成: {} 个条目, {} 个摘要复用, {} 个警告",
            tree.len(),
            reused,
            warnings.len()
        );

        Ok(DirectorySnapshot {
            root: root.to_path_buf(),
            records: tree,
            warnings,
        })
    }

    fn reusable_digest(&self, record: &FileRecord) -> Option<String> {
        let previous = self.previous.as_ref()?.get(&record.relative_path)?;
        if previous.is_directory
            || previous.size != record.size
            || previous.modified_at != record.modified_at
        {
            return None;
        }
        previous.content_digest.clone()
    }
}

/// 同步遍历目录树（在阻塞线程中运行）
fn walk(root: &Path, config: &ScanConfig) -> WalkOutput {
    let mut out = WalkOutput::default();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e
                    .path()
                    .and_then(|p| relative_path(root, p))
                    .unwrap_or_default();
                warn!("扫描条目失败: {} - {}", path, e);
                out.warnings.push(ScanWarning {
                    path,
                    message: e.to_string(),
                });
                continue;
            }
        };

        let Some(rel) = relative_path(root, entry.path()) else {
            out.warnings.push(ScanWarning {
                path: entry.path().to_string_lossy().into_owned(),
                message: "路径不是有效的 UTF-8".to_string(),
            });
            continue;
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            debug!("跳过符号链接: {}", rel);
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                out.warnings.push(ScanWarning {
                    path: rel,
                    message: e.to_string(),
                });
                continue;
            }
        };
        let modified_at: DateTime<Utc> = match metadata.modified() {
            Ok(t) => t.into(),
            Err(e) => {
                out.warnings.push(ScanWarning {
                    path: rel,
                    message: e.to_string(),
                });
                continue;
            }
        };

        if file_type.is_dir() {
            out.records.push(FileRecord::directory(rel, modified_at));
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if config.filters_out(&name) {
            debug!("过滤文件: {}", rel);
            continue;
        }
        // FIFO、套接字、设备文件：打开可能阻塞
        if !file_type.is_file() {
            debug!("跳过特殊文件: {}", rel);
            out.warnings.push(ScanWarning {
                path: rel,
                message: "不是普通文件，已跳过".to_string(),
            });
            continue;
        }

        let size = metadata.len();
        let record = FileRecord::file(rel, size, modified_at, None);
        if config.wants_digest(size) {
            out.pending.push(PendingFile {
                absolute: entry.path().to_path_buf(),
                record,
            });
        } else {
            debug!("文件超过大小上限，不计算摘要: {} ({})", record.relative_path, size);
            out.records.push(record);
        }
    }

    out
}

/// 计算 POSIX 风格的相对路径
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new(ScanConfig::default())
    }

    #[test]
    fn test_glob_patterns() {
        let p = NamePattern::new("*.txt").unwrap();
        assert!(p.matches("a.txt"));
        assert!(!p.matches("a.txt.bak"));
        assert!(!p.matches("a.md"));

        let p = NamePattern::new("?.rs").unwrap();
        assert!(p.matches("a.rs"));
        assert!(!p.matches("ab.rs"));

        let p = NamePattern::new("[ab].log").unwrap();
        assert!(p.matches("a.log"));
        assert!(!p.matches("c.log"));

        let p = NamePattern::new("[!ab].log").unwrap();
        assert!(p.matches("c.log"));
        assert!(!p.matches("a.log"));

        let p = NamePattern::new("data(1)+.csv").unwrap();
        assert!(p.matches("data(1)+.csv"));
    }

    #[tokio::test]
    async fn test_build_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("sub/deeper/b.txt"), b"beta").unwrap();

        let snapshot = builder().build(dir.path()).await.unwrap();

        let paths: Vec<_> = snapshot.paths().cloned().collect();
        assert_eq!(paths, vec!["a.txt", "sub", "sub/deeper", "sub/deeper/b.txt"]);

        let sub = snapshot.get("sub").unwrap();
        assert!(sub.is_directory);
        assert!(sub.content_digest.is_none());

        let b = snapshot.get("sub/deeper/b.txt").unwrap();
        assert_eq!(b.size, 4);
        assert_eq!(
            b.content_digest.as_deref(),
            Some(crate::core::hash::calculate_hash(b"beta").as_str())
        );
    }

    #[tokio::test]
    async fn test_exclude_then_include_on_basenames() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("keep.txt"), b"1").unwrap();
        fs::write(dir.path().join("skip.md"), b"2").unwrap();
        fs::write(dir.path().join("secret.txt"), b"3").unwrap();
        fs::write(dir.path().join("notes/inner.txt"), b"4").unwrap();

        let config = ScanConfig {
            include: Some(NamePattern::new("*.txt").unwrap()),
            exclude: Some(NamePattern::new("secret*").unwrap()),
            ..Default::default()
        };
        let snapshot = SnapshotBuilder::new(config).build(dir.path()).await.unwrap();

        assert!(snapshot.contains("keep.txt"));
        assert!(snapshot.contains("notes"));
        assert!(snapshot.contains("notes/inner.txt"));
        assert!(!snapshot.contains("skip.md"));
        assert!(!snapshot.contains("secret.txt"));
    }

    #[tokio::test]
    async fn test_size_ceiling_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.bin"), vec![7u8; 2048]).unwrap();
        fs::write(dir.path().join("small.bin"), vec![7u8; 16]).unwrap();

        let config = ScanConfig {
            max_file_size: 1024,
            ..Default::default()
        };
        let snapshot = SnapshotBuilder::new(config).build(dir.path()).await.unwrap();

        let big = snapshot.get("big.bin").unwrap();
        assert_eq!(big.size, 2048);
        assert!(big.content_digest.is_none());
        assert!(snapshot.get("small.bin").unwrap().content_digest.is_some());
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = builder().build(&dir.path().join("nope")).await;
        assert!(matches!(result, Err(SyncError::FatalScan { .. })));
    }

    #[tokio::test]
    async fn test_repeated_builds_are_equal() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            fs::write(dir.path().join(format!("f{i}.txt")), format!("{i}")).unwrap();
        }

        let a = builder().build(dir.path()).await.unwrap();
        let b = builder().build(dir.path()).await.unwrap();
        assert_eq!(a.records(), b.records());
    }

    #[tokio::test]
    async fn test_temp_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(format!(".a.txt{TEMP_SUFFIX}")), b"partial").unwrap();
        fs::write(dir.path().join("a.txt"), b"done").unwrap();

        let snapshot = builder().build(dir.path()).await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fifo_skipped_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        let status = std::process::Command::new("mkfifo")
            .arg(dir.path().join("pipe"))
            .status()
            .unwrap();
        assert!(status.success());

        let snapshot = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            builder().build(dir.path()),
        )
        .await
        .expect("scan must not block on a fifo")
        .unwrap();

        assert!(snapshot.contains("a.txt"));
        assert!(!snapshot.contains("pipe"));
        assert_eq!(snapshot.warnings().len(), 1);
        assert_eq!(snapshot.warnings()[0].path, "pipe");
        assert!(snapshot.is_unreadable("pipe"));
    }

    #[test]
    fn test_unreadable_covers_subtree_only() {
        let snapshot = DirectorySnapshot::from_records("/s", Vec::new()).with_warnings(vec![
            ScanWarning {
                path: "locked".into(),
                message: "permission denied".into(),
            },
        ]);
        assert!(snapshot.is_unreadable("locked"));
        assert!(snapshot.is_unreadable("locked/inner.txt"));
        assert!(!snapshot.is_unreadable("locked2"));
        assert!(!snapshot.is_unreadable("other.txt"));
    }

    #[tokio::test]
    async fn test_digest_reused_from_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"content").unwrap();

        let first = builder().build(dir.path()).await.unwrap();
        let mut record = first.get("a.txt").unwrap().clone();
        record.content_digest = Some("cached".to_string());
        let previous = Arc::new(DirectorySnapshot::from_records(dir.path(), vec![record]));

        let second = builder()
            .with_previous(Some(previous.clone()))
            .build(dir.path())
            .await
            .unwrap();
        assert_eq!(
            second.get("a.txt").unwrap().content_digest.as_deref(),
            Some("cached")
        );

        // 被执行器写过的路径不再复用
        let invalidated = Arc::new(previous.without(["a.txt"]));
        let third = builder()
            .with_previous(Some(invalidated))
            .build(dir.path())
            .await
            .unwrap();
        assert_eq!(third.get("a.txt"), first.get("a.txt"));
    }
}
