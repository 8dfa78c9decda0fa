use anyhow::Context;
use async_trait::async_trait;
use dirsync::config::{default_config_file, AppConfig};
use dirsync::core::Conflict;
use dirsync::logging::{get_log_dir, init_logging};
use dirsync::{ActionReport, ConflictDecider, ConflictStrategy, Resolution};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 从标准输入读取冲突决定
struct StdinDecider;

#[async_trait]
impl ConflictDecider for StdinDecider {
    async fn ask(&self, conflict: &Conflict) -> Option<Resolution> {
        let prompt = format!(
            "冲突: {}\n  源:   {} 字节, 修改于 {}\n  目标: {} 字节, 修改于 {}\n保留哪一侧? [s]ource / [t]arget / [b]oth / 回车跳过: ",
            conflict.path,
            conflict.source.size,
            conflict.source.modified_at,
            conflict.target.size,
            conflict.target.modified_at,
        );

        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = io::stderr();
            let _ = stderr.write_all(prompt.as_bytes());
            let _ = stderr.flush();

            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).ok()?;
            Some(line.trim().to_string())
        })
        .await
        .ok()
        .flatten()?;

        if answer.is_empty() {
            return None;
        }
        match answer.parse::<Resolution>() {
            Ok(resolution) => Some(resolution),
            Err(e) => {
                error!("无法识别的回答 {:?}: {}", answer, e);
                None
            }
        }
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

fn print_report(report: &ActionReport) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", json)?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_file = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_file);
    let config = AppConfig::load(&config_file)
        .with_context(|| format!("无法加载配置 {}", config_file.display()))?;

    // guard 必须存活到程序结束
    let _log_guard = init_logging(&config.log, &get_log_dir());
    info!("使用配置文件: {}", config_file.display());

    config.sync.prepare_roots()?;

    if !config.continuous {
        let report = if config.sync.conflict_strategy == ConflictStrategy::Interactive {
            dirsync::run_cycle_with_decider(config.sync, Arc::new(StdinDecider)).await?
        } else {
            dirsync::run_cycle(config.sync).await?
        };
        return print_report(&report);
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到中断信号，正在停止...");
            ctrl_c_cancel.cancel();
        }
    });

    let interval = config.interval();
    let stream = dirsync::run_continuous(config.sync, interval, cancel)?;
    tokio::pin!(stream);

    while let Some(item) = stream.next().await {
        match item {
            Ok(report) => print_report(&report)?,
            Err(e) if e.is_fatal() => {
                return Err(e).context("持续同步终止");
            }
            Err(e) => error!("同步周期失败: {}", e),
        }
    }

    Ok(())
}
