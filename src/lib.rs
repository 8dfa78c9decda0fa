use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;

pub use crate::config::{AppConfig, SyncMode, SyncSettings};
pub use crate::core::{
    ActionReport, ConflictDecider, ConflictStrategy, CycleStatus, Resolution, Scheduler,
    SyncEngine,
};
pub use crate::error::{ErrorKind, Result, SyncError};

use crate::core::CycleState;

/// 运行一次同步周期（非交互策略）
pub async fn run_cycle(settings: SyncSettings) -> Result<ActionReport> {
    let engine = SyncEngine::new(settings, None)?;
    let outcome = engine
        .run(&CycleState::default(), &CancellationToken::new())
        .await?;
    Ok(outcome.report)
}

/// 运行一次同步周期，冲突交给外部决策者
pub async fn run_cycle_with_decider(
    settings: SyncSettings,
    decider: Arc<dyn ConflictDecider>,
) -> Result<ActionReport> {
    let engine = SyncEngine::new(settings, Some(decider))?;
    let outcome = engine
        .run(&CycleState::default(), &CancellationToken::new())
        .await?;
    Ok(outcome.report)
}

/// 持续同步，直到 `cancel` 被触发
///
/// 必须在 tokio 运行时内调用。interactive 策略在这里被拒绝。
pub fn run_continuous(
    settings: SyncSettings,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<impl Stream<Item = Result<ActionReport>>> {
    let scheduler = Arc::new(Scheduler::new(settings, interval)?);
    Ok(scheduler.run_continuous(cancel))
}
