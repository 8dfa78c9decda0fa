pub mod comparator;
pub mod conflict;
pub mod engine;
pub mod executor;
pub mod hash;
pub mod report;
pub mod scheduler;
pub mod snapshot;

pub use comparator::{diff, CompareConfig, CopyDirection, FileComparator, PlanSummary, SyncPlan};
pub use conflict::{
    Conflict, ConflictDecider, ConflictResolver, ConflictStrategy, PolicyDecider, Resolution,
    ResolvedAction, ResolvedConflict,
};
pub use engine::{CycleOutcome, CycleState, SyncEngine};
pub use executor::{ActionExecutor, ExecutorConfig};
pub use hash::{calculate_hash, hash_file};
pub use report::{
    ActionOutcome, ActionReport, ConflictResolvedEntry, CopiedEntry, CycleStatus, FailureEntry,
};
pub use scheduler::{Scheduler, SchedulerState};
pub use snapshot::{DirectorySnapshot, FileRecord, ScanConfig, ScanWarning, SnapshotBuilder};
