pub mod logs;
pub mod system;

use crate::state::{CpuStat, MemoryStat, StorageStat, SystemInfoStat};
use thiserror::Error;

/// Point-in-time host reading: a full snapshot minus the log summary,
/// which is tracked separately and attached by the broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSample {
    pub cpu: CpuStat,
    pub memory: MemoryStat,
    pub storage: StorageStat,
    pub system_info: SystemInfoStat,
}

/// A metrics read failed for a reason other than a known-absent optional
/// sensor. The tick is skipped, never retried synchronously.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("cpu information unavailable")]
    CpuUnavailable,
    #[error("no disk mounted at {mount}")]
    DiskUnavailable { mount: String },
}

/// Supplies point-in-time host readings. Treated as a fallible, possibly
/// slow synchronous call; the broadcaster runs it on the blocking pool.
pub trait MetricsProvider: Send + Sync + 'static {
    fn sample(&self) -> Result<HostSample, SampleError>;
}
