//! Sync orchestration: one-shot commands and the watch daemon

pub mod daemon;
pub mod engine;
pub mod remote;

#[cfg(test)]
pub(crate) mod testing;

pub use daemon::{Daemon, DaemonEvent, DaemonOptions};
pub use engine::{
    machine_identifier, register_machine, unlink, AssetOutcome, AssetResult, AssetStatus,
    LinkStatus, LocalWriteHook, NoHook, PullOptions, PushOptions, RunSummary, SyncEngine,
};
pub use remote::{ApiClient, SyncRemote};
