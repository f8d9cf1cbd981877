//! # Tempus - rotating world snapshots
//!
//! Tempus archives a live directory tree (typically a game server's `world/`)
//! into timestamped `.tar.gz` snapshots on a repeating schedule and keeps only
//! the newest N of them. It is meant to be embedded in a long-running host
//! process, which owns one [`storage::BackupScheduler`] and forwards operator
//! commands to it through [`control::ControlSurface`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tempus::config::JsonConfigStore;
//! use tempus::storage::{BackupJob, BackupScheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let job = BackupJob::new("world", "backups");
//!     let store = Arc::new(JsonConfigStore::new("config/tempus_config.json"));
//!     let scheduler = BackupScheduler::init(job, store)?;
//!
//!     scheduler.set_interval(1, 30)?;
//!     scheduler.trigger_backup();
//!
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`storage`] - archive writer, retention policy, and the scheduler
//! - [`control`] - operator command parser and dispatcher
//! - [`config`] - host configuration file and persisted schedule settings
//! - [`errors`] - error taxonomy shared by all of the above
//!
//! ## Data Flow
//!
//! ```text
//! ┌─────────────────┐
//! │ ControlSurface  │ ← operator commands
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ BackupScheduler │ ← timer + single worker
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ ArchiveWriter → │
//! │ RetentionPolicy │ ← one cycle, strictly in order
//! └─────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod errors;
pub mod storage;

pub use errors::BackupError;
