//! # Storage Module
//!
//! Archive creation, retention, and the scheduler that drives both.
//!
//! - [`archive`] - walks the live world directory into a `.tar.gz` snapshot
//! - [`retention`] - keeps only the newest N snapshots
//! - [`backup_scheduler`] - timer, single-worker cycle queue, and the control
//!   operations an operator front end calls into
//!
//! A *cycle* is one archive write followed by one retention pass, run strictly
//! in that order so retention never sees the archive being written.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

pub mod archive;
pub mod backup_scheduler;
pub mod retention;

pub use archive::{ArchiveReport, ArchiveWriter};
pub use backup_scheduler::{BackupScheduler, BackupStats};
pub use retention::{list_archives, remove_stale_partials, RetentionPolicy, RetentionReport};

use crate::errors::BackupError;

pub const ARCHIVE_PREFIX: &str = "world_backup_";
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// A snapshot file named `world_backup_<epoch-millis>.tar.gz`.
///
/// Ordering is by the embedded stamp, then by path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArchiveFile {
    pub created_millis: u64,
    pub path: PathBuf,
}

impl ArchiveFile {
    pub fn new(dir: &Path, created_millis: u64) -> Self {
        Self {
            created_millis,
            path: dir.join(Self::file_name_for(created_millis)),
        }
    }

    pub fn file_name_for(created_millis: u64) -> String {
        format!("{}{}.{}", ARCHIVE_PREFIX, created_millis, ARCHIVE_EXTENSION)
    }

    /// Recognise a path following the naming convention.
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let digits = name
            .strip_prefix(ARCHIVE_PREFIX)?
            .strip_suffix(ARCHIVE_EXTENSION)?
            .strip_suffix('.')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            created_millis: digits.parse().ok()?,
            path: path.to_path_buf(),
        })
    }

    /// Stamp of a temp file named by [`ArchiveFile::partial_path`].
    pub fn parse_partial(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let inner = name.strip_prefix('.')?.strip_suffix(".partial")?;
        Self::parse(Path::new(inner)).map(|a| a.created_millis)
    }

    /// First free name in `dir` at or after `created_millis`.
    ///
    /// Two cycles starting in the same millisecond would otherwise collide.
    pub fn next_free(dir: &Path, created_millis: u64) -> Self {
        let mut candidate = Self::new(dir, created_millis);
        while candidate.path.exists() || candidate.partial_path().exists() {
            candidate = Self::new(dir, candidate.created_millis + 1);
        }
        candidate
    }

    /// Hidden temp name the archive is written under before the final rename.
    pub fn partial_path(&self) -> PathBuf {
        let name = format!(".{}.partial", Self::file_name_for(self.created_millis));
        match self.path.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Source and destination for backup cycles.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub source_dir: PathBuf,
    pub backup_dir: PathBuf,
}

/// What one cycle did. Either half may have failed independently.
#[derive(Debug)]
pub struct CycleReport {
    pub archive: Result<ArchiveReport, BackupError>,
    pub retention: Result<RetentionReport, BackupError>,
}

impl CycleReport {
    pub fn succeeded(&self) -> bool {
        self.archive.is_ok()
            && self
                .retention
                .as_ref()
                .map(|r| r.failed.is_empty())
                .unwrap_or(false)
    }
}

impl BackupJob {
    pub fn new(source_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            backup_dir: backup_dir.into(),
        }
    }

    /// Write one archive, then trim the directory to `max_backups`.
    ///
    /// Never panics or returns early on failure; everything is logged and
    /// reported through [`CycleReport`].
    pub fn run_cycle(&self, max_backups: usize) -> CycleReport {
        let started = Utc::now().timestamp_millis().max(0) as u64;

        let archive = self.write_archive(started);
        match &archive {
            Ok(report) => {
                log::info!(
                    "Backup created: {} ({} files, {} bytes, sha256 {})",
                    report.archive.file_name(),
                    report.entries,
                    report.size_bytes,
                    report.checksum
                );
                if !report.skipped.is_empty() {
                    log::warn!(
                        "Backup {} skipped {} entries",
                        report.archive.file_name(),
                        report.skipped.len()
                    );
                }
            }
            Err(e) => log::error!("Backup failed: {}", e),
        }

        let retention = RetentionPolicy::new(max_backups)
            .enforce(&self.backup_dir)
            .map_err(BackupError::from);
        match &retention {
            Ok(r) if !r.deleted.is_empty() => {
                log::info!("Retention removed {} old backup(s)", r.deleted.len())
            }
            Ok(_) => {}
            Err(e) => log::error!("Retention pass failed: {}", e),
        }

        CycleReport { archive, retention }
    }

    fn write_archive(&self, started_millis: u64) -> Result<ArchiveReport, BackupError> {
        fs::create_dir_all(&self.backup_dir)?;
        // Cycles never overlap, so any older partial belongs to a dead run.
        if let Err(e) = remove_stale_partials(&self.backup_dir, started_millis) {
            log::warn!("Could not sweep unfinished backups: {}", e);
        }
        let target = ArchiveFile::next_free(&self.backup_dir, started_millis);
        ArchiveWriter::write(&self.source_dir, target)
    }
}
