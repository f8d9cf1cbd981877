//! Count-based retention for archive directories.
//!
//! Archives are ordered by the millisecond stamp embedded in their file name,
//! ties broken by the name itself. Filesystem timestamps are never consulted,
//! so copying or touching an archive does not change its place in line.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::ArchiveFile;

/// Outcome of one retention pass.
#[derive(Debug, Default)]
pub struct RetentionReport {
    /// Archives remaining after the pass, oldest first.
    pub kept: Vec<ArchiveFile>,
    pub deleted: Vec<PathBuf>,
    /// Deletions that failed; these files are still on disk.
    pub failed: Vec<(PathBuf, io::Error)>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_count: usize,
}

impl RetentionPolicy {
    pub fn new(max_count: usize) -> Self {
        Self { max_count }
    }

    /// Delete the oldest archives in `dir` until at most `max_count` remain.
    ///
    /// A missing directory is a no-op. Listing failures are returned; per-file
    /// deletion failures are logged and collected without stopping the pass.
    pub fn enforce(&self, dir: &Path) -> io::Result<RetentionReport> {
        Ok(self.evict(list_archives(dir)?))
    }

    /// Delete from `archives` (sorted oldest first) until at most
    /// `max_count` remain on disk.
    pub fn evict(&self, archives: Vec<ArchiveFile>) -> RetentionReport {
        let mut report = RetentionReport::default();
        if archives.len() <= self.max_count {
            report.kept = archives;
            return report;
        }

        let excess = archives.len() - self.max_count;
        let mut archives = archives.into_iter();
        for archive in archives.by_ref().take(excess) {
            match fs::remove_file(&archive.path) {
                Ok(()) => {
                    log::info!("Deleted old backup: {}", archive.file_name());
                    report.deleted.push(archive.path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Removed by someone else in the meantime; the goal is met.
                    log::debug!("Old backup already gone: {}", archive.file_name());
                    report.deleted.push(archive.path);
                }
                Err(e) => {
                    log::warn!("Failed to delete old backup {}: {}", archive.file_name(), e);
                    report.kept.push(archive.clone());
                    report.failed.push((archive.path, e));
                }
            }
        }
        report.kept.extend(archives);
        report
    }
}

/// Remove temp files left by archive writes that never finished, such as
/// after a crash. Only partials stamped before `before_millis` are touched.
pub fn remove_stale_partials(dir: &Path, before_millis: u64) -> io::Result<Vec<PathBuf>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut removed = Vec::new();
    for entry in read_dir.flatten() {
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let path = entry.path();
        let Some(stamp) = ArchiveFile::parse_partial(&path) else {
            continue;
        };
        if stamp >= before_millis {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("Removed unfinished backup {}", path.display());
                removed.push(path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove unfinished backup {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// All archives in `dir` matching the naming convention, oldest first.
pub fn list_archives(dir: &Path) -> io::Result<Vec<ArchiveFile>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut archives = Vec::new();
    for entry in read_dir {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Some(archive) = ArchiveFile::parse(&entry.path()) {
            archives.push(archive);
        }
    }
    archives.sort();
    Ok(archives)
}
