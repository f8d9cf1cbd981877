//! Archive writer: packs every regular file under a source directory into a
//! single gzip-compressed tar.
//!
//! The source tree is live, so the walk is best-effort per entry. Anything
//! that vanishes, cannot be read, or is not a regular file is skipped and
//! reported; only failures on the destination side abort the archive.
//!
//! The destination only appears under its final name after the archive has
//! been fully written and synced.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use super::ArchiveFile;
use crate::errors::{BackupError, Result};

/// Why an entry was left out of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Symlink,
    /// Sockets, fifos, devices.
    NotRegular,
    /// Deleted between enumeration and read.
    Vanished,
    PermissionDenied,
    Unreadable(String),
}

#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Outcome of one archive write.
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    pub archive: ArchiveFile,
    pub entries: usize,
    /// Uncompressed bytes stored.
    pub bytes: u64,
    pub size_bytes: u64,
    /// Hex SHA-256 of the finished archive file.
    pub checksum: String,
    pub skipped: Vec<SkippedEntry>,
}

pub struct ArchiveWriter;

impl ArchiveWriter {
    /// Archive `source_dir` into `archive`'s path.
    pub fn write(source_dir: &Path, archive: ArchiveFile) -> Result<ArchiveReport> {
        if !source_dir.is_dir() {
            return Err(BackupError::SourceMissing(source_dir.to_path_buf()));
        }

        let temp_path = archive.partial_path();
        let outcome = write_entries(source_dir, &temp_path);
        let (entries, bytes, skipped) = match outcome {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };

        if let Err(e) = fs::rename(&temp_path, &archive.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        let size_bytes = fs::metadata(&archive.path)?.len();
        let checksum = calculate_checksum(&archive.path)?;

        Ok(ArchiveReport {
            archive,
            entries,
            bytes,
            size_bytes,
            checksum,
            skipped,
        })
    }
}

fn write_entries(
    source_dir: &Path,
    temp_path: &Path,
) -> io::Result<(usize, u64, Vec<SkippedEntry>)> {
    let file = File::create(temp_path)?;
    let enc = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut tar = Builder::new(enc);

    let mut entries = 0usize;
    let mut bytes = 0u64;
    let mut skipped = Vec::new();

    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // A directory that disappeared or cannot be listed.
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                log::warn!("Skipping unreadable path {}: {}", path.display(), e);
                skipped.push(SkippedEntry {
                    path,
                    reason: classify_walk_error(&e),
                });
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let path = entry.path();
        if file_type.is_symlink() {
            log::debug!("Skipping symlink {}", path.display());
            skipped.push(SkippedEntry {
                path: path.to_path_buf(),
                reason: SkipReason::Symlink,
            });
            continue;
        }
        if !file_type.is_file() {
            log::debug!("Skipping special file {}", path.display());
            skipped.push(SkippedEntry {
                path: path.to_path_buf(),
                reason: SkipReason::NotRegular,
            });
            continue;
        }

        let name = match entry_name(source_dir, path) {
            Some(n) => n,
            None => continue,
        };

        // Read the whole file first so a concurrent writer can't make the
        // stored length disagree with the header.
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) => {
                let reason = match e.kind() {
                    io::ErrorKind::NotFound => SkipReason::Vanished,
                    io::ErrorKind::PermissionDenied => SkipReason::PermissionDenied,
                    _ => SkipReason::Unreadable(e.to_string()),
                };
                log::warn!("Skipping {}: {}", path.display(), e);
                skipped.push(SkippedEntry {
                    path: path.to_path_buf(),
                    reason,
                });
                continue;
            }
        };

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(modified_secs(&entry));
        tar.append_data(&mut header, &name, data.as_slice())?;

        entries += 1;
        bytes += data.len() as u64;
    }

    let enc = tar.into_inner()?;
    let writer = enc.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok((entries, bytes, skipped))
}

/// Forward-slash path of `path` relative to `root`.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn modified_secs(entry: &walkdir::DirEntry) -> u64 {
    entry
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn classify_walk_error(e: &walkdir::Error) -> SkipReason {
    match e.io_error().map(io::Error::kind) {
        Some(io::ErrorKind::NotFound) => SkipReason::Vanished,
        Some(io::ErrorKind::PermissionDenied) => SkipReason::PermissionDenied,
        _ => SkipReason::Unreadable(e.to_string()),
    }
}

/// Calculate SHA256 checksum of a file
pub fn calculate_checksum(path: &Path) -> io::Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Unpack an archive into `dest` for inspection. `dest` is created if needed.
pub fn extract_archive(archive: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let tar_gz = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz));
    archive.unpack(dest)
}

/// Entry names stored in an archive, in archive order.
pub fn list_entries(archive: &Path) -> io::Result<Vec<String>> {
    let tar_gz = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().replace('\\', "/"));
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_world(root: &Path) {
        fs::create_dir_all(root.join("region")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("level.dat"), b"level").unwrap();
        fs::write(root.join("region/r.0.0.mca"), vec![7u8; 4096]).unwrap();
    }

    #[test]
    fn test_entries_are_relative_and_skip_directories() {
        let temp = TempDir::new().unwrap();
        let world = temp.path().join("world");
        let backups = temp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        make_world(&world);

        let report = ArchiveWriter::write(&world, ArchiveFile::new(&backups, 1_000)).unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.bytes, 5 + 4096);
        assert!(report.skipped.is_empty());
        assert_eq!(report.checksum.len(), 64);

        let mut names = list_entries(&report.archive.path).unwrap();
        names.sort();
        assert_eq!(names, vec!["level.dat", "region/r.0.0.mca"]);
    }

    #[test]
    fn test_no_partial_file_left_behind() {
        let temp = TempDir::new().unwrap();
        let world = temp.path().join("world");
        let backups = temp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        make_world(&world);

        let archive = ArchiveFile::new(&backups, 42);
        let partial = archive.partial_path();
        let report = ArchiveWriter::write(&world, archive).unwrap();
        assert!(report.archive.path.exists());
        assert!(!partial.exists());
    }

    #[test]
    fn test_missing_source_produces_nothing() {
        let temp = TempDir::new().unwrap();
        let backups = temp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        let archive = ArchiveFile::new(&backups, 7);
        let final_path = archive.path.clone();

        let err = ArchiveWriter::write(&temp.path().join("nope"), archive).unwrap_err();
        assert!(matches!(err, BackupError::SourceMissing(_)));
        assert!(!final_path.exists());
        assert_eq!(fs::read_dir(&backups).unwrap().count(), 0);
    }

    #[test]
    fn test_unwritable_destination_fails_cleanly() {
        let temp = TempDir::new().unwrap();
        let world = temp.path().join("world");
        make_world(&world);
        // Backup directory never created.
        let archive = ArchiveFile::new(&temp.path().join("missing"), 9);
        assert!(matches!(
            ArchiveWriter::write(&world, archive),
            Err(BackupError::Io(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let temp = TempDir::new().unwrap();
        let world = temp.path().join("world");
        let backups = temp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        make_world(&world);
        std::os::unix::fs::symlink(world.join("level.dat"), world.join("link.dat")).unwrap();

        let report = ArchiveWriter::write(&world, ArchiveFile::new(&backups, 3)).unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, SkipReason::Symlink);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_skipped_and_the_rest_archived() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let world = temp.path().join("world");
        let backups = temp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        make_world(&world);
        let locked = world.join("session.lock");
        fs::write(&locked, b"held").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read(&locked).is_ok() {
            // Privileged user; mode bits are not enforced.
            return;
        }

        let report = ArchiveWriter::write(&world, ArchiveFile::new(&backups, 5)).unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].path, locked);
        assert_eq!(report.skipped[0].reason, SkipReason::PermissionDenied);

        let mut names = list_entries(&report.archive.path).unwrap();
        names.sort();
        assert_eq!(names, vec!["level.dat", "region/r.0.0.mca"]);
    }

    #[test]
    fn test_entry_name_uses_forward_slashes() {
        let root = Path::new("/srv/world");
        let path = root.join("DIM-1").join("region").join("r.0.0.mca");
        assert_eq!(
            entry_name(root, &path).as_deref(),
            Some("DIM-1/region/r.0.0.mca")
        );
        assert_eq!(entry_name(root, root), None);
    }
}
