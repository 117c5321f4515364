use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{AssetInstaller, BackupExclusion, ContentCleaner, InstallReport};

// ---------------------------------------------------------------------------
// DownloadsDir
// ---------------------------------------------------------------------------

/// The application-private destination for installed content.
///
/// Created on first use; the backup exclusion is applied only when this
/// call created the directory.
#[derive(Clone)]
pub struct DownloadsDir {
    path: PathBuf,
    exclusion: Arc<dyn BackupExclusion>,
}

impl std::fmt::Debug for DownloadsDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadsDir").field("path", &self.path).finish()
    }
}

impl DownloadsDir {
    pub fn new(path: impl Into<PathBuf>, exclusion: Arc<dyn BackupExclusion>) -> Self {
        Self {
            path: path.into(),
            exclusion,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make sure the directory exists and return its path.
    ///
    /// A failure to apply the backup exclusion is logged; the directory is
    /// still usable.
    pub fn ensure(&self) -> io::Result<&Path> {
        if self.path.is_dir() {
            return Ok(&self.path);
        }
        fs::create_dir_all(&self.path)?;
        info!(path = %self.path.display(), "downloads directory created");
        if let Err(err) = self.exclusion.exclude(&self.path) {
            warn!(path = %self.path.display(), error = %err, "could not exclude downloads directory from backup");
        }
        Ok(&self.path)
    }
}

// ---------------------------------------------------------------------------
// FsAssetInstaller
// ---------------------------------------------------------------------------

/// Moves every top-level entry of `source_dir` into `dest_dir`.
///
/// For each entry the destination is removed first ("not found" ignored),
/// then the entry is renamed into place, falling back to copy-and-delete
/// when a rename is impossible (e.g. across filesystems). Entries are
/// processed in name order; a failure is recorded and the next entry is
/// still attempted. Not transactional: a partial install stays partial.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAssetInstaller;

impl AssetInstaller for FsAssetInstaller {
    fn install(&self, source_dir: &Path, dest_dir: &Path) -> InstallReport {
        let mut report = InstallReport::default();

        let mut entries: Vec<PathBuf> = match fs::read_dir(source_dir) {
            Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(err) => {
                warn!(source = %source_dir.display(), error = %err, "staged content unreadable");
                report.fail(source_dir, err);
                return report;
            }
        };
        entries.sort();

        for src in entries {
            let Some(name) = src.file_name() else {
                continue;
            };
            let dest = dest_dir.join(name);

            if let Err(err) = remove_path(&dest) {
                warn!(dest = %dest.display(), error = %err, "could not clear install destination");
                report.fail(&src, err);
                continue;
            }

            match move_path(&src, &dest) {
                Ok(()) => {
                    debug!(from = %src.display(), to = %dest.display(), "installed");
                    report.moved.push(dest);
                }
                Err(err) => {
                    warn!(from = %src.display(), to = %dest.display(), error = %err, "install move failed");
                    report.fail(&src, err);
                }
            }
        }

        report
    }
}

// ---------------------------------------------------------------------------
// FsContentCleaner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct FsContentCleaner;

impl ContentCleaner for FsContentCleaner {
    fn remove_staged(&self, path: &Path) -> io::Result<()> {
        remove_path(path)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Remove a file or directory tree; a missing path is not an error.
fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn move_path(src: &Path, dest: &Path) -> io::Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    copy_recursive(src, dest)?;
    remove_path(src)
}

fn copy_recursive(src: &Path, dest: &Path) -> io::Result<()> {
    if fs::symlink_metadata(src)?.is_dir() {
        fs::create_dir(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dest).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheDirTag, NoBackupExclusion, CACHEDIR_TAG_FILE, CONTENTS_DIR};

    fn staged(root: &Path) -> PathBuf {
        let contents = root.join("asset-1").join(CONTENTS_DIR);
        fs::create_dir_all(contents.join("levels")).unwrap();
        fs::write(contents.join("manifest.json"), "{}").unwrap();
        fs::write(contents.join("levels").join("1.dat"), "L1").unwrap();
        contents
    }

    #[test]
    fn moves_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let src = staged(tmp.path());
        let dest = tmp.path().join("Downloads");
        fs::create_dir_all(&dest).unwrap();

        let report = FsAssetInstaller.install(&src, &dest);
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(report.moved.len(), 2);
        assert_eq!(fs::read_to_string(dest.join("levels").join("1.dat")).unwrap(), "L1");
        assert!(dest.join("manifest.json").is_file());
        assert!(!src.join("manifest.json").exists());
    }

    #[test]
    fn destination_is_replaced_not_merged() {
        let tmp = tempfile::tempdir().unwrap();
        let src = staged(tmp.path());
        let dest = tmp.path().join("Downloads");
        fs::create_dir_all(dest.join("levels")).unwrap();
        fs::write(dest.join("levels").join("stale.dat"), "old").unwrap();
        fs::write(dest.join("manifest.json"), "old").unwrap();

        let report = FsAssetInstaller.install(&src, &dest);
        assert!(report.is_complete());
        assert!(!dest.join("levels").join("stale.dat").exists());
        assert_eq!(fs::read_to_string(dest.join("manifest.json")).unwrap(), "{}");
    }

    #[test]
    fn unreadable_source_is_reported_not_panicked() {
        let tmp = tempfile::tempdir().unwrap();
        let report = FsAssetInstaller.install(&tmp.path().join("missing"), tmp.path());
        assert!(report.moved.is_empty());
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn missing_destination_fails_each_file_independently() {
        let tmp = tempfile::tempdir().unwrap();
        let src = staged(tmp.path());
        let dest = tmp.path().join("not-created");

        let report = FsAssetInstaller.install(&src, &dest);
        assert_eq!(report.failures.len(), 2, "every entry attempted");
        assert!(report.moved.is_empty());
    }

    #[test]
    fn cleaner_removes_trees_and_ignores_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("asset-1");
        staged(tmp.path());
        FsContentCleaner.remove_staged(&root).unwrap();
        assert!(!root.exists());
        FsContentCleaner.remove_staged(&root).unwrap();
    }

    #[test]
    fn downloads_dir_created_once_with_backup_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DownloadsDir::new(tmp.path().join("support").join("Downloads"), Arc::new(CacheDirTag));
        assert!(!dir.path().exists());

        let p = dir.ensure().unwrap().to_path_buf();
        assert!(p.is_dir());
        assert!(p.join(CACHEDIR_TAG_FILE).is_file());

        // Idempotent: existing directory is left alone.
        fs::remove_file(p.join(CACHEDIR_TAG_FILE)).unwrap();
        dir.ensure().unwrap();
        assert!(!p.join(CACHEDIR_TAG_FILE).exists());
    }

    #[test]
    fn downloads_dir_without_exclusion() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DownloadsDir::new(tmp.path().join("Downloads"), Arc::new(NoBackupExclusion));
        dir.ensure().unwrap();
        assert!(!dir.path().join(CACHEDIR_TAG_FILE).exists());
    }
}
