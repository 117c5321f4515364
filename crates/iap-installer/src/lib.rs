//! iap-installer
//!
//! Filesystem capabilities the download tracker invokes once hosted content
//! reaches a terminal state:
//!
//! - [`AssetInstaller`] relocates a finished download's staged files into the
//!   application-private store, one file at a time. A failed file is reported
//!   and the remaining files are still moved.
//! - [`ContentCleaner`] removes partially staged content after a cancelled or
//!   failed download.
//! - [`DownloadsDir`] owns the destination directory, created lazily and
//!   marked excluded from backup via a [`BackupExclusion`] capability.

mod backup;
mod fs_installer;

pub use backup::{BackupExclusion, CacheDirTag, NoBackupExclusion, CACHEDIR_TAG_FILE};
pub use fs_installer::{DownloadsDir, FsAssetInstaller, FsContentCleaner};

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Subdirectory of a staged download that holds the deliverable files.
pub const CONTENTS_DIR: &str = "Contents";

/// Relocates installed content. Implementations must not panic on IO
/// failures; every problem is reported through [`InstallReport`].
pub trait AssetInstaller: Send + Sync {
    fn install(&self, source_dir: &Path, dest_dir: &Path) -> InstallReport;
}

/// Removes staged content that will never be installed.
pub trait ContentCleaner: Send + Sync {
    /// Remove `path` (file or directory tree). A missing path is success.
    fn remove_staged(&self, path: &Path) -> io::Result<()>;
}

/// One file that could not be relocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFileError {
    pub file: PathBuf,
    pub message: String,
}

impl fmt::Display for InstallFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "install failed for {}: {}", self.file.display(), self.message)
    }
}

impl std::error::Error for InstallFileError {}

/// Per-file outcome of one [`AssetInstaller::install`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Destination paths that now hold relocated content.
    pub moved: Vec<PathBuf>,
    pub failures: Vec<InstallFileError>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn fail(&mut self, file: impl Into<PathBuf>, err: impl fmt::Display) {
        self.failures.push(InstallFileError {
            file: file.into(),
            message: err.to_string(),
        });
    }
}
