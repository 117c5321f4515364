use std::fs;
use std::io;
use std::path::Path;

pub const CACHEDIR_TAG_FILE: &str = "CACHEDIR.TAG";

const CACHEDIR_TAG_BODY: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
# This file marks installed in-app content as excluded from backups.\n\
# For information about cache directory tags see https://bford.info/cachedir/\n";

/// Marks a directory as excluded from device backup.
pub trait BackupExclusion: Send + Sync {
    fn exclude(&self, dir: &Path) -> io::Result<()>;
}

/// Writes a standard `CACHEDIR.TAG`, which backup tools on Unix-like systems
/// honour. Platform builds can substitute their native attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheDirTag;

impl BackupExclusion for CacheDirTag {
    fn exclude(&self, dir: &Path) -> io::Result<()> {
        fs::write(dir.join(CACHEDIR_TAG_FILE), CACHEDIR_TAG_BODY)
    }
}

/// Leaves the directory as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackupExclusion;

impl BackupExclusion for NoBackupExclusion {
    fn exclude(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }
}
