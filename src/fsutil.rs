//! Filesystem primitives for atomic publication.
//!
//! Everything persistent is written under a private staging path first, made
//! durable, and only then moved into its visible location.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

/// Create `path` (truncating), write `bytes` and fsync before returning.
pub fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Flush a directory's entry table so a rename into it survives a crash.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Rename `src` over `dst`, falling back to copy+remove across filesystems.
pub fn atomic_rename(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // EXDEV: stage next to the destination so the final step is still a rename.
            let tmp = dst.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
            fs::copy(src, &tmp)?;
            File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, dst)?;
            fs::remove_file(src)
        }
    }
}

/// Publish `src` at `dst` only if `dst` does not exist yet.
///
/// Returns `Ok(false)` when another writer published first. The hard link is
/// the atomic no-clobber step; filesystems without hard links fall back to an
/// existence check followed by a rename.
pub fn publish_no_clobber(src: &Path, dst: &Path) -> io::Result<bool> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => {
            warn!(error = %e, dst = %dst.display(), "hard link publish unavailable, using rename");
            if dst.exists() {
                return Ok(false);
            }
            fs::rename(src, dst)?;
            Ok(true)
        }
    }
}

/// Private directory for one write attempt, removed on drop.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Create `<parent>/<random attempt id>`.
    pub fn create(parent: &Path) -> io::Result<Self> {
        fs::create_dir_all(parent)?;
        let path = parent.join(Uuid::new_v4().simple().to_string());
        fs::create_dir(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Current UTC time as RFC 3339, for bookkeeping fields only.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
