//! On-disk cache shared between build processes.
//!
//! Layout under the cache root:
//!
//! ```text
//! blobs/sha256/<aa>/<hex>   content-addressed blobs
//! index/<hex>.json          one entry per fingerprint
//! tmp/<attempt>/            private staging for one store attempt
//! locks/<hex>.lock          advisory build claims
//! gc.lock                   shared by stores, exclusive for gc
//! ```
//!
//! A store writes and fsyncs every blob under its own staging directory,
//! renames them into `blobs/`, then hard-links the index file into
//! `index/`. The link fails if the name already exists, so the first
//! publisher wins and nobody ever sees a half-written entry.
//!
//! Blobs a store finds already in place get their mtime bumped, and the
//! store holds `gc.lock` shared until its index is published. gc takes it
//! exclusively, so it never judges a blob unreferenced while a store that
//! reuses it is in flight.

use super::{
    assemble_image, CacheEntry, CacheStore, CachedImage, Claim, ClaimGuard, Lookup, StoreOutcome,
    CLAIM_POLL,
};
use crate::cancel::CancelToken;
use crate::digest::{is_hex_64, Digest};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::fsutil::{
    atomic_rename, now_rfc3339, publish_no_clobber, sync_dir, write_synced, StagingDir,
};
use crate::layer::Layer;
use crate::manifest::Manifest;
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

/// Counts reported by [`DiskCache::status`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStatus {
    pub root: PathBuf,
    pub index_entries: u64,
    pub corrupt_entries: u64,
    pub blobs: u64,
    pub blob_bytes: u64,
    pub unreferenced_blobs: u64,
    pub staging_dirs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub removed_blobs: u64,
    pub freed_bytes: u64,
    /// Unreferenced but younger than the grace period.
    pub kept_recent: u64,
    /// Idle claim lock files removed.
    pub removed_locks: u64,
}

impl DiskCache {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        let cache = Self {
            root: root.to_path_buf(),
        };
        for dir in [
            cache.blobs_dir(),
            cache.index_dir(),
            cache.tmp_dir(),
            cache.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| CacheError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.blobs_dir().join(&hex[..2]).join(hex)
    }

    fn index_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.index_dir().join(format!("{}.json", fingerprint.hex()))
    }

    fn lock_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.locks_dir()
            .join(format!("{}.lock", fingerprint.hex()))
    }

    fn gc_lock_path(&self) -> PathBuf {
        self.root.join("gc.lock")
    }

    /// Hold `gc.lock` shared for the rest of a store. Polls so that a long
    /// gc does not keep a cancelled build waiting.
    fn share_gc_lock(&self, cancel: &CancelToken) -> Result<File, CacheError> {
        let path = self.gc_lock_path();
        let file = open_lock_file(&path)?;
        loop {
            match FileExt::try_lock_shared(&file) {
                Ok(()) => return Ok(file),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(CacheError::io(format!("locking {}", path.display()), e)),
            }
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            thread::sleep(CLAIM_POLL);
        }
    }

    fn exclusive_gc_lock(&self) -> Result<File, CacheError> {
        let path = self.gc_lock_path();
        let file = open_lock_file(&path)?;
        file.lock_exclusive()
            .map_err(|e| CacheError::io(format!("locking {}", path.display()), e))?;
        Ok(file)
    }

    /// Re-create referenced blobs that vanished while the index was being
    /// published. Only an external deletion can cause this.
    fn restore_missing_blobs(&self, staging: &StagingDir, blobs: &[(&Digest, &[u8])]) {
        for &(digest, bytes) in blobs {
            let dest = self.blob_path(digest);
            if dest.is_file() {
                continue;
            }
            warn!(blob = %digest.short(), "blob vanished during store, rewriting");
            let tmp = staging.join(&format!("{}.restore", digest.hex()));
            let result = write_synced(&tmp, bytes).and_then(|()| atomic_rename(&tmp, &dest));
            if let Err(e) = result {
                warn!(blob = %digest.short(), error = %e, "could not rewrite blob");
            }
        }
    }

    fn read_entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.index_path(fingerprint);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::io(format!("reading {}", path.display()), e));
            }
        };
        let entry: CacheEntry = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::corrupt(fingerprint, format!("unparseable index: {e}")))?;
        if entry.fingerprint != *fingerprint {
            return Err(CacheError::corrupt(
                fingerprint,
                format!("index names fingerprint {}", entry.fingerprint),
            ));
        }
        Ok(Some(entry))
    }

    /// Every parseable index entry, sorted by fingerprint, plus the number
    /// of index files that could not be read.
    pub fn entries(&self) -> Result<(Vec<CacheEntry>, u64), CacheError> {
        let dir = self.index_dir();
        let read_dir =
            fs::read_dir(&dir).map_err(|e| CacheError::io(format!("listing {}", dir.display()), e))?;

        let mut entries = Vec::new();
        let mut unreadable = 0u64;
        for ent in read_dir {
            let ent = ent.map_err(|e| CacheError::io(format!("listing {}", dir.display()), e))?;
            let name = ent.file_name();
            let Some(hex) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Ok(digest) = Digest::from_hex(hex) else {
                continue;
            };
            match self.read_entry(&Fingerprint::from(digest)) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) if e.is_corruption() => {
                    warn!(index = %ent.path().display(), error = %e, "skipping corrupt index entry");
                    unreadable += 1;
                }
                Err(e) => return Err(e),
            }
        }
        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok((entries, unreadable))
    }

    fn referenced_blobs(&self) -> Result<(BTreeSet<String>, u64), CacheError> {
        let (entries, unreadable) = self.entries()?;
        let referenced = entries
            .iter()
            .flat_map(|e| e.blob_digests())
            .map(|d| d.hex().to_string())
            .collect();
        Ok((referenced, unreadable))
    }

    /// Content-addressed blob files as `(hex, path, size, modified)`.
    fn blob_files(&self) -> Vec<(String, PathBuf, u64, Option<SystemTime>)> {
        WalkDir::new(self.blobs_dir())
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|ent| ent.file_type().is_file())
            .filter_map(|ent| {
                let name = ent.file_name().to_str()?.to_string();
                if !is_hex_64(&name) {
                    return None;
                }
                let md = ent.metadata().ok()?;
                Some((name, ent.path().to_path_buf(), md.len(), md.modified().ok()))
            })
            .collect()
    }

    /// Remove blobs no index entry references, and idle claim lock files.
    ///
    /// Blobs modified within `min_age` are kept. Stores are locked out for
    /// the duration, so the referenced set cannot change underneath.
    pub fn gc(&self, min_age: Duration) -> Result<GcReport, CacheError> {
        let _gc_lock = self.exclusive_gc_lock()?;
        let (referenced, unreadable) = self.referenced_blobs()?;
        if unreadable > 0 {
            warn!(unreadable, "gc ignores blobs referenced only by corrupt index entries");
        }

        let now = SystemTime::now();
        let mut report = GcReport::default();
        for (hex, path, size, modified) in self.blob_files() {
            if referenced.contains(&hex) {
                continue;
            }
            let age = modified
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < min_age {
                report.kept_recent += 1;
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    report.removed_blobs += 1;
                    report.freed_bytes += size;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CacheError::io(format!("removing {}", path.display()), e));
                }
            }
        }
        report.removed_locks = self.prune_locks(min_age)?;

        info!(
            removed = report.removed_blobs,
            freed_bytes = report.freed_bytes,
            kept_recent = report.kept_recent,
            removed_locks = report.removed_locks,
            "cache gc finished"
        );
        Ok(report)
    }

    /// Unlink claim lock files older than `min_age` that nobody holds.
    ///
    /// Each file is locked before it is unlinked. A claimer that opened it
    /// earlier notices the stale inode in [`CacheStore::claim`] and retries.
    fn prune_locks(&self, min_age: Duration) -> Result<u64, CacheError> {
        let dir = self.locks_dir();
        let read_dir =
            fs::read_dir(&dir).map_err(|e| CacheError::io(format!("listing {}", dir.display()), e))?;

        let now = SystemTime::now();
        let mut removed = 0u64;
        for ent in read_dir.filter_map(Result::ok) {
            let path = ent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let Ok(md) = fs::symlink_metadata(&path) else {
                continue;
            };
            let age = md
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if !md.is_file() || age < min_age {
                continue;
            }
            let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            if file.try_lock_exclusive().is_err() {
                debug!(lock = %path.display(), "claim lock in use");
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CacheError::io(format!("removing {}", path.display()), e));
                }
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<StoreStatus, CacheError> {
        let (entries, corrupt) = self.entries()?;
        let referenced: BTreeSet<String> = entries
            .iter()
            .flat_map(|e| e.blob_digests())
            .map(|d| d.hex().to_string())
            .collect();

        let mut status = StoreStatus {
            root: self.root.clone(),
            index_entries: entries.len() as u64,
            corrupt_entries: corrupt,
            ..StoreStatus::default()
        };
        for (hex, _, size, _) in self.blob_files() {
            status.blobs += 1;
            status.blob_bytes += size;
            if !referenced.contains(&hex) {
                status.unreferenced_blobs += 1;
            }
        }
        if let Ok(read_dir) = fs::read_dir(self.tmp_dir()) {
            status.staging_dirs = read_dir.filter_map(Result::ok).count() as u64;
        }
        Ok(status)
    }

    /// Remove staging directories older than `max_age`, left behind by
    /// interrupted stores. Returns how many were removed.
    pub fn sweep_staging(&self, max_age: Duration) -> Result<u64, CacheError> {
        let dir = self.tmp_dir();
        let read_dir =
            fs::read_dir(&dir).map_err(|e| CacheError::io(format!("listing {}", dir.display()), e))?;

        let now = SystemTime::now();
        let mut removed = 0u64;
        for ent in read_dir.filter_map(Result::ok) {
            let path = ent.path();
            let Ok(md) = fs::symlink_metadata(&path) else {
                continue;
            };
            let age = md
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            let result = if md.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CacheError::io(format!("removing {}", path.display()), e));
                }
            }
        }
        if removed > 0 {
            info!(removed, "swept stale staging directories");
        }
        Ok(removed)
    }
}

impl CacheStore for DiskCache {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Lookup, CacheError> {
        let Some(entry) = self.read_entry(fingerprint)? else {
            debug!(fingerprint = %fingerprint.short(), "cache miss");
            return Ok(Lookup::Miss);
        };
        for digest in entry.blob_digests() {
            if !self.blob_path(digest).is_file() {
                return Err(CacheError::corrupt(
                    fingerprint,
                    format!("referenced blob {digest} is missing"),
                ));
            }
        }
        debug!(fingerprint = %fingerprint.short(), manifest = %entry.manifest_digest.short(), "cache hit");
        Ok(Lookup::Hit(entry))
    }

    fn store(
        &self,
        fingerprint: &Fingerprint,
        manifest: &Manifest,
        layers: &[Layer],
        cancel: &CancelToken,
    ) -> Result<StoreOutcome, CacheError> {
        let index_path = self.index_path(fingerprint);
        if index_path.exists() {
            debug!(fingerprint = %fingerprint.short(), "entry already present, skipping store");
            return Ok(StoreOutcome::AlreadyPresent);
        }

        let entry = CacheEntry::new(fingerprint, manifest, layers, now_rfc3339())?;
        let _gc_lock = self.share_gc_lock(cancel)?;
        let staging = StagingDir::create(&self.tmp_dir())
            .map_err(|e| CacheError::io("creating staging directory", e))?;

        let blobs: Vec<(&Digest, &[u8])> = [
            (&manifest.digest, &manifest.bytes[..]),
            (&manifest.config_digest, &manifest.config_bytes[..]),
        ]
        .into_iter()
        .chain(layers.iter().map(|l| (&l.digest, &l.blob[..])))
        .collect();

        let mut seen = BTreeSet::new();
        let mut staged = Vec::new();
        for &(digest, bytes) in &blobs {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if !seen.insert(digest.hex()) {
                continue;
            }
            let dest = self.blob_path(digest);
            let reused = touch_blob(&dest)
                .map_err(|e| CacheError::io(format!("refreshing {}", dest.display()), e))?;
            if reused {
                continue;
            }
            let tmp = staging.join(digest.hex());
            write_synced(&tmp, bytes)
                .map_err(|e| CacheError::io(format!("staging blob {digest}"), e))?;
            staged.push((tmp, dest));
        }

        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        for (tmp, dest) in &staged {
            atomic_rename(tmp, dest)
                .map_err(|e| CacheError::io(format!("moving blob to {}", dest.display()), e))?;
            if let Some(parent) = dest.parent() {
                sync_dir(parent)
                    .map_err(|e| CacheError::io(format!("syncing {}", parent.display()), e))?;
            }
        }

        let index_tmp = staging.join("index.json");
        write_synced(&index_tmp, &serde_json::to_vec_pretty(&entry)?)
            .map_err(|e| CacheError::io("staging index entry", e))?;

        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let published = publish_no_clobber(&index_tmp, &index_path)
            .map_err(|e| CacheError::io(format!("publishing {}", index_path.display()), e))?;
        // The entry is visible from here on; report what happened to it.
        if let Err(e) = sync_dir(&self.index_dir()) {
            warn!(fingerprint = %fingerprint.short(), error = %e, "could not sync index directory");
        }

        if published {
            self.restore_missing_blobs(&staging, &blobs);
            info!(
                fingerprint = %fingerprint.short(),
                manifest = %manifest.digest.short(),
                new_blobs = staged.len(),
                "stored build in cache"
            );
            Ok(StoreOutcome::Published)
        } else {
            debug!(fingerprint = %fingerprint.short(), "lost publish race, entry already present");
            Ok(StoreOutcome::AlreadyPresent)
        }
    }

    fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let path = self.index_path(fingerprint);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.index_dir())
                    .map_err(|e| CacheError::io("syncing index directory", e))?;
                info!(fingerprint = %fingerprint.short(), "invalidated cache entry");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(format!("removing {}", path.display()), e)),
        }
    }

    fn load_image(&self, entry: &CacheEntry) -> Result<CachedImage, CacheError> {
        assemble_image(entry, |digest| {
            let path = self.blob_path(digest);
            fs::read(&path).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    CacheError::corrupt(&entry.fingerprint, format!("blob {digest} is missing"))
                } else {
                    CacheError::io(format!("reading {}", path.display()), e)
                }
            })
        })
    }

    fn claim(&self, fingerprint: &Fingerprint, wait: Duration) -> Result<Claim, CacheError> {
        let path = self.lock_path(fingerprint);
        let deadline = Instant::now() + wait;
        loop {
            let file = open_lock_file(&path)?;
            match file.try_lock_exclusive() {
                // gc may have unlinked the file between open and lock.
                Ok(()) if is_current_lock(&file, &path) => {
                    return Ok(Claim::Acquired(ClaimGuard::file(file)));
                }
                Ok(()) => {}
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(CacheError::io(format!("locking {}", path.display()), e)),
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(fingerprint = %fingerprint.short(), "claim busy");
                return Ok(Claim::Busy);
            }
            thread::sleep(CLAIM_POLL.min(deadline - now));
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, CacheError> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| CacheError::io(format!("opening {}", path.display()), e))
}

/// Whether `file` is still the inode linked at `path`.
fn is_current_lock(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(linked)) => held.dev() == linked.dev() && held.ino() == linked.ino(),
        _ => false,
    }
}

/// Bump an existing blob's mtime so gc's grace period restarts. Returns
/// `false` when there is no usable blob and the caller must stage one.
fn touch_blob(path: &Path) -> io::Result<bool> {
    match OpenOptions::new().write(true).open(path) {
        Ok(file) => {
            file.set_modified(SystemTime::now())?;
            Ok(true)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::sample_build;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn open() -> (TempDir, DiskCache) {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(&temp.path().join("cache")).unwrap();
        (temp, cache)
    }

    /// Backdate every blob's mtime. Blobs removed meanwhile are skipped.
    fn age_blobs(cache: &DiskCache, by: Duration) {
        let then = SystemTime::now() - by;
        for (_, path, _, _) in cache.blob_files() {
            if let Ok(file) = OpenOptions::new().write(true).open(&path) {
                let _ = file.set_modified(then);
            }
        }
    }

    fn blob_age(cache: &DiskCache, digest: &Digest) -> Duration {
        let modified = fs::metadata(cache.blob_path(digest))
            .unwrap()
            .modified()
            .unwrap();
        SystemTime::now().duration_since(modified).unwrap_or_default()
    }

    #[test]
    fn test_miss_then_hit() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");

        assert_eq!(cache.lookup(&fp).unwrap(), Lookup::Miss);
        let outcome = cache
            .store(&fp, &manifest, &layers, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Published);

        let Lookup::Hit(entry) = cache.lookup(&fp).unwrap() else {
            panic!("expected hit");
        };
        assert_eq!(entry.manifest_digest, manifest.digest);
        assert_eq!(entry.layers.len(), 2);

        let image = cache.load_image(&entry).unwrap();
        assert_eq!(image.manifest, manifest);
        assert_eq!(image.layers, layers);

        let staging: Vec<_> = fs::read_dir(cache.tmp_dir()).unwrap().collect();
        assert!(staging.is_empty());
    }

    #[test]
    fn test_store_is_idempotent() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");
        let cancel = CancelToken::new();

        cache.store(&fp, &manifest, &layers, &cancel).unwrap();
        let before = fs::read(cache.index_path(&fp)).unwrap();
        assert_eq!(
            cache.store(&fp, &manifest, &layers, &cancel).unwrap(),
            StoreOutcome::AlreadyPresent
        );
        assert_eq!(fs::read(cache.index_path(&fp)).unwrap(), before);
    }

    #[test]
    fn test_concurrent_stores_publish_once() {
        let (_temp, cache) = open();
        let cache = Arc::new(cache);
        let (fp, manifest, layers) = sample_build("race");

        let outcomes: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let (fp, manifest, layers) = (&fp, &manifest, &layers);
                    scope.spawn(move || {
                        cache
                            .store(fp, manifest, layers, &CancelToken::new())
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let published = outcomes
            .iter()
            .filter(|o| **o == StoreOutcome::Published)
            .count();
        assert_eq!(published, 1);
        let Lookup::Hit(entry) = cache.lookup(&fp).unwrap() else {
            panic!("expected hit");
        };
        cache.load_image(&entry).unwrap();
    }

    #[test]
    fn test_cancelled_store_publishes_nothing() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            cache.store(&fp, &manifest, &layers, &cancel),
            Err(CacheError::Cancelled)
        ));
        assert_eq!(cache.lookup(&fp).unwrap(), Lookup::Miss);
        assert_eq!(fs::read_dir(cache.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_blobs_without_index_are_a_miss() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");
        cache
            .store(&fp, &manifest, &layers, &CancelToken::new())
            .unwrap();

        // Crash between moving blobs and publishing the index.
        fs::remove_file(cache.index_path(&fp)).unwrap();
        assert!(cache.blob_path(&manifest.digest).is_file());
        assert_eq!(cache.lookup(&fp).unwrap(), Lookup::Miss);
    }

    #[test]
    fn test_corrupt_entries_are_reported() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");
        let cancel = CancelToken::new();
        cache.store(&fp, &manifest, &layers, &cancel).unwrap();

        fs::remove_file(cache.blob_path(&layers[0].digest)).unwrap();
        assert!(matches!(cache.lookup(&fp), Err(e) if e.is_corruption()));

        fs::write(cache.index_path(&fp), b"{not json").unwrap();
        assert!(matches!(cache.lookup(&fp), Err(e) if e.is_corruption()));
        assert_eq!(cache.status().unwrap().corrupt_entries, 1);

        assert!(cache.invalidate(&fp).unwrap());
        assert!(!cache.invalidate(&fp).unwrap());
        assert_eq!(cache.lookup(&fp).unwrap(), Lookup::Miss);
        assert_eq!(
            cache.store(&fp, &manifest, &layers, &cancel).unwrap(),
            StoreOutcome::Published
        );
    }

    #[test]
    fn test_load_image_detects_tampered_blob() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");
        cache
            .store(&fp, &manifest, &layers, &CancelToken::new())
            .unwrap();

        fs::write(cache.blob_path(&layers[1].digest), b"garbage").unwrap();
        let Lookup::Hit(entry) = cache.lookup(&fp).unwrap() else {
            panic!("expected hit");
        };
        assert!(matches!(cache.load_image(&entry), Err(e) if e.is_corruption()));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (_temp, cache) = open();
        let (fp, _, _) = sample_build("a");

        let Claim::Acquired(guard) = cache.claim(&fp, Duration::ZERO).unwrap() else {
            panic!("expected claim");
        };
        assert!(matches!(
            cache.claim(&fp, Duration::from_millis(120)).unwrap(),
            Claim::Busy
        ));
        drop(guard);
        assert!(matches!(
            cache.claim(&fp, Duration::ZERO).unwrap(),
            Claim::Acquired(_)
        ));
    }

    #[test]
    fn test_gc_removes_unreferenced_blobs() {
        let (_temp, cache) = open();
        let (fp_a, manifest_a, layers_a) = sample_build("a");
        let (fp_b, manifest_b, layers_b) = sample_build("b");
        let cancel = CancelToken::new();
        cache.store(&fp_a, &manifest_a, &layers_a, &cancel).unwrap();
        cache.store(&fp_b, &manifest_b, &layers_b, &cancel).unwrap();

        // Both builds share the first layer.
        let status = cache.status().unwrap();
        assert_eq!(status.index_entries, 2);
        assert_eq!(status.blobs, 7);
        assert_eq!(status.unreferenced_blobs, 0);

        cache.invalidate(&fp_b).unwrap();
        let kept = cache.gc(Duration::from_secs(3600)).unwrap();
        assert_eq!(kept.removed_blobs, 0);
        assert_eq!(kept.kept_recent, 3);

        let report = cache.gc(Duration::ZERO).unwrap();
        assert_eq!(report.removed_blobs, 3);
        assert!(report.freed_bytes > 0);

        let Lookup::Hit(entry) = cache.lookup(&fp_a).unwrap() else {
            panic!("expected hit");
        };
        cache.load_image(&entry).unwrap();
    }

    #[test]
    fn test_sweep_staging() {
        let (_temp, cache) = open();
        fs::create_dir_all(cache.tmp_dir().join("abandoned/nested")).unwrap();
        fs::write(cache.tmp_dir().join("abandoned/nested/blob"), b"x").unwrap();

        assert_eq!(cache.sweep_staging(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(cache.status().unwrap().staging_dirs, 1);
        assert_eq!(cache.sweep_staging(Duration::ZERO).unwrap(), 1);
        assert_eq!(cache.status().unwrap().staging_dirs, 0);
    }

    #[test]
    fn test_reused_blobs_restart_grace_period() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");
        let cancel = CancelToken::new();

        cache.store(&fp, &manifest, &layers, &cancel).unwrap();
        cache.invalidate(&fp).unwrap();
        age_blobs(&cache, 2 * HOUR);
        assert!(blob_age(&cache, &layers[0].digest) > HOUR);

        // Every blob is already on disk; the store only re-publishes.
        assert_eq!(
            cache.store(&fp, &manifest, &layers, &cancel).unwrap(),
            StoreOutcome::Published
        );
        for digest in [&manifest.digest, &manifest.config_digest, &layers[0].digest] {
            assert!(blob_age(&cache, digest) < HOUR);
        }

        // Even unreferenced again, the fresh mtimes keep them past gc.
        cache.invalidate(&fp).unwrap();
        let report = cache.gc(HOUR).unwrap();
        assert_eq!(report.removed_blobs, 0);
        assert_eq!(report.kept_recent, 4);
    }

    #[test]
    fn test_gc_racing_blob_reuse_never_breaks_entries() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("reuse");
        let done = AtomicBool::new(false);

        thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    cache.gc(HOUR).unwrap();
                    thread::sleep(Duration::from_millis(5));
                }
            });
            let cancel = CancelToken::new();
            for _ in 0..50 {
                cache.store(&fp, &manifest, &layers, &cancel).unwrap();
                let Lookup::Hit(entry) = cache.lookup(&fp).unwrap() else {
                    panic!("expected hit after store");
                };
                cache.load_image(&entry).unwrap();
                cache.invalidate(&fp).unwrap();
                age_blobs(&cache, 2 * HOUR);
            }
            done.store(true, Ordering::SeqCst);
        });
    }

    #[test]
    fn test_lookups_during_concurrent_stores_never_fail() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("readers");
        let writers_done = AtomicBool::new(false);

        thread::scope(|scope| {
            let readers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        let mut hits = 0u32;
                        loop {
                            let finished = writers_done.load(Ordering::SeqCst);
                            match cache.lookup(&fp) {
                                Ok(Lookup::Hit(entry)) => {
                                    cache.load_image(&entry).unwrap();
                                    hits += 1;
                                }
                                Ok(Lookup::Miss) => {}
                                Err(e) => panic!("lookup during store failed: {e}"),
                            }
                            if finished {
                                return hits;
                            }
                        }
                    })
                })
                .collect();

            let writers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        cache
                            .store(&fp, &manifest, &layers, &CancelToken::new())
                            .unwrap()
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            writers_done.store(true, Ordering::SeqCst);
            for reader in readers {
                assert!(reader.join().unwrap() >= 1);
            }
        });
    }

    #[test]
    fn test_interrupted_store_is_a_miss_until_recovered() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");

        // State after a crash between moving blobs and publishing the index.
        let attempt = cache.tmp_dir().join("interrupted");
        fs::create_dir_all(&attempt).unwrap();
        let entry = CacheEntry::new(&fp, &manifest, &layers, now_rfc3339()).unwrap();
        fs::write(attempt.join("index.json"), serde_json::to_vec_pretty(&entry).unwrap()).unwrap();
        let blobs = [
            (&manifest.digest, &manifest.bytes),
            (&manifest.config_digest, &manifest.config_bytes),
        ]
        .into_iter()
        .chain(layers.iter().map(|l| (&l.digest, &l.blob)));
        for (digest, bytes) in blobs {
            let dest = cache.blob_path(digest);
            fs::create_dir_all(dest.parent().unwrap()).unwrap();
            fs::write(dest, bytes).unwrap();
        }

        assert_eq!(cache.lookup(&fp).unwrap(), Lookup::Miss);
        let status = cache.status().unwrap();
        assert_eq!(status.index_entries, 0);
        assert_eq!(status.staging_dirs, 1);
        assert_eq!(status.unreferenced_blobs, 4);

        assert_eq!(cache.sweep_staging(Duration::ZERO).unwrap(), 1);
        assert_eq!(cache.lookup(&fp).unwrap(), Lookup::Miss);
        assert_eq!(cache.gc(Duration::ZERO).unwrap().removed_blobs, 4);

        assert_eq!(
            cache.store(&fp, &manifest, &layers, &CancelToken::new()).unwrap(),
            StoreOutcome::Published
        );
        let Lookup::Hit(entry) = cache.lookup(&fp).unwrap() else {
            panic!("expected hit");
        };
        cache.load_image(&entry).unwrap();
    }

    #[test]
    fn test_gc_prunes_idle_lock_files() {
        let (_temp, cache) = open();
        let (fp_idle, _, _) = sample_build("idle");
        let (fp_held, _, _) = sample_build("held");

        drop(cache.claim(&fp_idle, Duration::ZERO).unwrap());
        let Claim::Acquired(held) = cache.claim(&fp_held, Duration::ZERO).unwrap() else {
            panic!("expected claim");
        };

        assert_eq!(cache.gc(HOUR).unwrap().removed_locks, 0);
        assert_eq!(cache.gc(Duration::ZERO).unwrap().removed_locks, 1);
        assert!(!cache.lock_path(&fp_idle).exists());
        assert!(cache.lock_path(&fp_held).exists());

        // The surviving claim still excludes others, and a pruned path
        // can be claimed again.
        assert!(matches!(
            cache.claim(&fp_held, Duration::ZERO).unwrap(),
            Claim::Busy
        ));
        drop(held);
        assert!(matches!(
            cache.claim(&fp_idle, Duration::ZERO).unwrap(),
            Claim::Acquired(_)
        ));
    }

    #[test]
    fn test_index_sync_failure_after_publish_is_not_an_error() {
        let (_temp, cache) = open();
        let (fp, manifest, layers) = sample_build("a");

        // Linking into the directory still works; opening it to fsync does
        // not (unless running as root).
        let index_dir = cache.index_dir();
        fs::set_permissions(&index_dir, fs::Permissions::from_mode(0o300)).unwrap();
        let outcome = cache.store(&fp, &manifest, &layers, &CancelToken::new());
        fs::set_permissions(&index_dir, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(outcome.unwrap(), StoreOutcome::Published);
        assert!(matches!(cache.lookup(&fp).unwrap(), Lookup::Hit(_)));
    }
}
