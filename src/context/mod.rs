//! Build contexts: the normalized, ordered file set packaged into one layer.
//!
//! A [`Context`] is produced either by walking a directory ([`Context::build`])
//! or declaratively from in-memory entries ([`Context::from_entries`]). Both
//! paths end in the same invariant: entries are sorted by path bytes, paths
//! are unique, and metadata carries no build-host noise (no timestamps,
//! configured ownership, permission bits only).

mod walk;

pub use walk::{Ownership, WalkOptions};

use crate::digest::Digest;
use crate::error::ContextError;
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bumped whenever the context digest serialization changes.
const CONTEXT_DIGEST_VERSION: &[u8] = b"image-builder/context/v2\n";

/// Permission bits kept from the source mode (rwx + setuid/setgid/sticky).
pub const MODE_MASK: u32 = 0o7777;

/// Mode a runtime gives a missing parent directory while extracting a layer.
/// Parents are created owned by root.
pub const IMPLICIT_DIR_MODE: u32 = 0o755;

/// Where a regular file's bytes come from when the layer is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Read lazily from disk and re-verified against the recorded digest.
    Path(PathBuf),
    /// Held in memory.
    Bytes(Arc<[u8]>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File {
        size: u64,
        digest: Digest,
        content: Content,
    },
    /// Target string exactly as stored in the link; never dereferenced.
    Symlink { target: String },
    /// Omitted only when extraction would recreate it identically: a
    /// root-owned 0755 directory with packaged descendants.
    Directory,
}

/// One packaged path with normalized metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute in-image path, e.g. `/app/bin`.
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub kind: EntryKind,
}

impl FileEntry {
    /// Regular file with in-memory content, owned by root.
    pub fn file(path: impl Into<String>, mode: u32, content: impl Into<Vec<u8>>) -> Self {
        let bytes: Arc<[u8]> = Arc::from(content.into());
        Self {
            path: path.into(),
            mode: mode & MODE_MASK,
            uid: 0,
            gid: 0,
            kind: EntryKind::File {
                size: bytes.len() as u64,
                digest: Digest::of(&bytes),
                content: Content::Bytes(bytes),
            },
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: 0o777,
            uid: 0,
            gid: 0,
            kind: EntryKind::Symlink {
                target: target.into(),
            },
        }
    }

    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            mode: mode & MODE_MASK,
            uid: 0,
            gid: 0,
            kind: EntryKind::Directory,
        }
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Path as written into the tar stream (no leading `/`).
    pub fn archive_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            EntryKind::File { size, .. } => *size,
            _ => 0,
        }
    }
}

/// Immutable, ordered set of entries for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    entries: Vec<FileEntry>,
}

impl Context {
    /// Walk `root`, skipping paths matched by `exclusions`.
    pub fn build(root: &Path, exclusions: &[String]) -> Result<Self, ContextError> {
        let options = WalkOptions {
            exclude: exclusions.to_vec(),
            ..WalkOptions::default()
        };
        Self::build_with(root, &options)
    }

    /// Walk `root` with explicit ownership normalization.
    pub fn build_with(root: &Path, options: &WalkOptions) -> Result<Self, ContextError> {
        let entries = walk::walk(root, options)?;
        Self::from_entries(entries)
    }

    /// Build from declared entries, in any order.
    pub fn from_entries(entries: Vec<FileEntry>) -> Result<Self, ContextError> {
        let mut entries = entries
            .into_iter()
            .map(|mut entry| {
                entry.path = normalize_path(&entry.path)?;
                entry.mode &= MODE_MASK;
                Ok(entry)
            })
            .collect::<Result<Vec<_>, ContextError>>()?;

        entries.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));
        if let Some(dup) = entries.windows(2).find(|w| w[0].path == w[1].path) {
            return Err(ContextError::DuplicatePath(dup[0].path.clone()));
        }
        elide_implicit_directories(&mut entries);

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of regular file sizes.
    pub fn content_size(&self) -> u64 {
        self.entries.iter().map(FileEntry::size).sum()
    }

    /// Digest over every entry's path, metadata and content digest.
    ///
    /// Fields are length-prefixed so no two distinct entry lists share a
    /// serialization. Raw content never enters this hash, only its digest.
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(CONTEXT_DIGEST_VERSION);
        hasher.update((self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            update_str(&mut hasher, &entry.path);
            hasher.update(entry.mode.to_le_bytes());
            hasher.update(entry.uid.to_le_bytes());
            hasher.update(entry.gid.to_le_bytes());
            match &entry.kind {
                EntryKind::File { size, digest, .. } => {
                    hasher.update(b"f");
                    hasher.update(size.to_le_bytes());
                    update_str(&mut hasher, digest.hex());
                }
                EntryKind::Symlink { target } => {
                    hasher.update(b"l");
                    update_str(&mut hasher, target);
                }
                EntryKind::Directory => hasher.update(b"d"),
            }
        }
        Digest::from_hasher(hasher)
    }
}

fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Canonical absolute form: leading `/`, single separators, no `.`/`..`.
pub(crate) fn normalize_path(raw: &str) -> Result<String, ContextError> {
    let invalid = |reason| ContextError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    if raw.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }

    let mut parts = Vec::new();
    for part in raw.split('/') {
        match part {
            "" => continue,
            "." | ".." => return Err(invalid("contains a '.' or '..' component")),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(invalid("refers to the image root"));
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Drop directory entries that a child's extraction would create anyway.
///
/// Missing parents come back as root-owned [`IMPLICIT_DIR_MODE`]
/// directories, so only those are redundant. Empty directories and any
/// directory with another mode or owner stay in the context.
pub(crate) fn elide_implicit_directories(entries: &mut Vec<FileEntry>) {
    let mut ancestors: HashSet<String> = HashSet::new();
    for entry in entries.iter() {
        let mut path = entry.path.as_str();
        while let Some(idx) = path.rfind('/') {
            path = &path[..idx];
            if path.is_empty() || !ancestors.insert(path.to_string()) {
                break;
            }
        }
    }
    entries.retain(|e| !(is_implicit_directory(e) && ancestors.contains(&e.path)));
}

fn is_implicit_directory(entry: &FileEntry) -> bool {
    matches!(entry.kind, EntryKind::Directory)
        && entry.mode == IMPLICIT_DIR_MODE
        && entry.uid == 0
        && entry.gid == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<FileEntry> {
        vec![
            FileEntry::file("/app/data", 0o644, Vec::new()),
            FileEntry::symlink("/app/current", "bin"),
            FileEntry::file("/app/bin", 0o755, b"0123456789".to_vec()),
            FileEntry::directory("/var/empty", 0o755),
        ]
    }

    #[test]
    fn test_from_entries_sorts_by_path() {
        let ctx = Context::from_entries(sample()).unwrap();
        let paths: Vec<_> = ctx.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["/app/bin", "/app/current", "/app/data", "/var/empty"]);
        assert_eq!(ctx.content_size(), 10);
    }

    #[test]
    fn test_digest_independent_of_declaration_order() {
        let mut reversed = sample();
        reversed.reverse();
        let a = Context::from_entries(sample()).unwrap();
        let b = Context::from_entries(reversed).unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_sensitive_to_metadata() {
        let base = Context::from_entries(sample()).unwrap().digest();

        let mut mode = sample();
        mode[2].mode = 0o700;
        assert_ne!(Context::from_entries(mode).unwrap().digest(), base);

        let mut owner = sample();
        owner[0] = owner[0].clone().with_owner(1000, 1000);
        assert_ne!(Context::from_entries(owner).unwrap().digest(), base);

        let mut content = sample();
        content[2] = FileEntry::file("/app/bin", 0o755, b"9876543210".to_vec());
        assert_ne!(Context::from_entries(content).unwrap().digest(), base);

        let mut target = sample();
        target[1] = FileEntry::symlink("/app/current", "data");
        assert_ne!(Context::from_entries(target).unwrap().digest(), base);
    }

    #[test]
    fn test_digest_distinguishes_field_boundaries() {
        let a = Context::from_entries(vec![FileEntry::symlink("/ab", "c")]).unwrap();
        let b = Context::from_entries(vec![FileEntry::symlink("/a", "bc")]).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_paths_are_normalized() {
        let ctx = Context::from_entries(vec![FileEntry::file("app//bin/", 0o100755, Vec::new())])
            .unwrap();
        assert_eq!(ctx.entries()[0].path, "/app/bin");
        assert_eq!(ctx.entries()[0].archive_path(), "app/bin");
        assert_eq!(ctx.entries()[0].mode, 0o755);
    }

    #[test]
    fn test_invalid_paths_rejected() {
        for bad in ["/", "", "/app/../etc", "/./x", "/a\0b"] {
            let result = Context::from_entries(vec![FileEntry::file(bad, 0o644, Vec::new())]);
            assert!(
                matches!(result, Err(ContextError::InvalidPath { .. })),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let result = Context::from_entries(vec![
            FileEntry::file("/app/bin", 0o755, Vec::new()),
            FileEntry::file("app/bin", 0o644, Vec::new()),
        ]);
        assert!(matches!(result, Err(ContextError::DuplicatePath(p)) if p == "/app/bin"));
    }

    #[test]
    fn test_only_implicit_parent_directories_are_elided() {
        let mut entries = vec![
            FileEntry::directory("/a", 0o755),
            FileEntry::file("/a/x", 0o644, Vec::new()),
            FileEntry::directory("/a-b", 0o755),
            FileEntry::directory("/c", 0o755),
            FileEntry::directory("/c/d", 0o755),
            FileEntry::directory("/tmp", 0o1777),
            FileEntry::file("/tmp/.keep", 0o644, Vec::new()),
            FileEntry::directory("/home", 0o755).with_owner(1000, 1000),
            FileEntry::file("/home/.profile", 0o644, Vec::new()),
        ];
        elide_implicit_directories(&mut entries);
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            ["/a/x", "/a-b", "/c/d", "/tmp", "/tmp/.keep", "/home", "/home/.profile"]
        );
    }

    #[test]
    fn test_parent_directory_mode_changes_digest() {
        let with_dir = |mode| {
            Context::from_entries(vec![
                FileEntry::directory("/tmp", mode),
                FileEntry::file("/tmp/.keep", 0o644, Vec::new()),
            ])
            .unwrap()
        };
        let implicit =
            Context::from_entries(vec![FileEntry::file("/tmp/.keep", 0o644, Vec::new())]).unwrap();

        let sticky = with_dir(0o1777);
        let private = with_dir(0o700);
        assert_eq!(sticky.len(), 2);
        assert_eq!(sticky.entries()[0].mode, 0o1777);
        assert_ne!(sticky.digest(), private.digest());
        assert_ne!(sticky.digest(), implicit.digest());

        // A root-owned 0755 parent is exactly what extraction creates.
        assert_eq!(with_dir(0o755).digest(), implicit.digest());
    }
}
