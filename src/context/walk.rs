//! Filesystem traversal into unsorted [`FileEntry`] values.

use super::{Content, EntryKind, FileEntry, MODE_MASK};
use crate::digest::sha256_reader;
use crate::error::ContextError;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Owner written into every entry, replacing the build host's ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Glob patterns relative to the root. `*` stays within one component.
    pub exclude: Vec<String>,
    pub owner: Ownership,
}

pub(super) fn walk(root: &Path, options: &WalkOptions) -> Result<Vec<FileEntry>, ContextError> {
    let md = fs::metadata(root).map_err(|source| ContextError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    })?;
    if !md.is_dir() {
        return Err(ContextError::RootNotDirectory(root.to_path_buf()));
    }

    let excludes = compile_excludes(&options.exclude)?;
    let mut entries = Vec::new();
    let mut pruned = 0usize;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|ent| {
            let skip = ent
                .path()
                .strip_prefix(root)
                .ok()
                .and_then(Path::to_str)
                .is_some_and(|rel| excludes.is_match(rel));
            if skip {
                pruned += 1;
            }
            !skip
        });

    for ent in walker {
        let ent = ent.map_err(|e| walk_error(root, e))?;
        let path = ent.path();
        let rel = path
            .strip_prefix(root)
            .ok()
            .and_then(Path::to_str)
            .ok_or_else(|| ContextError::NonUtf8Path(path.to_path_buf()))?;

        let md = fs::symlink_metadata(path).map_err(|e| ContextError::from_io(path, e))?;
        let file_type = md.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| ContextError::from_io(path, e))?;
            let target = target
                .to_str()
                .ok_or_else(|| ContextError::NonUtf8Path(path.to_path_buf()))?;
            EntryKind::Symlink {
                target: target.to_string(),
            }
        } else if file_type.is_file() {
            let file = File::open(path).map_err(|e| ContextError::from_io(path, e))?;
            let (digest, size) = sha256_reader(file).map_err(|e| ContextError::from_io(path, e))?;
            EntryKind::File {
                size,
                digest,
                content: Content::Path(path.to_path_buf()),
            }
        } else {
            return Err(ContextError::UnsupportedEntry {
                path: path.to_path_buf(),
                kind: special_kind(&file_type),
            });
        };

        entries.push(FileEntry {
            path: format!("/{rel}"),
            mode: md.permissions().mode() & MODE_MASK,
            uid: options.owner.uid,
            gid: options.owner.gid,
            kind,
        });
    }

    debug!(
        root = %root.display(),
        entries = entries.len(),
        pruned,
        "walked context"
    );
    Ok(entries)
}

fn compile_excludes(patterns: &[String]) -> Result<GlobSet, ContextError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let trimmed = pattern.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(ContextError::InvalidPattern {
                pattern: pattern.clone(),
                reason: "pattern is empty".to_string(),
            });
        }
        let glob = GlobBuilder::new(trimmed)
            .literal_separator(true)
            .build()
            .map_err(|e| ContextError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.kind().to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| ContextError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: e.to_string(),
    })
}

fn walk_error(root: &Path, err: walkdir::Error) -> ContextError {
    let depth = err.depth();
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("filesystem loop detected"));
    if depth == 0 {
        ContextError::RootUnreadable { path, source }
    } else {
        ContextError::from_io(path, source)
    }
}

fn special_kind(file_type: &fs::FileType) -> &'static str {
    if file_type.is_block_device() {
        "block device"
    } else if file_type.is_char_device() {
        "character device"
    } else if file_type.is_fifo() {
        "FIFO"
    } else if file_type.is_socket() {
        "socket"
    } else {
        "unknown file type"
    }
}
