//! Error types for image builds.
//!
//! Each stage has its own error kind so callers can tell an unusable input
//! (`ContextError`) from a malformed assembly (`BuilderError`) from a storage
//! problem that only costs future build time (`CacheError`).

use crate::digest::Digest;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for a whole build invocation.
pub type BuildResult<T> = Result<T, BuildError>;

/// Failures while turning a filesystem tree into a [`Context`](crate::Context).
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context root {path} is unreadable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("context root is not a directory: {0}")]
    RootNotDirectory(PathBuf),

    #[error("{0} disappeared while the context was being read")]
    Vanished(PathBuf),

    #[error("unsupported entry {path}: {kind} cannot be packaged into a layer")]
    UnsupportedEntry { path: PathBuf, kind: &'static str },

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("invalid context path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("duplicate context path: {0}")]
    DuplicatePath(String),

    #[error("invalid exclusion pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ContextError {
    /// Map an I/O error on `path`, treating `NotFound` as a vanished entry.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::Vanished(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// Failures assembling layers and manifests.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("image has no layers and is not marked as a scratch image")]
    EmptyLayerSet,

    #[error("invalid image spec: {0}")]
    InvalidSpec(String),

    #[error("{path} changed after the context was read (expected {expected}, found {actual})")]
    ContentChanged {
        path: String,
        expected: Digest,
        actual: Digest,
    },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("failed to archive {path}: {source}")]
    Archive {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("build cancelled")]
    Cancelled,

    #[error("layer worker {0} panicked")]
    WorkerPanicked(usize),
}

/// Storage failures in a [`CacheStore`](crate::cache::CacheStore).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("cache entry {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("refusing to cache inconsistent build: {0}")]
    Inconsistent(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache store cancelled before publish")]
    Cancelled,
}

impl CacheError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn corrupt(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Corruption is surfaced to the caller; everything else degrades to a miss.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Failures talking to a registry client.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("blob {0} is not available to the registry")]
    MissingBlob(Digest),

    #[error("registry content is corrupt: {0}")]
    Corrupt(String),

    #[error("registry I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("registry transport error: {0}")]
    Transport(String),
}

impl RegistryError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Everything that can abort a build invocation.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0} requires a registry client")]
    RegistryRequired(&'static str),
}

impl BuildError {
    /// Hint printed by the CLI under the error.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Cache(CacheError::Corrupt { .. }) => {
                Some("Run: image-builder cache invalidate <cache_dir> <fingerprint>")
            }
            Self::Context(ContextError::UnsupportedEntry { .. }) => {
                Some("Exclude the entry with an `exclude` pattern")
            }
            Self::Builder(BuilderError::EmptyLayerSet) => {
                Some("Set `scratch = true` under [image] to build an image without layers")
            }
            _ => None,
        }
    }
}
