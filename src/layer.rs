//! Layer serialization: Context → deterministic tar → compressed blob.
//!
//! The tar stream carries no build-host noise: GNU headers, mtime 0, empty
//! user/group names and the entry's normalized uid/gid/mode. The uncompressed
//! stream is hashed on the fly (diff-id) and the finished blob is hashed
//! again (digest).

use crate::cancel::CancelToken;
use crate::context::{Content, Context, EntryKind, FileEntry};
use crate::digest::{Digest, HashingReader, HashingWriter};
use crate::error::{BuilderError, ContextError};
use crate::manifest::Descriptor;
use flate2::write::GzEncoder;
use flate2::GzBuilder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use tar::{EntryType, Header};
use tracing::{debug, info};

pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

const DEFAULT_GZIP_LEVEL: u32 = 6;
const DEFAULT_ZSTD_LEVEL: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    pub fn media_type(self) -> &'static str {
        match self {
            Self::None => MEDIA_TYPE_LAYER_TAR,
            Self::Gzip => MEDIA_TYPE_LAYER_GZIP,
            Self::Zstd => MEDIA_TYPE_LAYER_ZSTD,
        }
    }
}

/// Options that change layer bytes, and therefore participate in fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerOptions {
    pub compression: Compression,
    pub level: Option<u32>,
}

impl LayerOptions {
    /// Resolved compression level, validated against the codec's range.
    pub fn effective_level(&self) -> Result<u32, BuilderError> {
        let (default, range) = match self.compression {
            Compression::None => return Ok(0),
            Compression::Gzip => (DEFAULT_GZIP_LEVEL, 0..=9),
            Compression::Zstd => (DEFAULT_ZSTD_LEVEL, 1..=19),
        };
        let level = self.level.unwrap_or(default);
        if !range.contains(&level) {
            return Err(BuilderError::InvalidSpec(format!(
                "{:?} compression level {} is outside {}..={}",
                self.compression,
                level,
                range.start(),
                range.end()
            )));
        }
        Ok(level)
    }
}

/// One finished layer. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub blob: Vec<u8>,
    /// sha256 of `blob`.
    pub digest: Digest,
    /// sha256 of the uncompressed tar stream.
    pub diff_id: Digest,
    pub media_type: String,
}

impl Layer {
    /// Rebuild from stored bytes; the digest is recomputed from `blob`.
    pub fn from_parts(blob: Vec<u8>, diff_id: Digest, media_type: impl Into<String>) -> Self {
        Self {
            digest: Digest::of(&blob),
            blob,
            diff_id,
            media_type: media_type.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(&self.media_type, self.digest.clone(), self.size())
    }
}

enum Encoder {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl Encoder {
    fn new(compression: Compression, level: u32) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => Self::Plain(Vec::new()),
            Compression::Gzip => Self::Gzip(
                GzBuilder::new()
                    .mtime(0)
                    .write(Vec::new(), flate2::Compression::new(level)),
            ),
            Compression::Zstd => Self::Zstd(zstd::stream::write::Encoder::new(
                Vec::new(),
                level as i32,
            )?),
        })
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Plain(buf) => Ok(buf),
            Self::Gzip(enc) => enc.finish(),
            Self::Zstd(enc) => enc.finish(),
        }
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
        }
    }
}

/// Serializes contexts into layers.
#[derive(Debug, Clone, Default)]
pub struct LayerBuilder {
    options: LayerOptions,
    cancel: CancelToken,
    max_workers: Option<usize>,
}

impl LayerBuilder {
    pub fn new(options: LayerOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Upper bound on concurrent layer workers (default: available cores).
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers.max(1));
        self
    }

    pub fn options(&self) -> LayerOptions {
        self.options
    }

    pub fn build_layer(&self, ctx: &Context) -> Result<Layer, BuilderError> {
        self.write_layer(ctx, None)
    }

    /// Build one layer per context concurrently; output follows input order.
    ///
    /// The first failure stops the remaining workers and is returned; no
    /// partial set of layers escapes.
    pub fn build_layers(&self, contexts: &[Context]) -> Result<Vec<Layer>, BuilderError> {
        if contexts.len() <= 1 {
            return contexts.iter().map(|ctx| self.build_layer(ctx)).collect();
        }

        let workers = self
            .max_workers
            .or_else(|| thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .min(contexts.len());
        let abort = CancelToken::new();
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();

        info!(layers = contexts.len(), workers, "building layers");

        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let tx = tx.clone();
                    let (abort, next) = (&abort, &next);
                    scope.spawn(move || loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(ctx) = contexts.get(index) else {
                            break;
                        };
                        let result = self.write_layer(ctx, Some(abort));
                        if result.is_err() {
                            abort.cancel();
                        }
                        if tx.send((index, result)).is_err() {
                            break;
                        }
                    })
                })
                .collect();
            drop(tx);
            // A panicked worker leaves a gap in the results instead of unwinding here.
            for handle in handles {
                if handle.join().is_err() {
                    abort.cancel();
                }
            }
        });

        collect_in_order(contexts.len(), rx.into_iter().collect())
    }

    fn write_layer(
        &self,
        ctx: &Context,
        abort: Option<&CancelToken>,
    ) -> Result<Layer, BuilderError> {
        let level = self.options.effective_level()?;
        let compression = self.options.compression;
        let encoder =
            Encoder::new(compression, level).map_err(|source| BuilderError::Archive {
                path: String::from("<encoder>"),
                source,
            })?;
        let mut tar = tar::Builder::new(HashingWriter::new(encoder));

        for entry in ctx.entries() {
            if self.cancel.is_cancelled() || abort.is_some_and(CancelToken::is_cancelled) {
                return Err(BuilderError::Cancelled);
            }
            append_entry(&mut tar, entry)?;
        }

        let finish_err = |source| BuilderError::Archive {
            path: String::from("<end of archive>"),
            source,
        };
        let hashing = tar.into_inner().map_err(finish_err)?;
        let (encoder, diff_id, tar_size) = hashing.finish();
        let blob = encoder.finish().map_err(finish_err)?;
        let layer = Layer {
            digest: Digest::of(&blob),
            blob,
            diff_id,
            media_type: compression.media_type().to_string(),
        };

        debug!(
            digest = %layer.digest.short(),
            diff_id = %layer.diff_id.short(),
            entries = ctx.len(),
            tar_size,
            blob_size = layer.size(),
            "built layer"
        );
        Ok(layer)
    }
}

fn append_entry<W: Write>(tar: &mut tar::Builder<W>, entry: &FileEntry) -> Result<(), BuilderError> {
    let path = entry.archive_path();
    let archive_err = |source| BuilderError::Archive {
        path: entry.path.clone(),
        source,
    };

    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(u64::from(entry.uid));
    header.set_gid(u64::from(entry.gid));
    header.set_mode(entry.mode);

    match &entry.kind {
        EntryKind::Directory => {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            tar.append_data(&mut header, path, io::empty())
                .map_err(archive_err)
        }
        EntryKind::Symlink { target } => {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            tar.append_link(&mut header, path, target)
                .map_err(archive_err)
        }
        EntryKind::File {
            size,
            digest,
            content,
        } => {
            header.set_entry_type(EntryType::Regular);
            header.set_size(*size);
            match content {
                Content::Bytes(bytes) => tar
                    .append_data(&mut header, path, &bytes[..])
                    .map_err(archive_err),
                Content::Path(src) => {
                    let file = File::open(src)
                        .map_err(|e| BuilderError::Context(ContextError::from_io(src, e)))?;
                    let mut reader = HashingReader::new(file.take(*size));
                    tar.append_data(&mut header, path, &mut reader)
                        .map_err(archive_err)?;
                    let (actual, read) = reader.finish();
                    if actual != *digest || read != *size {
                        return Err(BuilderError::ContentChanged {
                            path: entry.path.clone(),
                            expected: digest.clone(),
                            actual,
                        });
                    }
                    Ok(())
                }
            }
        }
    }
}

/// Re-sort worker results into declaration order.
///
/// The first real failure in declaration order wins over `Cancelled` results
/// from siblings that were stopped because of it. A missing index means its
/// worker panicked.
fn collect_in_order(
    count: usize,
    mut results: Vec<(usize, Result<Layer, BuilderError>)>,
) -> Result<Vec<Layer>, BuilderError> {
    results.sort_by_key(|(index, _)| *index);

    let mut layers = Vec::with_capacity(count);
    let mut cancelled = false;
    let mut failure = None;
    let mut expected = 0usize;
    for (index, result) in results {
        if index != expected && failure.is_none() {
            failure = Some(BuilderError::WorkerPanicked(expected));
        }
        expected = index + 1;
        match result {
            Ok(layer) => layers.push(layer),
            Err(BuilderError::Cancelled) => cancelled = true,
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    if expected != count && failure.is_none() {
        failure = Some(BuilderError::WorkerPanicked(expected));
    }

    if let Some(err) = failure {
        return Err(err);
    }
    if cancelled {
        return Err(BuilderError::Cancelled);
    }
    Ok(layers)
}
