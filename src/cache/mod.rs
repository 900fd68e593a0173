//! Build cache: fingerprint → previously produced image.
//!
//! Two stores share one contract:
//!
//! - [`DiskCache`]: content-addressed blobs plus one JSON index file per
//!   fingerprint, safe to share between processes
//! - [`MemoryCache`]: isolated in-process store, mostly for tests and
//!   embedding
//!
//! An entry becomes visible only after every blob it references is durably
//! written, and is never modified afterwards. Concurrent stores for the same
//! fingerprint are harmless: the first publish wins and later ones report
//! [`StoreOutcome::AlreadyPresent`].

mod disk;
mod memory;

pub use disk::{DiskCache, GcReport, StoreStatus};
pub use memory::MemoryCache;

use crate::cancel::CancelToken;
use crate::digest::Digest;
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::layer::Layer;
use crate::manifest::Manifest;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Interval between claim attempts while waiting.
pub(crate) const CLAIM_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub digest: Digest,
    pub diff_id: Digest,
    pub size: u64,
    pub media_type: String,
}

/// Index record for one cached build.
///
/// `layers` lists only the layers this build produced; base image layers are
/// referenced by the manifest but owned by the registry they came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub manifest_digest: Digest,
    pub config_digest: Digest,
    pub layers: Vec<LayerRecord>,
    pub stored_at: String,
}

impl CacheEntry {
    /// Build the record for `manifest`, checking that `layers` are exactly
    /// the trailing layers it references, in order.
    pub fn new(
        fingerprint: &Fingerprint,
        manifest: &Manifest,
        layers: &[Layer],
        stored_at: String,
    ) -> Result<Self, CacheError> {
        let referenced = &manifest.document.layers;
        let diff_ids = manifest.diff_ids();
        if layers.len() > referenced.len() || referenced.len() != diff_ids.len() {
            return Err(CacheError::Inconsistent(format!(
                "manifest {} references {} layers, {} supplied",
                manifest.digest,
                referenced.len(),
                layers.len()
            )));
        }

        let offset = referenced.len() - layers.len();
        for (i, layer) in layers.iter().enumerate() {
            let desc = &referenced[offset + i];
            if desc.digest != layer.digest || diff_ids[offset + i] != layer.diff_id {
                return Err(CacheError::Inconsistent(format!(
                    "layer {} is not at position {} of manifest {}",
                    layer.digest,
                    offset + i,
                    manifest.digest
                )));
            }
        }

        Ok(Self {
            fingerprint: fingerprint.clone(),
            manifest_digest: manifest.digest.clone(),
            config_digest: manifest.config_digest.clone(),
            layers: layers
                .iter()
                .map(|l| LayerRecord {
                    digest: l.digest.clone(),
                    diff_id: l.diff_id.clone(),
                    size: l.size(),
                    media_type: l.media_type.clone(),
                })
                .collect(),
            stored_at,
        })
    }

    /// Every blob this entry needs: manifest, config, then layers.
    pub fn blob_digests(&self) -> impl Iterator<Item = &Digest> {
        [&self.manifest_digest, &self.config_digest]
            .into_iter()
            .chain(self.layers.iter().map(|l| &l.digest))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Published,
    AlreadyPresent,
}

/// A cache hit read back with every digest verified.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub manifest: Manifest,
    pub layers: Vec<Layer>,
}

/// Result of [`CacheStore::claim`].
#[derive(Debug)]
pub enum Claim {
    Acquired(ClaimGuard),
    /// Someone else held the claim for the whole wait.
    Busy,
}

/// Held while building a fingerprint; released on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    inner: ClaimInner,
}

#[derive(Debug)]
enum ClaimInner {
    File(File),
    Memory {
        claims: Arc<Mutex<HashSet<Fingerprint>>>,
        fingerprint: Fingerprint,
    },
}

impl ClaimGuard {
    pub(crate) fn file(file: File) -> Self {
        Self {
            inner: ClaimInner::File(file),
        }
    }

    pub(crate) fn memory(claims: Arc<Mutex<HashSet<Fingerprint>>>, fingerprint: Fingerprint) -> Self {
        Self {
            inner: ClaimInner::Memory {
                claims,
                fingerprint,
            },
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        match &self.inner {
            ClaimInner::File(file) => {
                let _ = file.unlock();
            }
            ClaimInner::Memory {
                claims,
                fingerprint,
            } => {
                let mut claims = claims.lock().unwrap_or_else(|e| e.into_inner());
                claims.remove(fingerprint);
            }
        }
    }
}

/// Storage for completed builds, keyed by fingerprint.
///
/// Passed by reference to whatever needs it; there is no global instance.
pub trait CacheStore: Send + Sync {
    /// Read-only. Never observes a partially written entry.
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Lookup, CacheError>;

    /// Persist a finished build. Nothing becomes visible unless every blob
    /// was written; cancellation is honored up to the publish step.
    fn store(
        &self,
        fingerprint: &Fingerprint,
        manifest: &Manifest,
        layers: &[Layer],
        cancel: &CancelToken,
    ) -> Result<StoreOutcome, CacheError>;

    /// Remove an entry. Returns whether one existed.
    fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError>;

    /// Read back manifest and layers for a hit, verifying every digest.
    fn load_image(&self, entry: &CacheEntry) -> Result<CachedImage, CacheError>;

    /// Advisory per-fingerprint build claim with a bounded wait.
    fn claim(&self, fingerprint: &Fingerprint, wait: Duration) -> Result<Claim, CacheError>;
}

/// Rebuild and verify a cached image from a blob reader.
pub(crate) fn assemble_image(
    entry: &CacheEntry,
    mut read_blob: impl FnMut(&Digest) -> Result<Vec<u8>, CacheError>,
) -> Result<CachedImage, CacheError> {
    let key = &entry.fingerprint;
    let mut verified = |digest: &Digest| -> Result<Vec<u8>, CacheError> {
        let bytes = read_blob(digest)?;
        let actual = Digest::of(&bytes);
        if actual != *digest {
            return Err(CacheError::corrupt(
                key,
                format!("blob {digest} has content {actual}"),
            ));
        }
        Ok(bytes)
    };

    let manifest_bytes = verified(&entry.manifest_digest)?;
    let config_bytes = verified(&entry.config_digest)?;
    let manifest = Manifest::from_parts(manifest_bytes, config_bytes)
        .map_err(|e| CacheError::corrupt(key, format!("unreadable manifest: {e}")))?;
    manifest
        .verify()
        .map_err(|reason| CacheError::corrupt(key, reason))?;

    let mut layers = Vec::with_capacity(entry.layers.len());
    for record in &entry.layers {
        let blob = verified(&record.digest)?;
        layers.push(Layer::from_parts(
            blob,
            record.diff_id.clone(),
            record.media_type.clone(),
        ));
    }

    let offset = manifest.document.layers.len().checked_sub(layers.len());
    let consistent = offset.is_some_and(|offset| {
        layers
            .iter()
            .zip(&manifest.document.layers[offset..])
            .all(|(layer, desc)| layer.digest == desc.digest && layer.size() == desc.size)
    });
    if !consistent {
        return Err(CacheError::corrupt(
            key,
            "layer records do not match the manifest",
        ));
    }

    Ok(CachedImage { manifest, layers })
}


#[cfg(test)]
mod tests {
    use super::test_support::sample_build;
    use super::*;

    #[test]
    fn test_entry_requires_trailing_manifest_layers() {
        let (fp, manifest, layers) = sample_build("a");
        let entry = CacheEntry::new(&fp, &manifest, &layers, String::new()).unwrap();
        assert_eq!(entry.blob_digests().count(), 4);

        // Only the newest layer: still the manifest's tail.
        assert!(CacheEntry::new(&fp, &manifest, &layers[1..], String::new()).is_ok());

        let reversed: Vec<_> = layers.iter().rev().cloned().collect();
        assert!(matches!(
            CacheEntry::new(&fp, &manifest, &reversed, String::new()),
            Err(CacheError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_assemble_image_detects_tampered_blob() {
        let (fp, manifest, layers) = sample_build("a");
        let entry = CacheEntry::new(&fp, &manifest, &layers, String::new()).unwrap();
        let lookup = |d: &Digest| -> Vec<u8> {
            if *d == manifest.digest {
                manifest.bytes.clone()
            } else if *d == manifest.config_digest {
                manifest.config_bytes.clone()
            } else {
                layers.iter().find(|l| l.digest == *d).unwrap().blob.clone()
            }
        };

        let image = assemble_image(&entry, |d| Ok(lookup(d))).unwrap();
        assert_eq!(image.manifest, manifest);
        assert_eq!(image.layers, layers);

        let result = assemble_image(&entry, |d| {
            let mut bytes = lookup(d);
            if *d == layers[1].digest {
                bytes.push(0);
            }
            Ok(bytes)
        });
        assert!(matches!(result, Err(e) if e.is_corruption()));
    }
}
