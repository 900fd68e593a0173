//! In-process cache with the same contract as the disk store.

use super::{
    assemble_image, CacheEntry, CacheStore, CachedImage, Claim, ClaimGuard, Lookup, StoreOutcome,
    CLAIM_POLL,
};
use crate::cancel::CancelToken;
use crate::digest::Digest;
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::fsutil::now_rfc3339;
use crate::layer::Layer;
use crate::manifest::Manifest;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    entries: HashMap<Fingerprint, CacheEntry>,
    blobs: HashMap<Digest, Arc<[u8]>>,
}

/// Isolated cache living only as long as the value.
#[derive(Debug, Default)]
pub struct MemoryCache {
    state: Mutex<State>,
    claims: Arc<Mutex<HashSet<Fingerprint>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheStore for MemoryCache {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Lookup, CacheError> {
        let state = self.state();
        let Some(entry) = state.entries.get(fingerprint) else {
            return Ok(Lookup::Miss);
        };
        if let Some(missing) = entry.blob_digests().find(|d| !state.blobs.contains_key(*d)) {
            return Err(CacheError::corrupt(
                fingerprint,
                format!("referenced blob {missing} is missing"),
            ));
        }
        Ok(Lookup::Hit(entry.clone()))
    }

    fn store(
        &self,
        fingerprint: &Fingerprint,
        manifest: &Manifest,
        layers: &[Layer],
        cancel: &CancelToken,
    ) -> Result<StoreOutcome, CacheError> {
        if self.state().entries.contains_key(fingerprint) {
            return Ok(StoreOutcome::AlreadyPresent);
        }
        let entry = CacheEntry::new(fingerprint, manifest, layers, now_rfc3339())?;

        // Copy outside the lock; publish blobs and entry in one critical section.
        let mut staged: Vec<(Digest, Arc<[u8]>)> = Vec::with_capacity(layers.len() + 2);
        staged.push((manifest.digest.clone(), Arc::from(&manifest.bytes[..])));
        staged.push((manifest.config_digest.clone(), Arc::from(&manifest.config_bytes[..])));
        for layer in layers {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            staged.push((layer.digest.clone(), Arc::from(&layer.blob[..])));
        }
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let mut state = self.state();
        if state.entries.contains_key(fingerprint) {
            return Ok(StoreOutcome::AlreadyPresent);
        }
        for (digest, bytes) in staged {
            state.blobs.entry(digest).or_insert(bytes);
        }
        state.entries.insert(fingerprint.clone(), entry);
        Ok(StoreOutcome::Published)
    }

    /// Blobs no longer referenced by any entry are dropped with it.
    fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let mut state = self.state();
        if state.entries.remove(fingerprint).is_none() {
            return Ok(false);
        }
        let State { entries, blobs } = &mut *state;
        let referenced: HashSet<&Digest> = entries.values().flat_map(|e| e.blob_digests()).collect();
        blobs.retain(|digest, _| referenced.contains(digest));
        Ok(true)
    }

    fn load_image(&self, entry: &CacheEntry) -> Result<CachedImage, CacheError> {
        let state = self.state();
        assemble_image(entry, |digest| {
            state
                .blobs
                .get(digest)
                .map(|bytes| bytes.to_vec())
                .ok_or_else(|| {
                    CacheError::corrupt(&entry.fingerprint, format!("blob {digest} is missing"))
                })
        })
    }

    fn claim(&self, fingerprint: &Fingerprint, wait: Duration) -> Result<Claim, CacheError> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
                if claims.insert(fingerprint.clone()) {
                    return Ok(Claim::Acquired(ClaimGuard::memory(
                        Arc::clone(&self.claims),
                        fingerprint.clone(),
                    )));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Claim::Busy);
            }
            thread::sleep(CLAIM_POLL.min(deadline - now));
        }
    }
}
