//! One build invocation, end to end.
//!
//! ```text
//! contexts ─► fingerprint ─► lookup ──hit──────────────────────────► push?
//!                              │
//!                             miss ─► claim ─► re-lookup ─► layers ─► manifest ─► store ─► push?
//! ```
//!
//! The cache and registry are borrowed for the duration of the run. A cache
//! problem never fails an otherwise good build, except for corruption, which
//! is reported so it can be invalidated.

use crate::cache::{CacheEntry, CacheStore, Claim, ClaimGuard, Lookup, StoreOutcome};
use crate::cancel::CancelToken;
use crate::config::{BuildConfig, LayerSource};
use crate::context::{Context, Ownership, WalkOptions};
use crate::digest::Digest;
use crate::error::{BuildError, BuildResult, BuilderError, CacheError};
use crate::fingerprint::{Fingerprint, FingerprintInputs};
use crate::layer::{Layer, LayerBuilder};
use crate::manifest::{build_manifest, Manifest};
use crate::registry::{BaseImage, ImageRef, RegistryClient};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait for another builder of the same fingerprint.
pub const DEFAULT_CLAIM_WAIT: Duration = Duration::from_secs(300);

/// What happened to the build in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stored,
    /// Another builder published the same fingerprint first.
    AlreadyStored,
    /// The build succeeded but could not be cached.
    NotCached(String),
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub fingerprint: Fingerprint,
    pub manifest_digest: Digest,
    /// Layers produced by this build (base image layers excluded), in order.
    pub layer_digests: Vec<Digest>,
    pub cache: CacheStatus,
    /// Manifest digest reported by the registry, when pushed.
    pub pushed: Option<Digest>,
}

/// Orchestrates contexts, cache, builder and registry for one config.
pub struct Pipeline<'a> {
    cache: Option<&'a dyn CacheStore>,
    registry: Option<&'a dyn RegistryClient>,
    cancel: CancelToken,
    claim_wait: Duration,
}

impl Default for Pipeline<'_> {
    fn default() -> Self {
        Self {
            cache: None,
            registry: None,
            cancel: CancelToken::default(),
            claim_wait: DEFAULT_CLAIM_WAIT,
        }
    }
}

impl<'a> Pipeline<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: &'a dyn CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_registry(mut self, registry: &'a dyn RegistryClient) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_claim_wait(mut self, wait: Duration) -> Self {
        self.claim_wait = wait;
        self
    }

    pub fn run(&self, config: &BuildConfig) -> BuildResult<BuildOutcome> {
        config.image.validate()?;
        config.layer.effective_level()?;
        let push_target = self.push_target(config)?;

        let contexts = read_contexts(&config.layer_sources(), config.owner)?;
        self.check_cancelled()?;

        let base = self.pull_base(config)?;
        let base_manifest = base.as_ref().map(|b| &b.manifest);

        let digests: Vec<Digest> = contexts.iter().map(Context::digest).collect();
        let fingerprint = Fingerprint::compute(&FingerprintInputs {
            contexts: &digests,
            layer: config.layer,
            owner: config.owner,
            image: &config.image,
            base: base_manifest,
        })?;
        info!(fingerprint = %fingerprint.short(), layers = contexts.len(), "computed fingerprint");

        let Some(cache) = self.cache else {
            let (manifest, layers) = self.assemble(config, &contexts, base_manifest)?;
            return self.finish(fingerprint, &manifest, &layers, CacheStatus::Disabled, push_target);
        };

        if let Some(entry) = lookup(cache, &fingerprint)? {
            return self.finish_hit(cache, fingerprint, entry, push_target);
        }

        let _claim = self.claim(cache, &fingerprint);
        if let Some(entry) = lookup(cache, &fingerprint)? {
            info!(fingerprint = %fingerprint.short(), "built concurrently by another builder");
            return self.finish_hit(cache, fingerprint, entry, push_target);
        }
        self.check_cancelled()?;

        let (manifest, layers) = self.assemble(config, &contexts, base_manifest)?;
        self.check_cancelled()?;

        let status = match cache.store(&fingerprint, &manifest, &layers, &self.cancel) {
            Ok(StoreOutcome::Published) => CacheStatus::Stored,
            Ok(StoreOutcome::AlreadyPresent) => CacheStatus::AlreadyStored,
            Err(CacheError::Cancelled) => return Err(BuilderError::Cancelled.into()),
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "build not cached");
                CacheStatus::NotCached(e.to_string())
            }
        };
        self.finish(fingerprint, &manifest, &layers, status, push_target)
    }

    /// Parsed push destination, checked before any work starts.
    fn push_target(&self, config: &BuildConfig) -> BuildResult<Option<ImageRef>> {
        if !config.push {
            return Ok(None);
        }
        let Some(reference) = &config.image_ref else {
            return Err(BuilderError::InvalidSpec("push requires an image reference".into()).into());
        };
        if self.registry.is_none() {
            return Err(BuildError::RegistryRequired("push"));
        }
        Ok(Some(ImageRef::parse(reference)?))
    }

    fn pull_base(&self, config: &BuildConfig) -> BuildResult<Option<BaseImage>> {
        let Some(reference) = &config.image.base_image else {
            return Ok(None);
        };
        let registry = self
            .registry
            .ok_or(BuildError::RegistryRequired("base_image"))?;
        let reference = ImageRef::parse(reference)?;
        let base = registry.pull(&reference)?;
        info!(base = %reference, manifest = %base.manifest.digest.short(), "pulled base image");
        Ok(Some(base))
    }

    /// Claim failures only cost duplicate work, so they never fail the build.
    fn claim(&self, cache: &dyn CacheStore, fingerprint: &Fingerprint) -> Option<ClaimGuard> {
        match cache.claim(fingerprint, self.claim_wait) {
            Ok(Claim::Acquired(guard)) => Some(guard),
            Ok(Claim::Busy) => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    wait_secs = self.claim_wait.as_secs(),
                    "another builder still holds the claim; building anyway"
                );
                None
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "could not claim build");
                None
            }
        }
    }

    fn assemble(
        &self,
        config: &BuildConfig,
        contexts: &[Context],
        base: Option<&Manifest>,
    ) -> BuildResult<(Manifest, Vec<Layer>)> {
        let layers = LayerBuilder::new(config.layer)
            .with_cancel(self.cancel.clone())
            .build_layers(contexts)?;
        let manifest = build_manifest(&layers, &config.image, base)?;
        info!(manifest = %manifest.digest.short(), layers = layers.len(), "assembled image");
        Ok((manifest, layers))
    }

    fn finish_hit(
        &self,
        cache: &dyn CacheStore,
        fingerprint: Fingerprint,
        entry: CacheEntry,
        push_target: Option<ImageRef>,
    ) -> BuildResult<BuildOutcome> {
        info!(fingerprint = %fingerprint.short(), manifest = %entry.manifest_digest.short(), "cache hit");
        let pushed = match &push_target {
            Some(target) => {
                let image = cache.load_image(&entry)?;
                Some(self.push(target, &image.manifest, &image.layers)?)
            }
            None => None,
        };
        Ok(BuildOutcome {
            fingerprint,
            manifest_digest: entry.manifest_digest,
            layer_digests: entry.layers.into_iter().map(|l| l.digest).collect(),
            cache: CacheStatus::Hit,
            pushed,
        })
    }

    fn finish(
        &self,
        fingerprint: Fingerprint,
        manifest: &Manifest,
        layers: &[Layer],
        cache: CacheStatus,
        push_target: Option<ImageRef>,
    ) -> BuildResult<BuildOutcome> {
        let pushed = match &push_target {
            Some(target) => Some(self.push(target, manifest, layers)?),
            None => None,
        };
        Ok(BuildOutcome {
            fingerprint,
            manifest_digest: manifest.digest.clone(),
            layer_digests: layers.iter().map(|l| l.digest.clone()).collect(),
            cache,
            pushed,
        })
    }

    fn push(&self, target: &ImageRef, manifest: &Manifest, layers: &[Layer]) -> BuildResult<Digest> {
        let registry = self.registry.ok_or(BuildError::RegistryRequired("push"))?;
        let digest = registry.push(target, manifest, layers)?;
        info!(image = %target, manifest = %digest.short(), "pushed");
        Ok(digest)
    }

    fn check_cancelled(&self) -> BuildResult<()> {
        if self.cancel.is_cancelled() {
            return Err(BuilderError::Cancelled.into());
        }
        Ok(())
    }
}

/// Cache lookup where only corruption is fatal.
fn lookup(cache: &dyn CacheStore, fingerprint: &Fingerprint) -> BuildResult<Option<CacheEntry>> {
    match cache.lookup(fingerprint) {
        Ok(Lookup::Hit(entry)) => Ok(Some(entry)),
        Ok(Lookup::Miss) => Ok(None),
        Err(e) if e.is_corruption() => Err(e.into()),
        Err(e) => {
            warn!(fingerprint = %fingerprint.short(), error = %e, "cache lookup failed; treating as miss");
            Ok(None)
        }
    }
}

/// Walk every layer source on its own scoped thread.
fn read_contexts(sources: &[LayerSource], owner: Ownership) -> BuildResult<Vec<Context>> {
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = sources
            .iter()
            .map(|source| {
                let options = WalkOptions {
                    exclude: source.exclude.clone(),
                    owner,
                };
                scope.spawn(move || Context::build_with(&source.path, &options))
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    let mut contexts = Vec::with_capacity(results.len());
    for (index, result) in results.into_iter().enumerate() {
        let context = result.map_err(|_| BuilderError::WorkerPanicked(index))??;
        debug!(
            path = %sources[index].path.display(),
            entries = context.len(),
            bytes = context.content_size(),
            "read context"
        );
        contexts.push(context);
    }
    Ok(contexts)
}
