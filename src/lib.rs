//! Reproducible OCI image builds from filesystem contexts, with a
//! content-addressed build cache.
//!
//! A build walks one or more directories into [`Context`]s, serializes each
//! into a deterministic tar [`Layer`], assembles an OCI manifest and config,
//! and records the result in a [`CacheStore`] under a [`Fingerprint`] of
//! every input. Identical inputs always produce byte-identical layers and
//! manifests, so a second build with the same fingerprint is a cache hit.
//!
//! # Architecture
//!
//! ```text
//! config ──► Pipeline
//!              │
//!              ├── context   walk + normalize + digest a directory tree
//!              ├── layer     deterministic tar, gzip/zstd, parallel workers
//!              ├── manifest  OCI config + manifest, base image stacking
//!              ├── cache     DiskCache / MemoryCache behind CacheStore
//!              └── registry  RegistryClient seam, OciLayoutClient on disk
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use image_builder::{BuildConfig, DiskCache, Pipeline};
//!
//! let cache = DiskCache::open("/var/cache/image-builder".as_ref())?;
//! let mut config = BuildConfig::new("rootfs");
//! config.image.entrypoint = vec!["/app/bin".into()];
//!
//! let outcome = Pipeline::new().with_cache(&cache).run(&config)?;
//! println!("{} ({:?})", outcome.manifest_digest, outcome.cache);
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod fingerprint;
pub mod fsutil;
pub mod layer;
pub mod manifest;
pub mod pipeline;
pub mod registry;

pub use cache::{CacheEntry, CacheStore, DiskCache, Lookup, MemoryCache, StoreOutcome};
pub use cancel::CancelToken;
pub use config::{load_config, BuildConfig, LayerSource, LoadedConfig};
pub use context::{Context, FileEntry, Ownership};
pub use digest::Digest;
pub use error::{BuildError, BuildResult, BuilderError, CacheError, ContextError, RegistryError};
pub use fingerprint::Fingerprint;
pub use layer::{Compression, Layer, LayerBuilder, LayerOptions};
pub use manifest::{build_manifest, ImageSpec, Manifest};
pub use pipeline::{BuildOutcome, CacheStatus, Pipeline};
pub use registry::{ImageRef, OciLayoutClient, RegistryClient};
