//! Build configuration and its TOML file form.
//!
//! ```toml
//! [build]
//! context = "rootfs"          # first layer, relative to this file
//! exclude = ["*.log", "tmp"]
//! cache_dir = ".cache"        # default: <user cache dir>/image-builder
//! image_ref = "example.com/app:1.0"
//! push = false
//! oci_layout = "out/layout"   # registry used for base images and push
//!
//! [[layers]]                  # further layers, stacked in order
//! path = "config"
//!
//! [layer]
//! compression = "gzip"        # gzip | zstd | none
//! uid = 0
//! gid = 0
//!
//! [image]
//! entrypoint = ["/app/bin"]
//! env = ["MODE=prod"]
//! ```

use crate::context::Ownership;
use crate::layer::{Compression, LayerOptions};
use crate::manifest::ImageSpec;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory name under the user cache dir used when `cache_dir` is unset.
pub const DEFAULT_CACHE_SUBDIR: &str = "image-builder";

/// One directory packaged as one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSource {
    pub path: PathBuf,
    pub exclude: Vec<String>,
}

/// Everything one build invocation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Root of the first layer.
    pub context_path: PathBuf,
    pub exclude: Vec<String>,
    /// Additional layers above the first, in order.
    pub layers: Vec<LayerSource>,
    pub cache_dir: Option<PathBuf>,
    pub image_ref: Option<String>,
    pub push: bool,
    pub layer: LayerOptions,
    pub owner: Ownership,
    pub image: ImageSpec,
}

impl BuildConfig {
    pub fn new(context_path: impl Into<PathBuf>) -> Self {
        Self {
            context_path: context_path.into(),
            exclude: Vec::new(),
            layers: Vec::new(),
            cache_dir: None,
            image_ref: None,
            push: false,
            layer: LayerOptions::default(),
            owner: Ownership::default(),
            image: ImageSpec::default(),
        }
    }

    /// Layer roots in stacking order, the primary context first.
    pub fn layer_sources(&self) -> Vec<LayerSource> {
        let primary = LayerSource {
            path: self.context_path.clone(),
            exclude: self.exclude.clone(),
        };
        std::iter::once(primary)
            .chain(self.layers.iter().cloned())
            .collect()
    }
}

/// A parsed config file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub build: BuildConfig,
    /// OCI layout directory acting as the registry, if configured.
    pub oci_layout: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    build: BuildToml,
    #[serde(default)]
    layers: Vec<LayerSourceToml>,
    #[serde(default)]
    layer: LayerToml,
    #[serde(default)]
    image: ImageSpec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    context: PathBuf,
    #[serde(default)]
    exclude: Vec<String>,
    cache_dir: Option<PathBuf>,
    image_ref: Option<String>,
    #[serde(default)]
    push: bool,
    oci_layout: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerSourceToml {
    path: PathBuf,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LayerToml {
    compression: Compression,
    level: Option<u32>,
    uid: u32,
    gid: u32,
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading build config '{}'", path.display()))?;
    parse_config(&text, path)
}

/// Parse config text; relative paths resolve against `path`'s directory.
pub fn parse_config(text: &str, path: &Path) -> Result<LoadedConfig> {
    let parsed: ConfigToml = toml::from_str(text)
        .with_context(|| format!("parsing build config '{}'", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let resolve = |p: &Path| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            base_dir.join(p)
        }
    };

    if parsed.build.context.as_os_str().is_empty() {
        bail!(
            "invalid build config '{}': build.context must not be empty",
            path.display()
        );
    }
    if parsed.build.push && parsed.build.image_ref.is_none() {
        bail!(
            "invalid build config '{}': push = true requires build.image_ref",
            path.display()
        );
    }

    let layer = LayerOptions {
        compression: parsed.layer.compression,
        level: parsed.layer.level,
    };
    layer
        .effective_level()
        .with_context(|| format!("invalid [layer] in '{}'", path.display()))?;
    parsed
        .image
        .validate()
        .with_context(|| format!("invalid [image] in '{}'", path.display()))?;

    let cache_dir = match parsed.build.cache_dir {
        Some(dir) => Some(resolve(&dir)),
        None => dirs::cache_dir().map(|d| d.join(DEFAULT_CACHE_SUBDIR)),
    };

    let build = BuildConfig {
        context_path: resolve(&parsed.build.context),
        exclude: parsed.build.exclude,
        layers: parsed
            .layers
            .into_iter()
            .map(|l| LayerSource {
                path: resolve(&l.path),
                exclude: l.exclude,
            })
            .collect(),
        cache_dir,
        image_ref: parsed.build.image_ref,
        push: parsed.build.push,
        layer,
        owner: Ownership {
            uid: parsed.layer.uid,
            gid: parsed.layer.gid,
        },
        image: parsed.image,
    };

    Ok(LoadedConfig {
        build,
        oci_layout: parsed.build.oci_layout.map(|p| resolve(&p)),
    })
}
