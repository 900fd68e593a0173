//! Cache keys.
//!
//! A fingerprint is the digest of a versioned JSON document listing every
//! input that can change the produced manifest. Callers own the derivation;
//! caches only ever compare fingerprints.

use crate::context::Ownership;
use crate::digest::{Digest, DigestParseError};
use crate::error::BuilderError;
use crate::layer::LayerOptions;
use crate::manifest::{ImageSpec, Manifest, Platform};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bump when layer or manifest bytes change for identical inputs.
pub const FINGERPRINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Digest);

/// Everything that determines a build's output.
#[derive(Debug, Clone)]
pub struct FingerprintInputs<'a> {
    /// Context digests in layer declaration order.
    pub contexts: &'a [Digest],
    pub layer: LayerOptions,
    pub owner: Ownership,
    pub image: &'a ImageSpec,
    pub base: Option<&'a Manifest>,
}

#[derive(Serialize)]
struct Canonical<'a> {
    version: u32,
    contexts: &'a [Digest],
    layer: LayerOptions,
    owner: Ownership,
    image: &'a ImageSpec,
    platform: Platform,
    base: Option<&'a Digest>,
}

impl Fingerprint {
    pub fn compute(inputs: &FingerprintInputs<'_>) -> Result<Self, BuilderError> {
        let canonical = Canonical {
            version: FINGERPRINT_VERSION,
            contexts: inputs.contexts,
            layer: inputs.layer,
            owner: inputs.owner,
            image: inputs.image,
            platform: inputs.image.platform(inputs.base.map(|b| &b.config))?,
            base: inputs.base.map(|b| &b.digest),
        };
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(Self(Digest::of(&bytes)))
    }

    pub fn parse(value: &str) -> Result<Self, DigestParseError> {
        Digest::parse(value).map(Self)
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }

    /// Bare hex, used for file names.
    pub fn hex(&self) -> &str {
        self.0.hex()
    }

    pub fn short(&self) -> &str {
        self.0.short()
    }
}

impl From<Digest> for Fingerprint {
    fn from(digest: Digest) -> Self {
        Self(digest)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Fingerprint {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, FileEntry};
    use crate::layer::{Compression, LayerBuilder};
    use crate::manifest::build_manifest;

    fn digests() -> Vec<Digest> {
        vec![Digest::of(b"ctx-a"), Digest::of(b"ctx-b")]
    }

    fn compute(
        contexts: &[Digest],
        layer: LayerOptions,
        owner: Ownership,
        image: &ImageSpec,
        base: Option<&Manifest>,
    ) -> Fingerprint {
        Fingerprint::compute(&FingerprintInputs {
            contexts,
            layer,
            owner,
            image,
            base,
        })
        .unwrap()
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let image = ImageSpec::default();
        let a = compute(&digests(), LayerOptions::default(), Ownership::default(), &image, None);
        let b = compute(&digests(), LayerOptions::default(), Ownership::default(), &image, None);
        assert_eq!(a, b);
        assert_eq!(Fingerprint::parse(&a.to_string()).unwrap(), a);
    }

    #[test]
    fn test_fingerprint_sensitive_to_every_input() {
        let image = ImageSpec::default();
        let base_fp = compute(&digests(), LayerOptions::default(), Ownership::default(), &image, None);

        let mut reordered = digests();
        reordered.reverse();
        let zstd = LayerOptions {
            compression: Compression::Zstd,
            level: None,
        };
        let leveled = LayerOptions {
            level: Some(9),
            ..LayerOptions::default()
        };
        let owner = Ownership { uid: 1, gid: 1 };
        let with_cmd = ImageSpec {
            cmd: vec!["run".to_string()],
            ..ImageSpec::default()
        };
        let other_arch = ImageSpec {
            architecture: Some("riscv64".to_string()),
            ..ImageSpec::default()
        };

        let variants = [
            compute(&reordered, LayerOptions::default(), Ownership::default(), &image, None),
            compute(&digests()[..1], LayerOptions::default(), Ownership::default(), &image, None),
            compute(&digests(), zstd, Ownership::default(), &image, None),
            compute(&digests(), leveled, Ownership::default(), &image, None),
            compute(&digests(), LayerOptions::default(), owner, &image, None),
            compute(&digests(), LayerOptions::default(), Ownership::default(), &with_cmd, None),
            compute(&digests(), LayerOptions::default(), Ownership::default(), &other_arch, None),
        ];
        for variant in &variants {
            assert_ne!(*variant, base_fp);
        }
    }

    #[test]
    fn test_fingerprint_covers_base_image() {
        let ctx = Context::from_entries(vec![FileEntry::file("/etc/os", 0o644, b"base".to_vec())])
            .unwrap();
        let layer = LayerBuilder::default().build_layer(&ctx).unwrap();
        let base = build_manifest(&[layer], &ImageSpec::default(), None).unwrap();

        let image = ImageSpec {
            base_image: Some("base".to_string()),
            ..ImageSpec::default()
        };
        let without = compute(&digests(), LayerOptions::default(), Ownership::default(), &image, None);
        let with = compute(
            &digests(),
            LayerOptions::default(),
            Ownership::default(),
            &image,
            Some(&base),
        );
        assert_ne!(without, with);
    }
}
