//! Registry interface: image references and the push/pull seam.
//!
//! Network transport and authentication live behind [`RegistryClient`];
//! this crate ships [`OciLayoutClient`], which targets an OCI image-layout
//! directory on disk.

mod layout;

pub use layout::OciLayoutClient;

use crate::digest::Digest;
use crate::error::RegistryError;
use crate::layer::Layer;
use crate::manifest::Manifest;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// Parsed `[registry/]repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageRef {
    /// Parse with Docker Hub defaults.
    ///
    /// - `nginx` → `docker.io/library/nginx:latest`
    /// - `org/app:1.2` → `docker.io/org/app:1.2`
    /// - `localhost:5000/app@sha256:…` → no tag, pinned digest
    pub fn parse(reference: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest).map_err(|e| invalid(e.reason))?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // A ':' after the last '/' starts the tag; earlier ones are a port.
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], Some(&name[last_slash + i + 1..])),
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if registry.is_empty() {
            return Err(invalid("empty registry"));
        }
        let component_ok = |c: &str| {
            !c.is_empty()
                && c.bytes()
                    .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-'))
        };
        if !repository.split('/').all(component_ok) {
            return Err(invalid(
                "repository components must be lowercase alphanumerics, '.', '_' or '-'",
            ));
        }

        let tag = match tag {
            Some(tag) => {
                let valid = !tag.is_empty()
                    && tag.len() <= 128
                    && !tag.starts_with(['.', '-'])
                    && tag
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
                if !valid {
                    return Err(invalid("malformed tag"));
                }
                Some(tag.to_string())
            }
            None if digest.is_none() => Some(DEFAULT_TAG.to_string()),
            None => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository[:tag]`, the name recorded in OCI layouts.
    pub fn tagged_name(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}/{}:{}", self.registry, self.repository, tag),
            None => format!("{}/{}", self.registry, self.repository),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tagged_name())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageRef {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An image fetched to build on top of.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub reference: ImageRef,
    pub manifest: Manifest,
}

/// Push/pull seam. Implementations own transport and credentials.
pub trait RegistryClient: Send + Sync {
    /// Upload `layers` plus the manifest's config and manifest blobs.
    ///
    /// Layers referenced by the manifest but not passed in (base image
    /// layers) must already be available to the registry.
    fn push(
        &self,
        image: &ImageRef,
        manifest: &Manifest,
        layers: &[Layer],
    ) -> Result<Digest, RegistryError>;

    fn pull(&self, image: &ImageRef) -> Result<BaseImage, RegistryError>;
}
