//! [`RegistryClient`] over an OCI image-layout directory.
//!
//! ```text
//! <root>/oci-layout          {"imageLayoutVersion":"1.0.0"}
//! <root>/index.json          tagged manifest descriptors
//! <root>/blobs/sha256/<hex>
//! ```

use super::{BaseImage, ImageRef, RegistryClient};
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::fsutil::{atomic_rename, write_synced};
use crate::layer::Layer;
use crate::manifest::{Descriptor, Manifest, MEDIA_TYPE_MANIFEST};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    schema_version: u32,
    #[serde(default = "default_index_media_type")]
    media_type: String,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

fn default_index_media_type() -> String {
    MEDIA_TYPE_INDEX.to_string()
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: default_index_media_type(),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker<'a> {
    image_layout_version: &'a str,
}

#[derive(Debug, Clone)]
pub struct OciLayoutClient {
    root: PathBuf,
}

impl OciLayoutClient {
    /// Open (creating if needed) a layout directory.
    pub fn open(root: &Path) -> Result<Self, RegistryError> {
        let client = Self {
            root: root.to_path_buf(),
        };
        let blobs = client.blobs_dir();
        fs::create_dir_all(&blobs)
            .map_err(|e| RegistryError::io(format!("creating {}", blobs.display()), e))?;

        let marker = root.join("oci-layout");
        if !marker.exists() {
            let bytes = serde_json::to_vec(&LayoutMarker {
                image_layout_version: LAYOUT_VERSION,
            })?;
            client.write_atomic(&marker, &bytes)?;
        }
        Ok(client)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.hex())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
        let tmp = self
            .root
            .join(format!(".tmp-{}", Uuid::new_v4().simple()));
        let result = write_synced(&tmp, bytes).and_then(|()| atomic_rename(&tmp, dest));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result.map_err(|e| RegistryError::io(format!("writing {}", dest.display()), e))
    }

    fn put_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<bool, RegistryError> {
        let dest = self.blob_path(digest);
        if dest.is_file() {
            return Ok(false);
        }
        self.write_atomic(&dest, bytes)?;
        Ok(true)
    }

    fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
        let path = self.blob_path(digest);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                RegistryError::MissingBlob(digest.clone())
            } else {
                RegistryError::io(format!("reading {}", path.display()), e)
            }
        })?;
        let actual = Digest::of(&bytes);
        if actual != *digest {
            return Err(RegistryError::Corrupt(format!(
                "blob {digest} has content {actual}"
            )));
        }
        Ok(bytes)
    }

    fn read_index(&self) -> Result<ImageIndex, RegistryError> {
        let path = self.index_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                RegistryError::Corrupt(format!("unreadable {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ImageIndex::default()),
            Err(e) => Err(RegistryError::io(format!("reading {}", path.display()), e)),
        }
    }

    /// Serialize index updates between processes.
    fn lock_index(&self) -> Result<File, RegistryError> {
        let path = self.root.join("index.lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| RegistryError::io(format!("opening {}", path.display()), e))?;
        file.lock_exclusive()
            .map_err(|e| RegistryError::io(format!("locking {}", path.display()), e))?;
        Ok(file)
    }

    /// Tagged names currently in the index, sorted.
    pub fn tags(&self) -> Result<Vec<String>, RegistryError> {
        let mut tags: Vec<String> = self
            .read_index()?
            .manifests
            .into_iter()
            .filter_map(|d| d.annotations.get(ANNOTATION_REF_NAME).cloned())
            .collect();
        tags.sort();
        Ok(tags)
    }
}

impl RegistryClient for OciLayoutClient {
    fn push(
        &self,
        image: &ImageRef,
        manifest: &Manifest,
        layers: &[Layer],
    ) -> Result<Digest, RegistryError> {
        let mut written = 0usize;
        for layer in layers {
            written += usize::from(self.put_blob(&layer.digest, &layer.blob)?);
        }
        for desc in &manifest.document.layers {
            if !self.blob_path(&desc.digest).is_file() {
                return Err(RegistryError::MissingBlob(desc.digest.clone()));
            }
        }
        written += usize::from(self.put_blob(&manifest.config_digest, &manifest.config_bytes)?);
        written += usize::from(self.put_blob(&manifest.digest, &manifest.bytes)?);

        let name = image.tagged_name();
        let mut descriptor = Descriptor::new(
            MEDIA_TYPE_MANIFEST,
            manifest.digest.clone(),
            manifest.bytes.len() as u64,
        );
        descriptor
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), name.clone());

        let lock = self.lock_index()?;
        let mut index = self.read_index()?;
        index
            .manifests
            .retain(|d| d.annotations.get(ANNOTATION_REF_NAME) != Some(&name));
        index.manifests.push(descriptor);
        index.manifests.sort_by(|a, b| {
            let key = |d: &Descriptor| d.annotations.get(ANNOTATION_REF_NAME).cloned();
            key(a).cmp(&key(b)).then_with(|| a.digest.cmp(&b.digest))
        });
        let bytes = serde_json::to_vec(&index)?;
        self.write_atomic(&self.index_path(), &bytes)?;
        drop(lock);

        info!(
            image = %name,
            manifest = %manifest.digest.short(),
            new_blobs = written,
            "pushed image to OCI layout"
        );
        Ok(manifest.digest.clone())
    }

    fn pull(&self, image: &ImageRef) -> Result<BaseImage, RegistryError> {
        let index = self.read_index()?;
        let name = image.tagged_name();
        let found = index.manifests.iter().find(|d| match &image.digest {
            Some(digest) => d.digest == *digest,
            None => d.annotations.get(ANNOTATION_REF_NAME) == Some(&name),
        });
        let Some(desc) = found else {
            return Err(RegistryError::NotFound(image.to_string()));
        };

        let manifest_bytes = self.read_blob(&desc.digest)?;
        let document: crate::manifest::ImageManifest = serde_json::from_slice(&manifest_bytes)?;
        let config_bytes = self.read_blob(&document.config.digest)?;
        let manifest = Manifest::from_parts(manifest_bytes, config_bytes)?;
        manifest.verify().map_err(RegistryError::Corrupt)?;

        debug!(image = %name, manifest = %manifest.digest.short(), "pulled image from OCI layout");
        Ok(BaseImage {
            reference: image.clone(),
            manifest,
        })
    }
}
