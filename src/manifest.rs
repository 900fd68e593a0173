//! OCI image config and manifest assembly.
//!
//! Serialization is canonical: struct fields serialize in declaration order,
//! every map is a `BTreeMap`, and output is compact JSON. Nothing time- or
//! host-dependent is emitted unless the [`ImageSpec`] asks for it.

use crate::digest::Digest;
use crate::error::BuilderError;
use crate::layer::Layer;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Reference to a blob by media type, digest and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default = "default_manifest_media_type")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

fn default_manifest_media_type() -> String {
    MEDIA_TYPE_MANIFEST.to_string()
}

/// Serializes as `{}`; used for the values of `ExposedPorts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Execution parameters carried in the image config (`config` key).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub env: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub entrypoint: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<Digest>,
}

/// OCI image configuration blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: RuntimeConfig,
    pub rootfs: RootFs,
}

/// Registries emit `null` for empty lists and maps.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Image-level build inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSpec {
    /// Defaults to the base image's, else the host's (`amd64`, `arm64`, ...).
    pub architecture: Option<String>,
    /// Defaults to the base image's, else `linux`.
    pub os: Option<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// `port[/tcp|udp|sctp]`.
    pub exposed_ports: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// RFC 3339. Omitted from the config unless set.
    pub created: Option<String>,
    /// Permit an image with no layers at all.
    pub scratch: bool,
    /// Reference of the image whose layers go beneath this build's.
    pub base_image: Option<String>,
}

/// Resolved `architecture`/`os` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl ImageSpec {
    /// Resolve the platform against an optional base image.
    ///
    /// An explicit value that disagrees with the base image is rejected.
    pub fn platform(&self, base: Option<&ImageConfig>) -> Result<Platform, BuilderError> {
        Ok(Platform {
            architecture: resolve_field(
                "architecture",
                &self.architecture,
                base.map(|c| &c.architecture),
                host_architecture().to_string(),
            )?,
            os: resolve_field("os", &self.os, base.map(|c| &c.os), "linux".to_string())?,
        })
    }

    /// Check every free-form field for the shape the config format needs.
    pub fn validate(&self) -> Result<(), BuilderError> {
        if let Some(created) = &self.created {
            OffsetDateTime::parse(created, &Rfc3339).map_err(|e| {
                BuilderError::InvalidSpec(format!("created '{created}' is not RFC 3339: {e}"))
            })?;
        }
        for entry in &self.env {
            env_key(entry)?;
        }
        for port in &self.exposed_ports {
            normalize_port(port)?;
        }
        if self.scratch && self.base_image.is_some() {
            return Err(BuilderError::InvalidSpec(
                "a scratch image cannot have a base image".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_field(
    field: &str,
    explicit: &Option<String>,
    inherited: Option<&String>,
    fallback: String,
) -> Result<String, BuilderError> {
    match (explicit, inherited) {
        (Some(a), Some(b)) if a != b => Err(BuilderError::InvalidSpec(format!(
            "{field} '{a}' does not match base image {field} '{b}'"
        ))),
        (Some(a), _) => Ok(a.clone()),
        (None, Some(b)) => Ok(b.clone()),
        (None, None) => Ok(fallback),
    }
}

/// OCI architecture name of the build host.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

fn env_key(entry: &str) -> Result<&str, BuilderError> {
    match entry.split_once('=') {
        Some((key, _)) if !key.is_empty() => Ok(key),
        _ => Err(BuilderError::InvalidSpec(format!(
            "env entry '{entry}' must have the form KEY=VALUE"
        ))),
    }
}

/// `80` → `80/tcp`; protocol must be tcp, udp or sctp.
fn normalize_port(port: &str) -> Result<String, BuilderError> {
    let invalid = || BuilderError::InvalidSpec(format!("invalid exposed port '{port}'"));
    let (number, proto) = port.split_once('/').unwrap_or((port, "tcp"));
    let number: u16 = number.parse().map_err(|_| invalid())?;
    if number == 0 || !matches!(proto, "tcp" | "udp" | "sctp") {
        return Err(invalid());
    }
    Ok(format!("{number}/{proto}"))
}

/// An assembled image: parsed documents plus their exact serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub document: ImageManifest,
    pub config: ImageConfig,
    pub bytes: Vec<u8>,
    pub digest: Digest,
    pub config_bytes: Vec<u8>,
    pub config_digest: Digest,
}

impl Manifest {
    /// Parse stored manifest and config blobs, keeping their exact bytes.
    pub fn from_parts(bytes: Vec<u8>, config_bytes: Vec<u8>) -> Result<Self, serde_json::Error> {
        let document: ImageManifest = serde_json::from_slice(&bytes)?;
        let config: ImageConfig = serde_json::from_slice(&config_bytes)?;
        Ok(Self {
            digest: Digest::of(&bytes),
            config_digest: Digest::of(&config_bytes),
            document,
            config,
            bytes,
            config_bytes,
        })
    }

    /// Structural consistency between the manifest, its config and the layers.
    pub fn verify(&self) -> Result<(), String> {
        let config_ref = &self.document.config;
        if config_ref.digest != self.config_digest {
            return Err(format!(
                "config descriptor {} does not match config blob {}",
                config_ref.digest, self.config_digest
            ));
        }
        if config_ref.size != self.config_bytes.len() as u64 {
            return Err(format!(
                "config descriptor size {} does not match blob size {}",
                config_ref.size,
                self.config_bytes.len()
            ));
        }
        if self.document.layers.len() != self.config.rootfs.diff_ids.len() {
            return Err(format!(
                "manifest lists {} layers but config lists {} diff-ids",
                self.document.layers.len(),
                self.config.rootfs.diff_ids.len()
            ));
        }
        Ok(())
    }

    pub fn layer_digests(&self) -> Vec<Digest> {
        self.document
            .layers
            .iter()
            .map(|d| d.digest.clone())
            .collect()
    }

    pub fn diff_ids(&self) -> &[Digest] {
        &self.config.rootfs.diff_ids
    }
}

/// Assemble config and manifest for `layers`, stacked on an optional base.
pub fn build_manifest(
    layers: &[Layer],
    spec: &ImageSpec,
    base: Option<&Manifest>,
) -> Result<Manifest, BuilderError> {
    spec.validate()?;
    let base_layers = base.map_or(0, |b| b.document.layers.len());
    if layers.is_empty() && base_layers == 0 && !spec.scratch {
        return Err(BuilderError::EmptyLayerSet);
    }

    let platform = spec.platform(base.map(|b| &b.config))?;
    let runtime = merge_runtime_config(base.map(|b| &b.config.config), spec)?;

    let mut diff_ids = Vec::with_capacity(base_layers + layers.len());
    let mut descriptors = Vec::with_capacity(base_layers + layers.len());
    if let Some(base) = base {
        diff_ids.extend(base.config.rootfs.diff_ids.iter().cloned());
        descriptors.extend(base.document.layers.iter().cloned());
    }
    for layer in layers {
        diff_ids.push(layer.diff_id.clone());
        descriptors.push(layer.descriptor());
    }

    let config = ImageConfig {
        created: spec.created.clone(),
        architecture: platform.architecture,
        os: platform.os,
        config: runtime,
        rootfs: RootFs {
            kind: "layers".to_string(),
            diff_ids,
        },
    };
    let config_bytes = serde_json::to_vec(&config)?;
    let config_digest = Digest::of(&config_bytes);

    let document = ImageManifest {
        schema_version: 2,
        media_type: MEDIA_TYPE_MANIFEST.to_string(),
        config: Descriptor::new(
            MEDIA_TYPE_CONFIG,
            config_digest.clone(),
            config_bytes.len() as u64,
        ),
        layers: descriptors,
        annotations: BTreeMap::new(),
    };
    let bytes = serde_json::to_vec(&document)?;
    let digest = Digest::of(&bytes);

    debug!(
        manifest = %digest.short(),
        config = %config_digest.short(),
        layers = document.layers.len(),
        "assembled manifest"
    );

    Ok(Manifest {
        document,
        config,
        bytes,
        digest,
        config_bytes,
        config_digest,
    })
}

/// Apply the image spec over the base image's runtime config.
///
/// Env merges by key, labels and ports merge, lists and scalars replace when
/// set. A new entrypoint without a new cmd clears the inherited cmd.
fn merge_runtime_config(
    base: Option<&RuntimeConfig>,
    spec: &ImageSpec,
) -> Result<RuntimeConfig, BuilderError> {
    let mut rc = base.cloned().unwrap_or_default();

    for entry in &spec.env {
        let key = env_key(entry)?;
        let existing = rc
            .env
            .iter_mut()
            .find(|e| e.split_once('=').map(|(k, _)| k) == Some(key));
        match existing {
            Some(slot) => *slot = entry.clone(),
            None => rc.env.push(entry.clone()),
        }
    }

    if !spec.entrypoint.is_empty() {
        rc.entrypoint = spec.entrypoint.clone();
        if spec.cmd.is_empty() {
            rc.cmd.clear();
        }
    }
    if !spec.cmd.is_empty() {
        rc.cmd = spec.cmd.clone();
    }
    if spec.working_dir.is_some() {
        rc.working_dir = spec.working_dir.clone();
    }
    if spec.user.is_some() {
        rc.user = spec.user.clone();
    }
    for port in &spec.exposed_ports {
        rc.exposed_ports.insert(normalize_port(port)?, EmptyObject {});
    }
    rc.labels
        .extend(spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(rc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, FileEntry};
    use crate::layer::LayerBuilder;

    fn layer(name: &str, content: &[u8]) -> Layer {
        let ctx = Context::from_entries(vec![FileEntry::file(name, 0o644, content.to_vec())])
            .unwrap();
        LayerBuilder::default().build_layer(&ctx).unwrap()
    }

    fn spec() -> ImageSpec {
        ImageSpec {
            architecture: Some("amd64".to_string()),
            entrypoint: vec!["/app/bin".to_string()],
            env: vec!["PATH=/usr/bin".to_string()],
            exposed_ports: vec!["8080".to_string()],
            labels: BTreeMap::from([("app".to_string(), "demo".to_string())]),
            ..ImageSpec::default()
        }
    }

    #[test]
    fn test_manifest_is_canonical_and_stable() {
        let layers = vec![layer("/a", b"a"), layer("/b", b"b")];
        let m1 = build_manifest(&layers, &spec(), None).unwrap();
        let m2 = build_manifest(&layers, &spec(), None).unwrap();
        assert_eq!(m1.bytes, m2.bytes);
        assert_eq!(m1.digest, Digest::of(&m1.bytes));
        assert_eq!(m1.config_digest, Digest::of(&m1.config_bytes));
        m1.verify().unwrap();

        let json = String::from_utf8(m1.bytes.clone()).unwrap();
        assert!(json.starts_with(r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"#));
        assert!(!json.contains('\n'));

        let config = String::from_utf8(m1.config_bytes.clone()).unwrap();
        assert!(!config.contains("created"));
        assert!(config.contains(r#""ExposedPorts":{"8080/tcp":{}}"#));
        assert!(config.contains(r#""rootfs":{"type":"layers","diff_ids":["sha256:"#));
    }

    #[test]
    fn test_manifest_digest_tracks_order_and_config() {
        let (a, b) = (layer("/a", b"a"), layer("/b", b"b"));
        let ab = build_manifest(&[a.clone(), b.clone()], &spec(), None).unwrap();
        let ba = build_manifest(&[b.clone(), a.clone()], &spec(), None).unwrap();
        assert_ne!(ab.digest, ba.digest);
        assert_eq!(ab.layer_digests(), vec![a.digest.clone(), b.digest.clone()]);
        assert_eq!(ab.diff_ids(), &[a.diff_id.clone(), b.diff_id.clone()]);

        let mut changed = spec();
        changed.cmd = vec!["--verbose".to_string()];
        let other = build_manifest(&[a, b], &changed, None).unwrap();
        assert_ne!(other.digest, ab.digest);
    }

    #[test]
    fn test_empty_layer_set_requires_scratch() {
        assert!(matches!(
            build_manifest(&[], &spec(), None),
            Err(BuilderError::EmptyLayerSet)
        ));

        let scratch = ImageSpec {
            scratch: true,
            ..spec()
        };
        let m = build_manifest(&[], &scratch, None).unwrap();
        assert!(m.document.layers.is_empty());
        assert!(m.config.rootfs.diff_ids.is_empty());
    }

    #[test]
    fn test_invalid_spec_fields() {
        let cases = [
            ImageSpec {
                created: Some("yesterday".to_string()),
                ..spec()
            },
            ImageSpec {
                env: vec!["NOVALUE".to_string()],
                ..spec()
            },
            ImageSpec {
                env: vec!["=x".to_string()],
                ..spec()
            },
            ImageSpec {
                exposed_ports: vec!["http".to_string()],
                ..spec()
            },
            ImageSpec {
                exposed_ports: vec!["53/icmp".to_string()],
                ..spec()
            },
            ImageSpec {
                scratch: true,
                base_image: Some("alpine".to_string()),
                ..spec()
            },
        ];
        for case in cases {
            assert!(
                matches!(
                    build_manifest(&[layer("/a", b"a")], &case, None),
                    Err(BuilderError::InvalidSpec(_))
                ),
                "accepted {case:?}"
            );
        }
    }

    #[test]
    fn test_created_is_emitted_when_set() {
        let with_created = ImageSpec {
            created: Some("2024-01-01T00:00:00Z".to_string()),
            ..spec()
        };
        let m = build_manifest(&[layer("/a", b"a")], &with_created, None).unwrap();
        assert_eq!(m.config.created.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_base_image_layers_come_first() {
        let base_spec = ImageSpec {
            architecture: Some("arm64".to_string()),
            env: vec!["PATH=/bin".to_string(), "LANG=C".to_string()],
            cmd: vec!["sh".to_string()],
            ..ImageSpec::default()
        };
        let base_layer = layer("/etc/os-release", b"base");
        let base = build_manifest(&[base_layer.clone()], &base_spec, None).unwrap();

        let app = ImageSpec {
            architecture: None,
            env: vec!["PATH=/app:/bin".to_string(), "MODE=prod".to_string()],
            entrypoint: vec!["/app/bin".to_string()],
            base_image: Some("base:1".to_string()),
            ..ImageSpec::default()
        };
        let app_layer = layer("/app/bin", b"app");
        let m = build_manifest(&[app_layer.clone()], &app, Some(&base)).unwrap();

        assert_eq!(m.layer_digests(), vec![base_layer.digest, app_layer.digest]);
        assert_eq!(m.diff_ids(), &[base_layer.diff_id, app_layer.diff_id]);
        assert_eq!(m.config.architecture, "arm64");
        assert_eq!(m.config.config.env, ["PATH=/app:/bin", "LANG=C", "MODE=prod"]);
        assert_eq!(m.config.config.entrypoint, ["/app/bin"]);
        assert!(m.config.config.cmd.is_empty());

        let mismatch = ImageSpec {
            architecture: Some("amd64".to_string()),
            ..app
        };
        assert!(matches!(
            build_manifest(&[], &mismatch, Some(&base)),
            Err(BuilderError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_from_parts_tolerates_registry_nulls() {
        let config = br#"{"architecture":"amd64","os":"linux","config":{"Env":null,"Cmd":null,"Labels":null},"rootfs":{"type":"layers","diff_ids":[]},"history":[]}"#.to_vec();
        let config_digest = Digest::of(&config);
        let manifest = format!(
            r#"{{"schemaVersion":2,"config":{{"mediaType":"{MEDIA_TYPE_CONFIG}","digest":"{config_digest}","size":{}}},"layers":[]}}"#,
            config.len()
        );
        let m = Manifest::from_parts(manifest.into_bytes(), config).unwrap();
        assert_eq!(m.document.media_type, MEDIA_TYPE_MANIFEST);
        assert!(m.config.config.env.is_empty());
        m.verify().unwrap();
    }

    #[test]
    fn test_verify_detects_mismatched_config() {
        let mut m = build_manifest(&[layer("/a", b"a")], &spec(), None).unwrap();
        m.config_bytes.push(b' ');
        m.config_digest = Digest::of(&m.config_bytes);
        assert!(m.verify().is_err());
    }
}
