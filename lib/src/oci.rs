//! Serde data model for OCI image layouts: index, manifest, image config,
//! and the label keys our commits travel under.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// OCI image index media type.
pub const OCI_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image manifest media type.
pub const OCI_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image config media type.
pub const OCI_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// OCI gzipped layer tarball media type.
pub const OCI_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// Docker schema2 manifest media type.
pub const DOCKER_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema2 manifest list media type.
pub const DOCKER_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker gzipped layer media type.
pub const DOCKER_TYPE_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// The `Accept` value we send when fetching manifests.
pub const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

/// Label naming the ref an image carries.
pub const LABEL_REF: &str = "org.flatpak.ref";
/// Label carrying the raw bytes of the app `/metadata` file.
pub const LABEL_METADATA: &str = "org.flatpak.metadata";
/// Label carrying the installed size as a decimal unsigned integer.
pub const LABEL_INSTALLED_SIZE: &str = "org.flatpak.installed-size";
/// Label carrying the download size as a decimal unsigned integer.
pub const LABEL_DOWNLOAD_SIZE: &str = "org.flatpak.download-size";
/// Prefix for commit metadata keys; values are base64-encoded.
pub const LABEL_COMMIT_METADATA_PREFIX: &str = "org.flatpak.commit-metadata.";
/// Label on an index entry naming the blob holding the image's OpenPGP
/// signature, when the publisher signs.
pub const LABEL_SIGNATURE_DIGEST: &str = "org.flatpak.signature-digest";
/// Appstream XML for the application.
pub const LABEL_APPDATA: &str = "org.freedesktop.appstream.appdata";
/// 64px icon (data: URL or relative URL).
pub const LABEL_ICON_64: &str = "org.freedesktop.appstream.icon-64";
/// 128px icon (data: URL or relative URL).
pub const LABEL_ICON_128: &str = "org.freedesktop.appstream.icon-128";

fn default_schema_version() -> u32 {
    2
}

/// Platform labels on an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Go-style architecture name (`amd64`, `arm64`, ...).
    pub architecture: String,
    /// Operating system, `linux` for us.
    pub os: String,
}

/// A typed reference to a blob: media type, digest, size, optional
/// platform and free-form annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Content media type.
    pub media_type: String,
    /// Content digest.
    pub digest: Digest,
    /// Blob size in bytes.
    pub size: u64,
    /// Platform, present on index entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Free-form labels; keys unique.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Look up an annotation by key.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(|s| s.as_str())
    }
}

/// Top-level object holding an ordered sequence of manifest descriptors.
///
/// Docker manifest lists decode through this same type; we treat them as
/// an index-shaped object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Always 2.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Manifests and manifest lists, in order.
    pub manifests: Vec<Descriptor>,
    /// Free-form labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Index {
    /// Find the descriptor whose ref annotation equals `ref_name`.
    pub fn manifest_for_ref(&self, ref_name: &str) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.annotation(LABEL_REF) == Some(ref_name))
    }

    /// Replace or append the entry for the ref annotated on `desc`.
    pub fn upsert_manifest(&mut self, desc: Descriptor) {
        let key = desc.annotation(LABEL_REF).map(|s| s.to_owned());
        if let Some(key) = key {
            self.manifests
                .retain(|d| d.annotation(LABEL_REF) != Some(key.as_str()));
        }
        self.manifests.push(desc);
    }
}

/// An image manifest: config descriptor plus ordered layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always 2.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// The image config blob.
    pub config: Descriptor,
    /// Layer blobs in apply order.
    pub layers: Vec<Descriptor>,
    /// Free-form labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// `rootfs` member of an image config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Uncompressed layer digests in apply order.
    pub diff_ids: Vec<Digest>,
}

/// One history entry per layer. Note these keys are snake_case on the
/// wire, unlike the manifest types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    /// Free-form description of how the layer was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// The `config` member of an image config; we only carry labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// String labels; this is where our commit metadata travels.
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// An OCI image config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// RFC 3339 creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    /// Go-style architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Labels container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
    /// Layer diff-ids.
    pub rootfs: RootFs,
    /// History, one entry per layer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

impl ImageConfig {
    /// Look up a label.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(key))
            .map(|s| s.as_str())
    }

    /// A label that must be present.
    pub fn require_label(&self, key: &str) -> Result<&str> {
        self.label(key)
            .ok_or_else(|| anyhow!("Image config missing label {key}"))
    }

    /// Parse a decimal unsigned size label.
    pub fn size_label(&self, key: &str) -> Result<Option<u64>> {
        self.label(key)
            .map(|v| v.parse::<u64>().with_context(|| format!("Parsing label {key}={v}")))
            .transpose()
    }

    /// Decode the `org.flatpak.commit-metadata.*` labels into their raw
    /// values; the label values are base64-encoded on the wire.
    pub fn commit_metadata(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut r = BTreeMap::new();
        let Some(labels) = self.config.as_ref().and_then(|c| c.labels.as_ref()) else {
            return Ok(r);
        };
        for (k, v) in labels {
            if let Some(key) = k.strip_prefix(LABEL_COMMIT_METADATA_PREFIX) {
                let decoded = BASE64_STANDARD
                    .decode(v)
                    .with_context(|| format!("Decoding label {k}"))?;
                r.insert(key.to_owned(), decoded);
            }
        }
        Ok(r)
    }
}

/// Encode a commit-metadata value for embedding in an image-config label.
pub fn encode_commit_metadata_value(raw: &[u8]) -> String {
    BASE64_STANDARD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST_FIXTURE: &str = r#"{
      "schemaVersion": 2,
      "config": {
        "mediaType": "application/vnd.oci.image.config.v1+json",
        "digest": "sha256:54977ab597b345c2238ba28fe18aad751e5c59dc38b9393f6f349255f0daa7fc",
        "size": 754
      },
      "layers": [
        {
          "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
          "digest": "sha256:0b5b930ffc68d4083b51ceb3811cbcc0cda62845021ab1ea3d523b78392f7f0f",
          "size": 102400
        }
      ],
      "annotations": {
        "org.flatpak.ref": "app/org.test.Hello/x86_64/master"
      }
    }"#;

    #[test]
    fn manifest_roundtrip() {
        let m: Manifest = serde_json::from_str(MANIFEST_FIXTURE).unwrap();
        assert_eq!(m.schema_version, 2);
        assert_eq!(m.config.media_type, OCI_TYPE_CONFIG);
        assert_eq!(m.layers.len(), 1);
        assert_eq!(
            m.annotations.as_ref().unwrap().get(LABEL_REF).unwrap(),
            "app/org.test.Hello/x86_64/master"
        );
        let j = serde_json::to_value(&m).unwrap();
        assert_eq!(j["config"]["mediaType"], OCI_TYPE_CONFIG);
        assert_eq!(j["schemaVersion"], 2);
    }

    #[test]
    fn index_ref_lookup() {
        let m: Manifest = serde_json::from_str(MANIFEST_FIXTURE).unwrap();
        let mut idx = Index::default();
        idx.upsert_manifest(Descriptor {
            media_type: OCI_TYPE_MANIFEST.into(),
            digest: m.config.digest.clone(),
            size: 2,
            platform: None,
            annotations: m.annotations.clone(),
        });
        assert!(idx
            .manifest_for_ref("app/org.test.Hello/x86_64/master")
            .is_some());
        assert!(idx.manifest_for_ref("app/org.test.Other/x86_64/master").is_none());
        // Upserting the same ref replaces rather than appending
        idx.upsert_manifest(Descriptor {
            media_type: OCI_TYPE_MANIFEST.into(),
            digest: m.layers[0].digest.clone(),
            size: 3,
            platform: None,
            annotations: m.annotations.clone(),
        });
        assert_eq!(idx.manifests.len(), 1);
        assert_eq!(idx.manifests[0].size, 3);
    }

    #[test]
    fn config_labels() {
        let cfg = ImageConfig {
            created: None,
            architecture: "amd64".into(),
            os: "linux".into(),
            config: Some(ContainerConfig {
                labels: Some(
                    [
                        (LABEL_REF.to_string(), "app/org.test.Hello/x86_64/master".to_string()),
                        (LABEL_INSTALLED_SIZE.to_string(), "4096".to_string()),
                        (
                            format!("{LABEL_COMMIT_METADATA_PREFIX}xa.token-type"),
                            encode_commit_metadata_value(b"\x01\x00\x00\x00"),
                        ),
                    ]
                    .into_iter()
                    .collect(),
                ),
            }),
            rootfs: RootFs {
                kind: "layers".into(),
                diff_ids: vec![],
            },
            history: vec![],
        };
        assert_eq!(cfg.size_label(LABEL_INSTALLED_SIZE).unwrap(), Some(4096));
        assert_eq!(cfg.size_label(LABEL_DOWNLOAD_SIZE).unwrap(), None);
        let md = cfg.commit_metadata().unwrap();
        assert_eq!(md.get("xa.token-type").unwrap(), b"\x01\x00\x00\x00");
        assert!(cfg.require_label(LABEL_METADATA).is_err());
    }
}
