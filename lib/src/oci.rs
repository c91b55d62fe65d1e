//! OCI wire types: descriptors, image manifests, and layout indexes.
//!
//! These are the JSON shapes shared by the local store and the registry
//! client. Serialization is deterministic: annotation maps are `BTreeMap`s
//! and struct fields serialize in declaration order, so the same manifest
//! always produces the same bytes (and therefore the same digest).

use std::collections::BTreeMap;

use color_eyre::{eyre::Context, Result};
use serde::{Deserialize, Serialize};

use crate::{Digest, LayerKind};

/// The OCI image manifest media type.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Artifact type stamped on ModelKit manifests.
pub const KIT_ARTIFACT_TYPE: &str = "application/vnd.kitops.modelkit.manifest.v1+json";

/// Artifact type stamped on CNCF ModelPack manifests.
pub const MODELPACK_ARTIFACT_TYPE: &str = "application/vnd.cncf.model.manifest.v1+json";

/// The OCI manifest schema version this crate writes.
pub const SCHEMA_VERSION: u32 = 2;

/// Contents of the `oci-layout` marker file.
pub const OCI_LAYOUT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Well-known annotation keys used on descriptors and manifests.
pub mod annotations {
    /// OCI standard: the tag a manifest is known by within a layout index.
    pub const REF_NAME: &str = "org.opencontainers.image.ref.name";

    /// The CLI version that packed a ModelKit.
    pub const CLI_VERSION: &str = "ml.kitops.modelkit.cli-version";

    /// The full Kitfile YAML, carried on ModelPack manifests which have no
    /// Kitfile config blob.
    pub const KITFILE: &str = "ml.kitops.modelkit.kitfile";

    /// Distinguishes prompt layers from ordinary code layers.
    pub const LAYER_SUBTYPE: &str = "ml.kitops.modelkit.layerSubtype";

    /// [`LAYER_SUBTYPE`] value for prompt layers.
    pub const SUBTYPE_PROMPT: &str = "prompt";

    /// ModelPack parity: the original path of the single file in a layer.
    pub const FILEPATH: &str = "org.cncf.model.filepath";

    /// ModelPack parity: JSON-encoded file metadata for a single-file layer.
    pub const FILE_METADATA: &str = "org.cncf.model.file.metadata";
}

/// A content descriptor: media type, digest, and size, plus annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,

    pub digest: Digest,

    pub size: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Create a descriptor with no annotations.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
        }
    }

    /// Look up an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Parse the media type into the artifact algebra.
    pub fn parsed_media_type(&self) -> Result<crate::mediatype::MediaType> {
        self.media_type
            .parse()
            .with_context(|| format!("parse layer media type for {}", self.digest))
    }

    /// The layer kind for this descriptor, if it is an artifact layer.
    ///
    /// Prompts share the `code` base type and are told apart by the
    /// [`annotations::LAYER_SUBTYPE`] annotation.
    pub fn layer_kind(&self) -> Result<LayerKind> {
        use crate::mediatype::BaseType;
        let base = self.parsed_media_type()?.base();
        let kind = match base {
            BaseType::Model => LayerKind::Model,
            BaseType::ModelPart => LayerKind::ModelPart,
            BaseType::Dataset => LayerKind::Dataset,
            BaseType::Docs => LayerKind::Docs,
            BaseType::Code => {
                if self.annotation(annotations::LAYER_SUBTYPE)
                    == Some(annotations::SUBTYPE_PROMPT)
                {
                    LayerKind::Prompt
                } else {
                    LayerKind::Code
                }
            }
            BaseType::Config => Err(crate::error::Error::InvalidInput(format!(
                "config media type {} is not a layer",
                self.media_type
            )))?,
        };
        Ok(kind)
    }
}

/// An OCI image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,

    pub media_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Serialize to the canonical JSON bytes that are hashed and stored.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize manifest")
    }

    /// Parse a manifest from its stored bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("parse manifest")
    }

    /// The descriptor addressing this manifest's canonical bytes.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let bytes = self.to_canonical_json()?;
        Ok(Descriptor::new(
            self.media_type.clone(),
            Digest::digest_of(&bytes),
            bytes.len() as i64,
        ))
    }

    /// Whether this manifest is a CNCF ModelPack artifact.
    pub fn is_modelpack(&self) -> bool {
        self.artifact_type.as_deref() == Some(MODELPACK_ARTIFACT_TYPE)
    }
}

/// The `index.json` of an OCI image layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

impl Index {
    /// An empty index.
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            manifests: Vec::new(),
        }
    }

    /// Find the manifest descriptor carrying the given tag.
    pub fn find_tag(&self, tag: &str) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|desc| desc.annotation(annotations::REF_NAME) == Some(tag))
    }

    /// Find a manifest descriptor by digest.
    pub fn find_digest(&self, digest: &Digest) -> Option<&Descriptor> {
        self.manifests.iter().find(|desc| &desc.digest == digest)
    }

    /// All tags pointing at the given digest.
    pub fn tags_of(&self, digest: &Digest) -> Vec<&str> {
        self.manifests
            .iter()
            .filter(|desc| &desc.digest == digest)
            .filter_map(|desc| desc.annotation(annotations::REF_NAME))
            .collect()
    }
}

/// Metadata recorded for a single-file layer, ModelPack parity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mod_time: i64,
    pub typeflag: u8,
}

/// The minimal config blob written for ModelPack artifacts, mirroring the
/// `rootfs` section of an OCI image config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub modelfs: ModelFs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelFs {
    #[serde(rename = "type")]
    pub fs_type: String,

    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl ModelConfig {
    /// Build the config for a set of layer diff-IDs.
    pub fn layers(diff_ids: Vec<Digest>) -> Self {
        Self {
            modelfs: ModelFs {
                fs_type: "layers".to_string(),
                diff_ids,
            },
        }
    }
}
