//! The Kitfile: the human-authored YAML manifest describing a ModelKit.
//!
//! A Kitfile is authored by the user (or synthesized from a directory scan),
//! validated, and sealed into the packed artifact as its config blob. The
//! canonical serialized form is JSON-compatible: maps are alphabetized and no
//! YAML-only constructs (tags, non-string keys) survive validation.

use std::path::{Component, Path, PathBuf};

use color_eyre::{
    eyre::{ensure, Context},
    Result,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tap::Pipe;
use tracing::debug;

use crate::{error::Error, Digest, Reference, KITFILE_NAME};

/// The Kitfile manifest version this crate writes.
pub const MANIFEST_VERSION: &str = "1.0";

/// A parsed ModelKit manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kitfile {
    /// Version of the Kitfile schema. Required.
    pub manifest_version: String,

    /// Metadata about the packaged project.
    #[serde(default, skip_serializing_if = "Package::is_empty")]
    pub package: Package,

    /// The trained model, if the kit ships one. Absent is equivalent to an
    /// empty model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Model>,

    /// Datasets bundled with the kit, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasets: Vec<Dataset>,

    /// Source code bundled with the kit, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<Code>,

    /// Documentation bundled with the kit, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docs: Vec<Docs>,

    /// Prompt collections bundled with the kit, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<Prompt>,
}

/// Project-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

impl Package {
    fn is_empty(&self) -> bool {
        self == &Package::default()
    }
}

/// The model section of a Kitfile.
///
/// `path` is either a filesystem path inside the pack context or a ModelKit
/// reference naming a *parent* kit whose model this kit inherits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub framework: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    /// Free-form, JSON-compatible model parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_yaml::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ModelPart>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// An auxiliary model artifact (tokenizer, adapter, quantization config, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPart {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub path: String,

    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub part_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Docs {
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// Anchors a Kitfile entry to its packed layer: the digest of the compressed
/// blob, the digest of the uncompressed tar (the diff-ID), and the blob size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub digest: Digest,

    #[serde(rename = "diffID")]
    pub diff_id: Digest,

    pub size: i64,
}

impl Kitfile {
    /// Parse a Kitfile from YAML bytes. The canonical JSON form parses too,
    /// since YAML is a superset.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes).context("parse Kitfile")
    }

    /// Read and parse a Kitfile from disk.
    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("read Kitfile at {}", path.display()))?;
        Self::parse(&bytes)
    }

    /// Serialize to canonical YAML.
    pub fn to_yaml(&self) -> Result<String> {
        self.canonicalized()?
            .pipe_ref(serde_yaml::to_string)
            .context("serialize Kitfile to YAML")
    }

    /// Serialize to canonical JSON: struct fields in declaration order, free
    /// parameter maps alphabetized.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.canonicalized()?).context("serialize Kitfile to JSON")
    }

    /// Validate the document per the Kitfile contract:
    ///
    /// - `manifestVersion` is present;
    /// - no entry path is absolute or escapes the pack context lexically;
    /// - `parameters` is representable in JSON.
    ///
    /// The packer additionally verifies paths against the real filesystem
    /// (symlink-aware) before reading anything.
    pub fn validate(&self) -> Result<()> {
        ensure_kind(
            !self.manifest_version.is_empty(),
            "manifestVersion is required",
        )?;

        for (path, is_model) in self.entry_paths() {
            if is_model && is_reference_like(path) {
                // A parent reference is resolved, not read from disk.
                continue;
            }
            validate_entry_path(path)?;
        }

        if let Some(parameters) = self.model.as_ref().and_then(|m| m.parameters.as_ref()) {
            json_compatible(parameters).context("validate model parameters")?;
        }

        Ok(())
    }

    /// The de-duplicated, lexicographically sorted union of every `license`
    /// field in the document. Stable across runs.
    pub fn collect_licenses(&self) -> Vec<String> {
        let model_licenses = self
            .model
            .iter()
            .flat_map(|m| std::iter::once(&m.license).chain(m.parts.iter().map(|p| &p.license)));

        std::iter::once(&self.package.license)
            .chain(model_licenses)
            .chain(self.datasets.iter().map(|d| &d.license))
            .chain(self.code.iter().map(|c| &c.license))
            .filter(|license| !license.is_empty())
            .cloned()
            .sorted()
            .dedup()
            .collect()
    }

    /// The parent ModelKit reference, if `model.path` is reference-shaped.
    pub fn model_parent(&self) -> Result<Option<Reference>> {
        let Some(model) = &self.model else {
            return Ok(None);
        };
        if !is_reference_like(&model.path) {
            return Ok(None);
        }
        model
            .path
            .parse::<Reference>()
            .with_context(|| format!("parse parent model reference: {}", model.path))
            .map(Some)
    }

    /// Iterate every entry path in the document, flagging the model path
    /// (which is allowed to be a reference instead).
    fn entry_paths(&self) -> impl Iterator<Item = (&str, bool)> {
        let model = self.model.iter().map(|m| (m.path.as_str(), true));
        let parts = self
            .model
            .iter()
            .flat_map(|m| m.parts.iter())
            .map(|p| (p.path.as_str(), false));
        model
            .chain(parts)
            .chain(self.datasets.iter().map(|d| (d.path.as_str(), false)))
            .chain(self.code.iter().map(|c| (c.path.as_str(), false)))
            .chain(self.docs.iter().map(|d| (d.path.as_str(), false)))
            .chain(self.prompts.iter().map(|p| (p.path.as_str(), false)))
    }

    /// Clone with free-form parameter maps recursively sorted by key.
    fn canonicalized(&self) -> Result<Self> {
        let mut kitfile = self.clone();
        if let Some(model) = &mut kitfile.model {
            if let Some(parameters) = model.parameters.take() {
                model.parameters = Some(sort_yaml(parameters)?);
            }
        }
        Ok(kitfile)
    }

    /// Synthesize a packable Kitfile from a directory scan.
    ///
    /// Well-known model weight extensions become the model (first hit) and
    /// model parts (the rest); `docs/` and README/LICENSE files become docs;
    /// `data/` or `datasets/` become datasets; `src/` becomes code.
    pub async fn from_directory(context_dir: &Path, name: &str) -> Result<Self> {
        const MODEL_EXTENSIONS: &[&str] = &["gguf", "safetensors", "onnx", "pt", "bin", "h5"];

        let mut kitfile = Kitfile {
            manifest_version: MANIFEST_VERSION.to_string(),
            package: Package {
                name: name.to_string(),
                ..Package::default()
            },
            ..Kitfile::default()
        };

        let mut entries = tokio::fs::read_dir(context_dir)
            .await
            .with_context(|| format!("scan {}", context_dir.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("read dir entry")? {
            names.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
        }
        names.sort();

        for (file_name, path) in names {
            let is_dir = path.is_dir();
            let extension = path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase());

            match file_name.as_str() {
                "docs" if is_dir => kitfile.docs.push(Docs {
                    path: file_name,
                    ..Docs::default()
                }),
                "data" | "datasets" if is_dir => kitfile.datasets.push(Dataset {
                    path: file_name,
                    ..Dataset::default()
                }),
                "src" if is_dir => kitfile.code.push(Code {
                    path: file_name,
                    ..Code::default()
                }),
                "prompts" if is_dir => kitfile.prompts.push(Prompt {
                    path: file_name,
                    ..Prompt::default()
                }),
                _ if file_name.starts_with("README") || file_name.starts_with("LICENSE") => {
                    kitfile.docs.push(Docs {
                        path: file_name,
                        ..Docs::default()
                    })
                }
                _ if extension.as_deref().is_some_and(|ext| MODEL_EXTENSIONS.contains(&ext)) => {
                    match &mut kitfile.model {
                        None => {
                            kitfile.model = Some(Model {
                                name: name.to_string(),
                                path: file_name,
                                ..Model::default()
                            })
                        }
                        Some(model) => model.parts.push(ModelPart {
                            path: file_name,
                            ..ModelPart::default()
                        }),
                    }
                }
                other => debug!(entry = other, "skip: no Kitfile section matches"),
            }
        }

        Ok(kitfile)
    }
}

/// Whether a model path is shaped like a ModelKit reference rather than a
/// filesystem path: its first `/`-separated segment looks like a registry
/// host.
pub fn is_reference_like(path: &str) -> bool {
    match path.split_once('/') {
        Some((head, _)) => Reference::registry_shaped(head),
        None => false,
    }
}

/// The path to the Kitfile within a context directory, honoring an explicit
/// override.
pub fn kitfile_path(context_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => context_dir.join(path),
        None => context_dir.join(KITFILE_NAME),
    }
}

fn ensure_kind(condition: bool, message: &str) -> Result<()> {
    if !condition {
        Err(Error::InvalidInput(message.to_string()))?;
    }
    Ok(())
}

fn validate_entry_path(path: &str) -> Result<()> {
    ensure!(!path.is_empty(), "entry path cannot be empty");
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        Err(Error::PathEscape(candidate.to_path_buf()))
            .context("entry paths must be relative to the pack context")?;
    }

    // Lexical guard: `a/../b` is fine, `../b` is not. The packer re-checks
    // against the real filesystem with symlinks resolved.
    let mut depth = 0i32;
    for component in candidate.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => depth = -1,
        }
        if depth < 0 {
            Err(Error::PathEscape(candidate.to_path_buf()))
                .context("entry paths must stay inside the pack context")?;
        }
    }
    Ok(())
}

/// Verify a YAML value is representable in JSON: string keys only, no tags.
/// Anchors and aliases are resolved by the parser and need no handling here.
fn json_compatible(value: &serde_yaml::Value) -> Result<()> {
    match value {
        serde_yaml::Value::Null
        | serde_yaml::Value::Bool(_)
        | serde_yaml::Value::Number(_)
        | serde_yaml::Value::String(_) => Ok(()),
        serde_yaml::Value::Sequence(items) => items.iter().try_for_each(json_compatible),
        serde_yaml::Value::Mapping(mapping) => {
            for (key, value) in mapping {
                ensure!(
                    matches!(key, serde_yaml::Value::String(_)),
                    "parameter map keys must be strings, got: {key:?}"
                );
                json_compatible(value)?;
            }
            Ok(())
        }
        serde_yaml::Value::Tagged(tagged) => Err(Error::InvalidInput(format!(
            "parameters must be JSON-compatible; YAML tag {} is not",
            tagged.tag
        )))?,
    }
}

/// Recursively sort mapping keys so emission is deterministic.
fn sort_yaml(value: serde_yaml::Value) -> Result<serde_yaml::Value> {
    json_compatible(&value)?;
    fn sort(value: serde_yaml::Value) -> serde_yaml::Value {
        match value {
            serde_yaml::Value::Sequence(items) => {
                serde_yaml::Value::Sequence(items.into_iter().map(sort).collect())
            }
            serde_yaml::Value::Mapping(mapping) => {
                let mut entries: Vec<(serde_yaml::Value, serde_yaml::Value)> = mapping
                    .into_iter()
                    .map(|(key, value)| (key, sort(value)))
                    .collect();
                entries.sort_by(|(a, _), (b, _)| {
                    a.as_str().unwrap_or_default().cmp(b.as_str().unwrap_or_default())
                });
                serde_yaml::Value::Mapping(entries.into_iter().collect())
            }
            scalar => scalar,
        }
    }
    Ok(sort(value))
}
