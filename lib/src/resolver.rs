//! Resolution of parent-ModelKit references.
//!
//! A Kitfile whose `model.path` is a ModelKit reference inherits the model
//! of that parent kit. Chains are walked iteratively with an explicit
//! visited stack: revisiting a reference on the active path is a cycle, and
//! chains longer than [`MAX_MODEL_REF_CHAIN`] are refused.

use color_eyre::{eyre::Context, Result};
use tracing::debug;

use crate::{
    error::Error,
    kitfile::{Kitfile, Model, ModelPart},
    mediatype::{KIT_CONFIG_MEDIA_TYPE, MODELPACK_CONFIG_MEDIA_TYPE},
    oci::{annotations, Manifest},
    transform, LayerKind, ModelSource, Reference, MAX_MODEL_REF_CHAIN,
};

/// Fetch and load the Kitfile of the ModelKit a reference points at.
pub async fn fetch_kitfile(source: &impl ModelSource, reference: &Reference) -> Result<Kitfile> {
    let desc = source
        .resolve(reference)
        .await
        .with_context(|| format!("resolve {reference}"))?;
    let manifest = source
        .manifest(reference, &desc)
        .await
        .with_context(|| format!("fetch manifest for {reference}"))?;
    load_kitfile(source, reference, &manifest).await
}

/// Load the Kitfile described by a manifest: from the config blob for Kit
/// artifacts, from the manifest annotation for ModelPack artifacts that
/// carry one, or synthesized from layer annotations otherwise.
pub async fn load_kitfile(
    source: &impl ModelSource,
    reference: &Reference,
    manifest: &Manifest,
) -> Result<Kitfile> {
    match manifest.config.media_type.as_str() {
        KIT_CONFIG_MEDIA_TYPE => {
            let stream = source.blob(reference, &manifest.config).await?;
            let bytes = transform::collect(stream).await.context("fetch config blob")?;
            Kitfile::parse(&bytes)
        }
        MODELPACK_CONFIG_MEDIA_TYPE => match manifest.annotations.get(annotations::KITFILE) {
            Some(yaml) => Kitfile::parse(yaml.as_bytes()).context("parse embedded Kitfile"),
            None => synthesize_kitfile(manifest),
        },
        other => Err(Error::InvalidInput(format!(
            "manifest config is not a ModelKit or ModelPack config: {other}"
        )))?,
    }
}

/// Build a minimal Kitfile for a ModelPack that does not embed one, from the
/// layer media types and their `org.cncf.model.filepath` annotations.
///
/// The synthesis is lossy by design: a layer without a filepath annotation
/// cannot be placed and fails the whole operation.
pub fn synthesize_kitfile(manifest: &Manifest) -> Result<Kitfile> {
    let mut kitfile = Kitfile {
        manifest_version: crate::kitfile::MANIFEST_VERSION.to_string(),
        ..Kitfile::default()
    };

    for layer in &manifest.layers {
        let kind = layer.layer_kind()?;
        let path = layer
            .annotation(annotations::FILEPATH)
            .ok_or_else(|| Error::UnknownLayerPath(layer.digest.to_string()))?
            .to_string();

        match kind {
            LayerKind::Model => match &mut kitfile.model {
                None => {
                    kitfile.model = Some(Model {
                        path,
                        ..Model::default()
                    })
                }
                Some(model) => model.parts.push(ModelPart {
                    path,
                    ..ModelPart::default()
                }),
            },
            LayerKind::ModelPart => {
                kitfile
                    .model
                    .get_or_insert_with(Model::default)
                    .parts
                    .push(ModelPart {
                        path,
                        ..ModelPart::default()
                    })
            }
            LayerKind::Code => kitfile.code.push(crate::kitfile::Code {
                path,
                ..crate::kitfile::Code::default()
            }),
            LayerKind::Prompt => kitfile.prompts.push(crate::kitfile::Prompt {
                path,
                ..crate::kitfile::Prompt::default()
            }),
            LayerKind::Dataset => kitfile.datasets.push(crate::kitfile::Dataset {
                path,
                ..crate::kitfile::Dataset::default()
            }),
            LayerKind::Docs => kitfile.docs.push(crate::kitfile::Docs {
                path,
                ..crate::kitfile::Docs::default()
            }),
        }
    }

    Ok(kitfile)
}

/// Walk the parent chain of a Kitfile and return the flattened view: the
/// merged `model.parts` of every ancestor (root-ancestor first, descendant
/// last) and a `model.path` that is the leaf ancestor's filesystem path.
pub async fn resolve_model_chain(
    source: &impl ModelSource,
    kitfile: &Kitfile,
) -> Result<Kitfile> {
    let mut merged = kitfile.clone();
    let Some(mut model) = merged.model.take() else {
        return Ok(merged);
    };

    let own_parts = std::mem::take(&mut model.parts);
    let mut inherited: Vec<ModelPart> = Vec::new();
    let mut visited: Vec<String> = Vec::new();
    let mut cursor = kitfile.clone();

    while let Some(parent_ref) = cursor.model_parent()? {
        let key = parent_ref.to_string();
        if visited.iter().any(|seen| seen == &key) {
            Err(Error::CycleDetected(key.clone()))
                .with_context(|| format!("resolving parents of {}", model.path))?;
        }
        if visited.len() >= MAX_MODEL_REF_CHAIN {
            Err(Error::DepthExceeded)?;
        }
        visited.push(key);

        debug!(parent = %parent_ref, "resolve parent model");
        let parent = fetch_kitfile(source, &parent_ref)
            .await
            .with_context(|| format!("fetch parent kit {parent_ref}"))?;
        let parent_model = parent.model.clone().ok_or_else(|| {
            Error::InvalidInput(format!("parent kit {parent_ref} declares no model"))
        })?;

        // Each step is one generation more ancestral, so its parts go in
        // front of everything gathered so far.
        let mut parts = parent_model.parts.clone();
        parts.extend(inherited);
        inherited = parts;

        if model.name.is_empty() {
            model.name = parent_model.name.clone();
        }
        if model.framework.is_empty() {
            model.framework = parent_model.framework.clone();
        }
        if model.version.is_empty() {
            model.version = parent_model.version.clone();
        }
        if model.license.is_empty() {
            model.license = parent_model.license.clone();
        }
        if model.parameters.is_none() {
            model.parameters = parent_model.parameters.clone();
        }
        model.path = parent_model.path.clone();
        model.layer_info = parent_model.layer_info.clone();

        cursor = parent;
    }

    inherited.extend(own_parts);
    model.parts = inherited;
    merged.model = Some(model);
    Ok(merged)
}
