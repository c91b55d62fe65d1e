//! The packer: streams a pack context into compressed tar layers, computing
//! layer digests and diff-IDs in a single pass, and seals the result as a
//! manifest in the local store.
//!
//! Layer bytes are never buffered whole: the tar encoder feeds a diff-ID
//! hasher, whose output feeds the compressor, whose output feeds the store's
//! blob sink (which hashes the compressed bytes and counts their size). One
//! pass, two digests.

use std::path::{Path, PathBuf};

use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use async_compression::Level;
use bon::Builder;
use color_eyre::{
    eyre::{Context, OptionExt},
    Result,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::{
    error::Error,
    ignore::IgnoreSet,
    kitfile::{kitfile_path, Kitfile, LayerInfo},
    mediatype::{Compression, Format, MediaType, KIT_CONFIG_MEDIA_TYPE, MODELPACK_CONFIG_MEDIA_TYPE},
    oci::{
        annotations, Descriptor, FileMetadata, Manifest, ModelConfig, KIT_ARTIFACT_TYPE,
        MANIFEST_MEDIA_TYPE, MODELPACK_ARTIFACT_TYPE, SCHEMA_VERSION,
    },
    paths,
    store::{BlobSink, Store},
    transform::HashWriter,
    Digest, LayerKind, Reference, SubReference,
};

/// Stamped into manifests as the packing CLI version.
const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Options for packing a context directory into the local store.
#[derive(Debug, Builder)]
pub struct PackOpts {
    /// Directory whose contents are packed.
    #[builder(into)]
    pub context_dir: PathBuf,

    /// Explicit Kitfile path. Defaults to `Kitfile` inside the context.
    pub kitfile_path: Option<PathBuf>,

    /// Reference to store the result under, e.g. `my-model:v1`. Defaults to
    /// an untagged manifest under the package name.
    pub tag: Option<String>,

    /// Compression applied to every layer.
    #[builder(default)]
    pub compression: Compression,

    /// Emit ModelPack media types and config instead of Kit ones.
    #[builder(default)]
    pub use_modelpack: bool,

    /// Zero tar mtimes so identical inputs pack to identical bytes.
    /// Disable to preserve source file mtimes.
    #[builder(default = true)]
    pub normalize_mtimes: bool,
}

/// One planned layer: where its bytes come from and what it is.
#[derive(Debug, Clone)]
pub(crate) struct PlanEntry {
    pub kind: LayerKind,
    pub path: String,
    pub name: Option<String>,
    /// Per-entry compression override; falls back to the pack-wide choice.
    pub compression: Option<Compression>,
}

/// The deterministic layer traversal of a Kitfile: model, model parts, code,
/// prompts, datasets, then docs, each section in declaration order.
pub(crate) fn layer_plan(kitfile: &Kitfile) -> Vec<PlanEntry> {
    let mut plan = Vec::new();

    if let Some(model) = &kitfile.model {
        if !crate::kitfile::is_reference_like(&model.path) {
            plan.push(PlanEntry {
                kind: LayerKind::Model,
                path: model.path.clone(),
                name: Some(model.name.clone()).filter(|name| !name.is_empty()),
                compression: None,
            });
        }
        for part in &model.parts {
            plan.push(PlanEntry {
                kind: LayerKind::ModelPart,
                path: part.path.clone(),
                name: Some(part.name.clone()).filter(|name| !name.is_empty()),
                compression: None,
            });
        }
    }
    for code in &kitfile.code {
        plan.push(PlanEntry {
            kind: LayerKind::Code,
            path: code.path.clone(),
            name: None,
            compression: None,
        });
    }
    for prompt in &kitfile.prompts {
        plan.push(PlanEntry {
            kind: LayerKind::Prompt,
            path: prompt.path.clone(),
            name: None,
            compression: None,
        });
    }
    for dataset in &kitfile.datasets {
        plan.push(PlanEntry {
            kind: LayerKind::Dataset,
            path: dataset.path.clone(),
            name: Some(dataset.name.clone()).filter(|name| !name.is_empty()),
            compression: None,
        });
    }
    for docs in &kitfile.docs {
        plan.push(PlanEntry {
            kind: LayerKind::Docs,
            path: docs.path.clone(),
            name: None,
            compression: None,
        });
    }

    plan
}

/// Pack a context directory into the local store, returning the manifest
/// descriptor.
#[instrument(skip(store, opts), fields(context = ?opts.context_dir))]
pub async fn pack(store: &Store, opts: PackOpts) -> Result<Descriptor> {
    let kitfile_source = kitfile_path(&opts.context_dir, opts.kitfile_path.as_deref());
    let kitfile = Kitfile::read(&kitfile_source).await?;
    kitfile.validate().context("validate Kitfile")?;

    // A parent reference must resolve cleanly (no cycles, bounded depth)
    // before we seal anything; the parent's layers are inherited at unpack
    // time, not copied into this kit.
    if kitfile.model_parent()?.is_some() {
        crate::resolver::resolve_model_chain(store, &kitfile)
            .await
            .context("validate parent model chain")?;
    }

    let (repository, tag) = destination(&kitfile, opts.tag.as_deref())?;
    let kitfile_name = kitfile_source
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| crate::KITFILE_NAME.to_string());
    let ignores = IgnoreSet::load(&opts.context_dir, &kitfile_name)?;

    let plan = layer_plan(&kitfile);
    let mut kitfile_out = kitfile.clone();
    let mut layers = Vec::with_capacity(plan.len());
    let mut diff_ids = Vec::with_capacity(plan.len());

    for entry in &plan {
        let compression = entry.compression.unwrap_or(opts.compression);
        let (desc, info) = build_layer(store, &repository, &opts, entry, compression, &ignores)
            .await
            .with_context(|| format!("pack {} layer {}", entry.kind, entry.path))?;
        info!(layer = %desc.digest, kind = %entry.kind, path = %entry.path, "packed layer");
        diff_ids.push(info.diff_id.clone());
        attach_layer_info(&mut kitfile_out, entry, info);
        layers.push(desc);
    }

    let manifest = seal_manifest(store, &repository, &opts, &kitfile_out, layers, diff_ids).await?;
    let desc = store.put_manifest(&repository, &manifest, tag.as_deref()).await?;
    info!(manifest = %desc.digest, repository = %repository, "packed modelkit");
    Ok(desc)
}

/// Decide the repository and tag the packed manifest is stored under.
fn destination(kitfile: &Kitfile, tag: Option<&str>) -> Result<(String, Option<String>)> {
    match tag {
        None if kitfile.package.name.is_empty() => Err(Error::InvalidInput(
            "package.name is required when packing without a tag".to_string(),
        ))?,
        None => Ok((kitfile.package.name.clone(), None)),
        Some(tag) => {
            let reference = tag.parse::<Reference>().context("parse pack tag")?;
            let tag = match reference.sub_reference {
                SubReference::Bare => None,
                SubReference::Tag(tag) => Some(tag),
                SubReference::Digest(_) => Err(Error::InvalidInput(
                    "cannot pack to a digest reference".to_string(),
                ))?,
            };
            Ok((reference.repository, tag))
        }
    }
}

/// Write `layerInfo` into the Kitfile entry the plan entry came from.
///
/// The plan is derived from the Kitfile in order, so per-kind counters line
/// the two up exactly.
fn attach_layer_info(kitfile: &mut Kitfile, entry: &PlanEntry, info: LayerInfo) {
    let matches_path = |path: &str| path == entry.path;
    match entry.kind {
        LayerKind::Model => {
            if let Some(model) = &mut kitfile.model {
                model.layer_info = Some(info);
            }
        }
        LayerKind::ModelPart => {
            if let Some(part) = kitfile
                .model
                .as_mut()
                .and_then(|m| m.parts.iter_mut().find(|p| matches_path(&p.path) && p.layer_info.is_none()))
            {
                part.layer_info = Some(info);
            }
        }
        LayerKind::Code => {
            if let Some(code) = kitfile
                .code
                .iter_mut()
                .find(|c| matches_path(&c.path) && c.layer_info.is_none())
            {
                code.layer_info = Some(info);
            }
        }
        LayerKind::Prompt => {
            if let Some(prompt) = kitfile
                .prompts
                .iter_mut()
                .find(|p| matches_path(&p.path) && p.layer_info.is_none())
            {
                prompt.layer_info = Some(info);
            }
        }
        LayerKind::Dataset => {
            if let Some(dataset) = kitfile
                .datasets
                .iter_mut()
                .find(|d| matches_path(&d.path) && d.layer_info.is_none())
            {
                dataset.layer_info = Some(info);
            }
        }
        LayerKind::Docs => {
            if let Some(docs) = kitfile
                .docs
                .iter_mut()
                .find(|d| matches_path(&d.path) && d.layer_info.is_none())
            {
                docs.layer_info = Some(info);
            }
        }
    }
}

/// Build one layer: tar the entry subtree (or single file), compress, hash
/// both sides, and place the blob in the store.
async fn build_layer(
    store: &Store,
    repository: &str,
    opts: &PackOpts,
    entry: &PlanEntry,
    compression: Compression,
    ignores: &IgnoreSet,
) -> Result<(Descriptor, LayerInfo)> {
    let source = paths::verify_subpath(&opts.context_dir, Path::new(&entry.path))
        .await
        .context("layer path must stay inside the pack context")?;
    let metadata = tokio::fs::metadata(&source)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                color_eyre::Report::from(Error::NotFound(format!("layer path {}", entry.path)))
            }
            _ => color_eyre::Report::from(err),
        })?;

    let sink = store.blob_sink(repository).await?;
    let tar_entries = if metadata.is_dir() {
        collect_tree(&opts.context_dir, &entry.path, ignores).await?
    } else {
        vec![TarEntry {
            source: source.clone(),
            tar_path: PathBuf::from(
                source
                    .file_name()
                    .ok_or_eyre("layer file has no name")?
                    .to_string_lossy()
                    .to_string(),
            ),
            is_dir: false,
        }]
    };

    let normalize = opts.normalize_mtimes;
    let (diff_id, digest, size) = match compression {
        Compression::None => {
            let (diff_id, mut sink) = write_tar(sink, &tar_entries, normalize).await?;
            sink.shutdown().await.context("flush layer")?;
            let (digest, size) = sink.finish().await?;
            (diff_id, digest, size)
        }
        Compression::Gzip => {
            finish_compressed(GzipEncoder::new(sink), &tar_entries, normalize).await?
        }
        Compression::GzipFastest => {
            finish_compressed(
                GzipEncoder::with_quality(sink, Level::Fastest),
                &tar_entries,
                normalize,
            )
            .await?
        }
        Compression::Zstd => {
            finish_compressed(ZstdEncoder::new(sink), &tar_entries, normalize).await?
        }
    };

    let media_type = if opts.use_modelpack {
        MediaType::modelpack(entry.kind.base_type(), Format::Tar, compression)
    } else {
        MediaType::kit(entry.kind.base_type(), compression)
    };

    let mut desc = Descriptor::new(media_type.to_string(), digest.clone(), size);
    if entry.kind == LayerKind::Prompt {
        desc.annotations.insert(
            annotations::LAYER_SUBTYPE.to_string(),
            annotations::SUBTYPE_PROMPT.to_string(),
        );
    }
    if !metadata.is_dir() {
        desc.annotations
            .insert(annotations::FILEPATH.to_string(), entry.path.clone());
        let file_metadata = FileMetadata {
            name: tar_entries[0].tar_path.to_string_lossy().to_string(),
            mode: unix_mode(&metadata),
            uid: 0,
            gid: 0,
            size: metadata.len(),
            mod_time: if normalize { 0 } else { mtime_of(&metadata) },
            typeflag: b'0',
        };
        desc.annotations.insert(
            annotations::FILE_METADATA.to_string(),
            serde_json::to_string(&file_metadata).context("serialize file metadata")?,
        );
    } else if opts.use_modelpack {
        desc.annotations
            .insert(annotations::FILEPATH.to_string(), entry.path.clone());
    }

    let info = LayerInfo {
        digest,
        diff_id,
        size,
    };
    Ok((desc, info))
}

async fn finish_compressed<E>(
    encoder: E,
    entries: &[TarEntry],
    normalize: bool,
) -> Result<(Digest, Digest, i64)>
where
    E: AsyncWrite + Unpin + Send + IntoBlobSink + 'static,
{
    let (diff_id, mut encoder) = write_tar(encoder, entries, normalize).await?;
    encoder.shutdown().await.context("finish compressor")?;
    let (digest, size) = encoder.into_blob_sink().finish().await?;
    Ok((diff_id, digest, size))
}

/// Recover the store sink from the bottom of a compressor stack.
trait IntoBlobSink {
    fn into_blob_sink(self) -> BlobSink;
}

impl IntoBlobSink for GzipEncoder<BlobSink> {
    fn into_blob_sink(self) -> BlobSink {
        self.into_inner()
    }
}

impl IntoBlobSink for ZstdEncoder<BlobSink> {
    fn into_blob_sink(self) -> BlobSink {
        self.into_inner()
    }
}

/// One file or directory headed into a layer tarball.
#[derive(Debug, Clone)]
struct TarEntry {
    source: PathBuf,
    tar_path: PathBuf,
    is_dir: bool,
}

/// Collect a directory subtree in stable order: sorted by tar path, which
/// places each directory before its contents.
async fn collect_tree(
    context_dir: &Path,
    entry_path: &str,
    ignores: &IgnoreSet,
) -> Result<Vec<TarEntry>> {
    let root = context_dir.join(entry_path);
    let mut found = Vec::new();
    let mut pending = vec![root.clone()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read {}", dir.display()))?;
        while let Some(dirent) = entries.next_entry().await.context("read dir entry")? {
            let source = dirent.path();
            let context_rel = source
                .strip_prefix(context_dir)
                .context("entry under context")?
                .to_path_buf();
            let file_type = dirent.file_type().await.context("entry file type")?;

            if ignores.matches(&context_rel, file_type.is_dir()) {
                debug!(path = ?context_rel, "skip: ignored");
                continue;
            }

            let tar_path = source
                .strip_prefix(&root)
                .context("entry under layer root")?
                .to_path_buf();
            if file_type.is_dir() {
                pending.push(source.clone());
                found.push(TarEntry {
                    source,
                    tar_path,
                    is_dir: true,
                });
            } else if file_type.is_file() {
                found.push(TarEntry {
                    source,
                    tar_path,
                    is_dir: false,
                });
            } else {
                debug!(path = ?context_rel, "skip: not a regular file or directory");
            }
        }
    }

    found.sort_by(|a, b| a.tar_path.cmp(&b.tar_path));
    Ok(found)
}

/// Stream entries into a tar archive over `dest`, hashing the uncompressed
/// archive bytes for the diff-ID.
async fn write_tar<W: AsyncWrite + Unpin + Send + 'static>(
    dest: W,
    entries: &[TarEntry],
    normalize: bool,
) -> Result<(Digest, W)> {
    let hasher = HashWriter::new(dest);
    let mut builder = tokio_tar::Builder::new(hasher);

    for entry in entries {
        let metadata = tokio::fs::metadata(&entry.source)
            .await
            .with_context(|| format!("stat {}", entry.source.display()))?;

        let mut header = tokio_tar::Header::new_ustar();
        header.set_mode(unix_mode(&metadata));
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(if normalize { 0 } else { mtime_of(&metadata) as u64 });

        if entry.is_dir {
            header.set_entry_type(tokio_tar::EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, &entry.tar_path, tokio::io::empty())
                .await
                .with_context(|| format!("append directory {}", entry.tar_path.display()))?;
        } else {
            header.set_entry_type(tokio_tar::EntryType::Regular);
            header.set_size(metadata.len());
            let file = tokio::fs::File::open(&entry.source)
                .await
                .with_context(|| format!("open {}", entry.source.display()))?;
            builder
                .append_data(&mut header, &entry.tar_path, file)
                .await
                .with_context(|| format!("append file {}", entry.tar_path.display()))?;
        }
    }

    let hasher = builder.into_inner().await.context("finish tar archive")?;
    let (diff_id, dest) = hasher.finish();
    Ok((diff_id, dest))
}

/// Seal the config blob and manifest for a finished layer set.
async fn seal_manifest(
    store: &Store,
    repository: &str,
    opts: &PackOpts,
    kitfile: &Kitfile,
    layers: Vec<Descriptor>,
    diff_ids: Vec<Digest>,
) -> Result<Manifest> {
    let mut manifest_annotations = std::collections::BTreeMap::new();
    manifest_annotations.insert(annotations::CLI_VERSION.to_string(), CLI_VERSION.to_string());

    let config = if opts.use_modelpack {
        // ModelPack has no Kitfile config slot; the Kitfile rides along as a
        // manifest annotation instead.
        manifest_annotations.insert(annotations::KITFILE.to_string(), kitfile.to_yaml()?);
        let bytes = serde_json::to_vec(&ModelConfig::layers(diff_ids))
            .context("serialize modelpack config")?;
        let (digest, size) = store.push_bytes(repository, &bytes).await?;
        Descriptor::new(MODELPACK_CONFIG_MEDIA_TYPE, digest, size)
    } else {
        let bytes = kitfile.to_json()?;
        let (digest, size) = store.push_bytes(repository, &bytes).await?;
        Descriptor::new(KIT_CONFIG_MEDIA_TYPE, digest, size)
    };

    Ok(Manifest {
        schema_version: SCHEMA_VERSION,
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        artifact_type: Some(
            if opts.use_modelpack {
                MODELPACK_ARTIFACT_TYPE
            } else {
                KIT_ARTIFACT_TYPE
            }
            .to_string(),
        ),
        config,
        layers,
        annotations: manifest_annotations,
    })
}

#[cfg(unix)]
fn unix_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn unix_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn mtime_of(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
