//! The unpacker: resolves a ModelKit, aligns manifest layers to Kitfile
//! entries, and writes the selected payloads under an unpack root with every
//! path verified against escape.
//!
//! Parent-model references recurse (bounded, cycle-checked) with filters
//! tightened to model layers only, so a child kit unpacks its ancestors'
//! model parts into the same root.

use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
};

use bon::Builder;
use color_eyre::{eyre::Context, Result};
use futures_lite::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument};

use crate::{
    error::Error,
    filter::{self, FilterConf},
    kitfile::Kitfile,
    mediatype::Format,
    oci::{annotations, Descriptor},
    paths,
    resolver,
    transform,
    ByteStream, LayerKind, ModelSource, Reference, MAX_MODEL_REF_CHAIN,
};

/// Options for unpacking a ModelKit to a directory.
#[derive(Debug, Clone, Builder)]
pub struct UnpackOpts {
    /// Directory the kit's contents are written under.
    #[builder(into)]
    pub unpack_dir: PathBuf,

    /// Layer selection. Empty unpacks everything.
    #[builder(default)]
    pub filters: Vec<FilterConf>,

    /// Replace files that already exist with different content.
    #[builder(default)]
    pub overwrite: bool,

    /// Silently skip files that already exist.
    #[builder(default)]
    pub ignore_existing: bool,
}

/// Unpack the referenced ModelKit into `opts.unpack_dir`.
#[instrument(skip(source, opts), fields(unpack_dir = ?opts.unpack_dir))]
pub async fn unpack(
    source: &impl ModelSource,
    reference: &Reference,
    opts: &UnpackOpts,
) -> Result<()> {
    let mut visited = Vec::new();
    unpack_inner(source, reference, opts, &opts.filters, &mut visited).await
}

async fn unpack_inner(
    source: &impl ModelSource,
    reference: &Reference,
    opts: &UnpackOpts,
    filters: &[FilterConf],
    visited: &mut Vec<String>,
) -> Result<()> {
    let desc = source
        .resolve(reference)
        .await
        .with_context(|| format!("resolve {reference}"))?;
    let manifest = source
        .manifest(reference, &desc)
        .await
        .with_context(|| format!("fetch manifest for {reference}"))?;
    let kitfile = resolver::load_kitfile(source, reference, &manifest).await?;

    // Ancestors first: their model layers land before this kit's own files.
    if filter::admits_model(filters) {
        if let Some(parent_ref) = kitfile.model_parent()? {
            let parent_key = parent_ref.to_string();
            if visited.iter().any(|seen| seen == &parent_key) {
                Err(Error::CycleDetected(parent_key))
                    .with_context(|| format!("unpacking {reference}"))?;
            }
            if visited.len() >= MAX_MODEL_REF_CHAIN {
                Err(Error::DepthExceeded)?;
            }

            visited.push(reference.to_string());
            let model_filters = vec![FilterConf::model_only()];
            let recurse: Pin<Box<dyn Future<Output = Result<()>> + '_>> = Box::pin(
                unpack_inner(source, &parent_ref, opts, &model_filters, visited),
            );
            recurse
                .await
                .with_context(|| format!("unpack parent kit {parent_ref}"))?;
            visited.pop();
        }
    }

    tokio::fs::create_dir_all(&opts.unpack_dir)
        .await
        .context("create unpack directory")?;

    if filter::admits_config(filters) {
        write_config(&kitfile, opts).await?;
    }

    let mut cursor = EntryCursor::default();
    for layer in &manifest.layers {
        let kind = layer.layer_kind()?;
        let entry = cursor
            .next(&kitfile, kind)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "manifest layer {} has no matching {kind} entry in the Kitfile",
                    layer.digest
                ))
            })?;

        if let Some(info) = &entry.layer_info {
            if info.digest != layer.digest {
                Err(Error::Integrity(format!(
                    "layer {} disagrees with the Kitfile's recorded digest {}",
                    layer.digest, info.digest
                )))?;
            }
        }

        if !filter::admits_entry(filters, kind, entry.name.as_deref(), &entry.path) {
            debug!(layer = %layer.digest, kind = %kind, "skip: filtered out");
            continue;
        }

        info!(layer = %layer.digest, kind = %kind, path = %entry.path, "unpacking layer");
        let stream = source
            .blob(reference, layer)
            .await
            .with_context(|| format!("fetch layer {}", layer.digest))?;
        extract_layer(stream, layer, &entry.path, opts)
            .await
            .with_context(|| format!("extract layer {}", layer.digest))?;
    }

    Ok(())
}

/// A layer's matching Kitfile entry, as picked by the alignment cursor.
struct AlignedEntry {
    path: String,
    name: Option<String>,
    layer_info: Option<crate::kitfile::LayerInfo>,
}

/// Per-kind indices into the Kitfile's declaration order.
///
/// The manifest's layer order decides *which layer* comes next; the
/// Kitfile's per-type order decides *which entry* it maps to. Each index
/// advances only when a layer of its kind is consumed.
#[derive(Debug, Default)]
struct EntryCursor {
    model: usize,
    part: usize,
    code: usize,
    prompt: usize,
    dataset: usize,
    docs: usize,
}

impl EntryCursor {
    fn next(&mut self, kitfile: &Kitfile, kind: LayerKind) -> Option<AlignedEntry> {
        match kind {
            LayerKind::Model => {
                let model = kitfile.model.as_ref().filter(|_| self.model == 0)?;
                self.model += 1;
                Some(AlignedEntry {
                    path: model.path.clone(),
                    name: Some(model.name.clone()).filter(|name| !name.is_empty()),
                    layer_info: model.layer_info.clone(),
                })
            }
            LayerKind::ModelPart => {
                let part = kitfile.model.as_ref()?.parts.get(self.part)?;
                self.part += 1;
                Some(AlignedEntry {
                    path: part.path.clone(),
                    name: Some(part.name.clone()).filter(|name| !name.is_empty()),
                    layer_info: part.layer_info.clone(),
                })
            }
            LayerKind::Code => {
                let code = kitfile.code.get(self.code)?;
                self.code += 1;
                Some(AlignedEntry {
                    path: code.path.clone(),
                    name: None,
                    layer_info: code.layer_info.clone(),
                })
            }
            LayerKind::Prompt => {
                let prompt = kitfile.prompts.get(self.prompt)?;
                self.prompt += 1;
                Some(AlignedEntry {
                    path: prompt.path.clone(),
                    name: None,
                    layer_info: prompt.layer_info.clone(),
                })
            }
            LayerKind::Dataset => {
                let dataset = kitfile.datasets.get(self.dataset)?;
                self.dataset += 1;
                Some(AlignedEntry {
                    path: dataset.path.clone(),
                    name: Some(dataset.name.clone()).filter(|name| !name.is_empty()),
                    layer_info: dataset.layer_info.clone(),
                })
            }
            LayerKind::Docs => {
                let docs = kitfile.docs.get(self.docs)?;
                self.docs += 1;
                Some(AlignedEntry {
                    path: docs.path.clone(),
                    name: None,
                    layer_info: docs.layer_info.clone(),
                })
            }
        }
    }
}

/// Write the canonical Kitfile, tolerating an identical existing file.
async fn write_config(kitfile: &Kitfile, opts: &UnpackOpts) -> Result<()> {
    let path = opts.unpack_dir.join(crate::KITFILE_NAME);
    let content = kitfile.to_yaml()?;

    match tokio::fs::read_to_string(&path).await {
        Ok(existing) if existing == content => {
            debug!("skip: Kitfile already up to date");
            return Ok(());
        }
        Ok(_) if !opts.overwrite => {
            Err(Error::Conflict(path.clone())).context("existing Kitfile differs")?
        }
        Ok(_) | Err(_) => {}
    }

    tokio::fs::write(&path, content)
        .await
        .context("write Kitfile")
}

/// Extract one layer's payload under the unpack root.
async fn extract_layer(
    stream: ByteStream,
    layer: &Descriptor,
    entry_path: &str,
    opts: &UnpackOpts,
) -> Result<()> {
    let media_type = layer.parsed_media_type()?;
    let stream = transform::decompress(stream, media_type.compression());

    // Raw ModelPack layers carry the file bytes unframed.
    if media_type.format() == Format::Raw {
        let out = paths::verify_subpath(&opts.unpack_dir, Path::new(entry_path)).await?;
        let metadata = file_metadata_of(layer);
        return write_file(
            stream_reader(stream),
            &out,
            metadata.map(|m| m.mode).unwrap_or(0o644),
            opts,
        )
        .await;
    }

    // A layer packed from a single file holds one tar entry, written at the
    // entry path itself rather than treated as a directory root.
    let single_file = layer.annotation(annotations::FILE_METADATA).is_some();

    let mut archive = tokio_tar::Archive::new(stream_reader(stream));
    let mut entries = archive.entries().context("read layer tar entries")?;
    let mut any_entry = false;

    while let Some(entry) = entries.next().await {
        let mut entry = entry.map_err(crate::error::restore_io).context("read tar entry")?;
        any_entry = true;

        let rel = entry.path().context("read tar entry path")?.into_owned();
        let header_type = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o644);

        let candidate = if single_file {
            PathBuf::from(entry_path)
        } else {
            Path::new(entry_path).join(&rel)
        };
        let out = paths::verify_subpath(&opts.unpack_dir, &candidate).await?;

        match header_type {
            tokio_tar::EntryType::Directory => {
                if out.exists() && !out.is_dir() {
                    Err(Error::Conflict(out.clone()))
                        .context("existing file blocks directory")?;
                }
                tokio::fs::create_dir_all(&out)
                    .await
                    .with_context(|| format!("create directory {}", out.display()))?;
                set_mode(&out, mode).await?;
            }
            tokio_tar::EntryType::Regular => {
                write_file(&mut entry, &out, mode, opts)
                    .await
                    .with_context(|| format!("write {}", out.display()))?;
            }
            other => {
                Err(Error::UnrecognizedTarType(other.as_byte()))
                    .with_context(|| format!("tar entry {}", rel.display()))?;
            }
        }
    }

    // An empty directory layer still materializes its root.
    if !any_entry && !single_file {
        let out = paths::verify_subpath(&opts.unpack_dir, Path::new(entry_path)).await?;
        tokio::fs::create_dir_all(&out)
            .await
            .context("create empty layer directory")?;
    }

    Ok(())
}

fn stream_reader(stream: ByteStream) -> impl tokio::io::AsyncRead + Unpin + Send {
    StreamReader::new(stream)
}

fn file_metadata_of(layer: &Descriptor) -> Option<crate::oci::FileMetadata> {
    layer
        .annotation(annotations::FILE_METADATA)
        .and_then(|json| serde_json::from_str(json).ok())
}

/// Write one output file with the conflict semantics of the unpack options.
///
/// A partially-written file is removed if the write is interrupted, so
/// cancellation never leaves torn output behind.
async fn write_file(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    out: &Path,
    mode: u32,
    opts: &UnpackOpts,
) -> Result<()> {
    if out.exists() {
        if opts.ignore_existing {
            debug!(path = ?out, "skip: file exists");
            return Ok(());
        }
        if !opts.overwrite {
            Err(Error::Conflict(out.to_path_buf()))?;
        }
    }

    if let Some(parent) = out.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }

    let mut guard = PartialFile::begin(out);
    let mut file = tokio::fs::File::create(out)
        .await
        .context("create output file")?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(crate::error::restore_io)
        .context("stream file contents")?;
    file.flush().await.context("flush output file")?;
    drop(file);

    set_mode(out, mode).await?;
    guard.commit();
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .context("set permissions")
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Removes a partially-written file unless committed.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn begin(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn commit(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
