//! The local content-addressed store: an OCI Image Layout per repository.
//!
//! ```text
//! <root>/<repository>/
//!   oci-layout            # {"imageLayoutVersion":"1.0.0"}
//!   index.json            # manifest descriptors; tags via refName annotation
//!   blobs/sha256/<hex>    # addressed by digest
//! ```
//!
//! The store is single-writer per repository: mutators take a `.lock` file
//! and replace `index.json` atomically (temp-then-rename), so readers never
//! observe a torn index. Blob ingestion writes to a distinct temp name and
//! renames into place once the digest is confirmed, which also makes
//! concurrent packs of different content safe.

use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context as TaskContext, Poll},
};

use color_eyre::{
    eyre::{bail, Context},
    Result,
};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
    error::Error,
    oci::{annotations, Descriptor, Index, Manifest, OCI_LAYOUT},
    transform::VerifyStream,
    ByteStream, Digest, ModelSource, Reference, SubReference,
};

const BLOB_DIR: &str = "blobs/sha256";
const INDEX_FILE: &str = "index.json";
const LAYOUT_FILE: &str = "oci-layout";
const LOCK_FILE: &str = ".lock";

/// How long a mutator waits on the advisory lock before giving up.
const LOCK_ATTEMPTS: u32 = 100;
const LOCK_RETRY_MS: u64 = 50;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The local store rooted at a directory, holding one OCI image layout per
/// repository.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

/// Summary of one stored manifest, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestInfo {
    pub repository: String,
    pub digest: Digest,
    pub tags: Vec<String>,
    pub size: i64,
    pub layers: Vec<String>,
}

impl Store {
    /// Open a store rooted at the given directory. Repositories are created
    /// lazily on first write; opening is idempotent and does not touch disk.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, repository: &str) -> PathBuf {
        self.root.join(repository)
    }

    /// The on-disk path of a blob within a repository.
    pub fn blob_path(&self, repository: &str, digest: &Digest) -> PathBuf {
        self.repo_dir(repository).join(BLOB_DIR).join(digest.as_hex())
    }

    /// Initialize a repository's layout if missing. Idempotent.
    pub async fn ensure_repo(&self, repository: &str) -> Result<PathBuf> {
        let dir = self.repo_dir(repository);
        tokio::fs::create_dir_all(dir.join(BLOB_DIR))
            .await
            .with_context(|| format!("create repository {repository}"))?;

        let layout = dir.join(LAYOUT_FILE);
        if !layout.exists() {
            atomic_write(&layout, OCI_LAYOUT.as_bytes())
                .await
                .context("write oci-layout")?;
        }

        let index = dir.join(INDEX_FILE);
        if !index.exists() {
            let bytes = serde_json::to_vec(&Index::empty()).context("serialize empty index")?;
            atomic_write(&index, &bytes).await.context("write index.json")?;
        }

        Ok(dir)
    }

    /// Begin streaming a new blob into a repository.
    ///
    /// The blob's digest is computed as bytes flow through; call
    /// [`BlobSink::finish`] to name and place it.
    pub async fn blob_sink(&self, repository: &str) -> Result<BlobSink> {
        let dir = self.ensure_repo(repository).await?;
        BlobSink::create(dir.join(BLOB_DIR)).await
    }

    /// Ingest a blob from a reader, verifying it against the descriptor.
    ///
    /// A blob that already exists under the same digest is left untouched and
    /// the reader is not consumed.
    pub async fn push_blob(
        &self,
        repository: &str,
        desc: &Descriptor,
        reader: impl AsyncRead + Unpin,
    ) -> Result<()> {
        self.ensure_repo(repository).await?;
        let target = self.blob_path(repository, &desc.digest);
        if target.exists() {
            debug!(digest = %desc.digest, "skip: blob already stored");
            return Ok(());
        }

        let mut sink = self.blob_sink(repository).await?;
        let mut reader = reader;
        tokio::io::copy(&mut reader, &mut sink)
            .await
            .context("stream blob")?;
        let (digest, size) = sink.finish().await?;

        // The stray blob is still correctly named by its own digest; the
        // next delete's sweep collects it.
        if digest != desc.digest {
            Err(Error::Integrity(format!(
                "blob digest mismatch: expected {}, got {digest}",
                desc.digest
            )))?;
        }
        if size != desc.size {
            Err(Error::Integrity(format!(
                "blob size mismatch: expected {}, got {size}",
                desc.size
            )))?;
        }
        Ok(())
    }

    /// Ingest an in-memory blob, returning its digest and size.
    pub async fn push_bytes(&self, repository: &str, bytes: &[u8]) -> Result<(Digest, i64)> {
        let mut sink = self.blob_sink(repository).await?;
        sink.write_all(bytes).await.context("write blob bytes")?;
        sink.finish().await
    }

    /// Stream a blob's bytes, verifying digest and size on the fly.
    ///
    /// Tampered bytes surface as an [`Error::Integrity`] failure at end of
    /// stream.
    pub async fn fetch_blob(&self, repository: &str, desc: &Descriptor) -> Result<ByteStream> {
        let path = self.blob_path(repository, &desc.digest);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {}", desc.digest)))?
            }
            Err(err) => Err(err).with_context(|| format!("open blob {}", desc.digest))?,
        };
        let stream = ReaderStream::new(file);
        Ok(Box::pin(VerifyStream::new(
            stream,
            desc.digest.clone(),
            desc.size,
        )))
    }

    /// Read and verify a whole blob into memory.
    pub async fn fetch_blob_bytes(&self, repository: &str, desc: &Descriptor) -> Result<Vec<u8>> {
        let stream = self.fetch_blob(repository, desc).await?;
        crate::transform::collect(stream).await
    }

    /// Read, verify, and parse a stored manifest.
    pub async fn read_manifest(&self, repository: &str, desc: &Descriptor) -> Result<Manifest> {
        let bytes = self.fetch_blob_bytes(repository, desc).await?;
        Manifest::parse(&bytes)
    }

    /// Resolve a reference to its manifest descriptor from the index.
    ///
    /// A bare reference resolves to the `latest` tag, or to the sole manifest
    /// if the repository holds exactly one.
    pub async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        let index = self.read_index(&reference.repository).await?;
        let found = match &reference.sub_reference {
            SubReference::Tag(tag) => index.find_tag(tag),
            SubReference::Digest(digest) => index.find_digest(digest),
            SubReference::Bare => index.find_tag("latest").or_else(|| {
                match index.manifests.as_slice() {
                    [only] => Some(only),
                    _ => None,
                }
            }),
        };
        found
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("manifest for {reference}")).into())
    }

    /// Store a manifest blob and upsert it into the index, optionally tagged.
    pub async fn put_manifest(
        &self,
        repository: &str,
        manifest: &Manifest,
        tag: Option<&str>,
    ) -> Result<Descriptor> {
        let bytes = manifest.to_canonical_json()?;
        let desc = manifest.descriptor()?;

        let dir = self.ensure_repo(repository).await?;
        self.push_blob(repository, &desc, bytes.as_slice()).await?;

        let _lock = RepoLock::acquire(&dir).await?;
        let mut index = self.read_index(repository).await?;
        upsert_manifest(&mut index, &desc, tag);
        self.write_index(repository, &index).await?;
        Ok(desc)
    }

    /// Point a tag at an already-stored manifest. At most one manifest holds
    /// a given tag within a repository.
    pub async fn tag(&self, repository: &str, manifest_desc: &Descriptor, tag: &str) -> Result<()> {
        let blob = self.blob_path(repository, &manifest_desc.digest);
        if !blob.exists() {
            Err(Error::NotFound(format!("manifest {}", manifest_desc.digest)))?;
        }

        let dir = self.repo_dir(repository);
        let _lock = RepoLock::acquire(&dir).await?;
        let mut index = self.read_index(repository).await?;
        upsert_manifest(&mut index, manifest_desc, Some(tag));
        self.write_index(repository, &index).await
    }

    /// Remove a tag entry. Blobs are untouched.
    pub async fn untag(&self, repository: &str, tag: &str) -> Result<()> {
        let dir = self.repo_dir(repository);
        if !dir.join(INDEX_FILE).exists() {
            Err(Error::NotFound(format!("repository {repository}")))?;
        }
        let _lock = RepoLock::acquire(&dir).await?;
        let mut index = self.read_index(repository).await?;

        let before = index.manifests.len();
        index
            .manifests
            .retain(|desc| desc.annotation(annotations::REF_NAME) != Some(tag));
        if index.manifests.len() == before {
            Err(Error::NotFound(format!("tag {tag} in {repository}")))?;
        }
        self.write_index(repository, &index).await
    }

    /// Remove a manifest: drop every tag entry pointing at it, then sweep
    /// blobs no longer referenced by any remaining manifest.
    pub async fn delete(&self, repository: &str, manifest_desc: &Descriptor) -> Result<()> {
        let dir = self.repo_dir(repository);
        if !dir.join(INDEX_FILE).exists() {
            Err(Error::NotFound(format!("repository {repository}")))?;
        }
        let _lock = RepoLock::acquire(&dir).await?;
        let mut index = self.read_index(repository).await?;

        let before = index.manifests.len();
        index
            .manifests
            .retain(|desc| desc.digest != manifest_desc.digest);
        if index.manifests.len() == before {
            Err(Error::NotFound(format!("manifest {}", manifest_desc.digest)))?;
        }
        self.write_index(repository, &index).await?;

        self.sweep_blobs(repository, &index).await
    }

    /// Enumerate all manifests across all repositories in the store.
    pub async fn list(&self) -> Result<Vec<ManifestInfo>> {
        let mut infos = Vec::new();
        for repository in self.repositories().await? {
            infos.extend(self.list_repository(&repository).await?);
        }
        Ok(infos)
    }

    /// Enumerate the manifests of one repository with their tags.
    pub async fn list_repository(&self, repository: &str) -> Result<Vec<ManifestInfo>> {
        let index = self.read_index(repository).await?;
        let mut seen = BTreeSet::new();
        let mut infos = Vec::new();

        for desc in &index.manifests {
            if !seen.insert(desc.digest.as_hex()) {
                continue;
            }
            let manifest = match self.read_manifest(repository, desc).await {
                Ok(manifest) => manifest,
                Err(err) => {
                    warn!(digest = %desc.digest, ?err, "skip: unreadable manifest");
                    continue;
                }
            };
            let size = manifest.config.size
                + manifest.layers.iter().map(|layer| layer.size).sum::<i64>();
            let layers = manifest
                .layers
                .iter()
                .map(|layer| {
                    layer
                        .parsed_media_type()
                        .map(|media| media.user_string().to_string())
                        .unwrap_or_else(|_| layer.media_type.clone())
                })
                .collect();
            infos.push(ManifestInfo {
                repository: repository.to_string(),
                digest: desc.digest.clone(),
                tags: index.tags_of(&desc.digest).iter().map(|t| t.to_string()).collect(),
                size,
                layers,
            });
        }
        Ok(infos)
    }

    /// Digest-verify every blob in a repository; returns the count verified.
    pub async fn fsck(&self, repository: &str) -> Result<u32> {
        let blob_dir = self.repo_dir(repository).join(BLOB_DIR);
        let mut verified = 0u32;
        let mut entries = tokio::fs::read_dir(&blob_dir)
            .await
            .with_context(|| format!("read blobs of {repository}"))?;

        while let Some(entry) = entries.next_entry().await.context("read blob entry")? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type().await.context("blob file type")?.is_file() {
                continue;
            }
            // In-flight ingest temp files are not blobs yet.
            if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }

            let mut file = tokio::fs::File::open(entry.path()).await.context("open blob")?;
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                use tokio::io::AsyncReadExt;
                let n = file.read(&mut buf).await.context("read blob")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let actual = hex::encode(hasher.finalize());
            if actual != name {
                Err(Error::Integrity(format!(
                    "blob {name} hashes to {actual}"
                )))?;
            }
            verified += 1;
        }
        Ok(verified)
    }

    async fn repositories(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            if dir.join(INDEX_FILE).exists() && dir != self.root {
                let repository = dir
                    .strip_prefix(&self.root)
                    .context("repository path under root")?
                    .to_string_lossy()
                    .replace('\\', "/");
                found.push(repository);
                continue;
            }
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => Err(err).with_context(|| format!("read {}", dir.display()))?,
            };
            while let Some(entry) = entries.next_entry().await.context("read store entry")? {
                if entry.file_type().await.context("store entry type")?.is_dir() {
                    pending.push(entry.path());
                }
            }
        }
        found.sort();
        Ok(found)
    }

    async fn read_index(&self, repository: &str) -> Result<Index> {
        let path = self.repo_dir(repository).join(INDEX_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("repository {repository}")))?
            }
            Err(err) => Err(err).with_context(|| format!("read index of {repository}"))?,
        };
        serde_json::from_slice(&bytes).context("parse index.json")
    }

    async fn write_index(&self, repository: &str, index: &Index) -> Result<()> {
        let path = self.repo_dir(repository).join(INDEX_FILE);
        let bytes = serde_json::to_vec(index).context("serialize index.json")?;
        atomic_write(&path, &bytes).await.context("replace index.json")
    }

    async fn sweep_blobs(&self, repository: &str, index: &Index) -> Result<()> {
        let mut referenced = BTreeSet::new();
        for desc in &index.manifests {
            referenced.insert(desc.digest.as_hex());
            let Ok(manifest) = self.read_manifest(repository, desc).await else {
                continue;
            };
            referenced.insert(manifest.config.digest.as_hex());
            for layer in &manifest.layers {
                referenced.insert(layer.digest.as_hex());
            }
        }

        let blob_dir = self.repo_dir(repository).join(BLOB_DIR);
        let mut entries = tokio::fs::read_dir(&blob_dir)
            .await
            .context("read blob directory")?;
        while let Some(entry) = entries.next_entry().await.context("read blob entry")? {
            let name = entry.file_name().to_string_lossy().to_string();
            // Leave in-flight ingest temp files to their writer.
            if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            if !referenced.contains(&name) {
                debug!(blob = %name, "sweep: unreferenced blob");
                tokio::fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("remove blob {name}"))?;
            }
        }
        Ok(())
    }
}

impl ModelSource for Store {
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        Store::resolve(self, reference).await
    }

    async fn manifest(&self, reference: &Reference, desc: &Descriptor) -> Result<Manifest> {
        self.read_manifest(&reference.repository, desc).await
    }

    async fn blob(&self, reference: &Reference, desc: &Descriptor) -> Result<ByteStream> {
        self.fetch_blob(&reference.repository, desc).await
    }
}

/// Replace a manifest entry in the index.
///
/// Tagging evicts any other holder of the tag and collapses an untagged
/// entry for the same digest; an untagged upsert is a no-op when the digest
/// is already present.
fn upsert_manifest(index: &mut Index, desc: &Descriptor, tag: Option<&str>) {
    match tag {
        Some(tag) => {
            index.manifests.retain(|existing| {
                existing.annotation(annotations::REF_NAME) != Some(tag)
                    && !(existing.digest == desc.digest
                        && existing.annotation(annotations::REF_NAME).is_none())
            });
            let mut entry = desc.clone();
            entry
                .annotations
                .insert(annotations::REF_NAME.to_string(), tag.to_string());
            index.manifests.push(entry);
        }
        None => {
            if index.find_digest(&desc.digest).is_none() {
                index.manifests.push(desc.clone());
            }
        }
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = path.with_extension(temp_name("tmp"));
    tokio::fs::write(&temp, bytes)
        .await
        .with_context(|| format!("write {}", temp.display()))?;
    tokio::fs::rename(&temp, path)
        .await
        .with_context(|| format!("replace {}", path.display()))
}

fn temp_name(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Advisory per-repository lock: a `.lock` file created exclusively,
/// removed on drop.
#[derive(Debug)]
struct RepoLock {
    path: PathBuf,
}

impl RepoLock {
    async fn acquire(repo_dir: &Path) -> Result<Self> {
        let path = repo_dir.join(LOCK_FILE);
        for _ in 0..LOCK_ATTEMPTS {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(std::time::Duration::from_millis(LOCK_RETRY_MS)).await;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("acquire lock {}", path.display()))
                }
            }
        }
        bail!("store repository is locked by another writer: {}", repo_dir.display());
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Streams a new blob into a repository: bytes are hashed and counted on the
/// way to a temp file, which is renamed to its digest name on
/// [`BlobSink::finish`].
#[derive(Debug)]
pub struct BlobSink {
    file: Option<tokio::fs::File>,
    temp_path: PathBuf,
    blob_dir: PathBuf,
    hasher: Sha256,
    size: u64,
}

impl BlobSink {
    async fn create(blob_dir: PathBuf) -> Result<Self> {
        let temp_path = blob_dir.join(temp_name("ingest"));
        let file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("create temp blob {}", temp_path.display()))?;
        Ok(Self {
            file: Some(file),
            temp_path,
            blob_dir,
            hasher: Sha256::new(),
            size: 0,
        })
    }

    /// Flush, name the blob by its digest, and move it into place.
    ///
    /// An existing blob with the same digest wins; the temp file is dropped.
    pub async fn finish(mut self) -> Result<(Digest, i64)> {
        let mut file = self.file.take().expect("blob sink finished twice");
        file.flush().await.context("flush blob")?;
        file.sync_all().await.context("sync blob")?;
        drop(file);

        let digest = Digest::from_hash(std::mem::take(&mut self.hasher).finalize().to_vec());
        let target = self.blob_dir.join(digest.as_hex());
        if target.exists() {
            tokio::fs::remove_file(&self.temp_path)
                .await
                .context("discard duplicate blob")?;
        } else {
            tokio::fs::rename(&self.temp_path, &target)
                .await
                .with_context(|| format!("place blob {digest}"))?;
        }
        Ok((digest, self.size as i64))
    }

    /// Abandon the ingest and remove the temp file.
    pub async fn discard(mut self) {
        self.file.take();
        let _ = tokio::fs::remove_file(&self.temp_path).await;
    }
}

impl Drop for BlobSink {
    fn drop(&mut self) {
        // Finish renames before dropping; anything else is an abandoned temp.
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

impl AsyncWrite for BlobSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let file = this.file.as_mut().expect("blob sink finished");
        match Pin::new(file).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.hasher.update(&buf[..written]);
                this.size += written as u64;
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(this.file.as_mut().expect("blob sink finished")).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(this.file.as_mut().expect("blob sink finished")).poll_shutdown(cx)
    }
}
