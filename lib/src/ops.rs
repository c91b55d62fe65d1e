//! High-level operations over the store and registry: push, pull, resolve,
//! remove, list. Pack and unpack live in their own modules.

use color_eyre::{eyre::Context, Result};
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument};

use crate::{
    error::Error,
    oci::{Descriptor, Manifest},
    registry::Registry,
    resolver,
    store::{ManifestInfo, Store},
    CredentialsStore, NetworkOpts, Reference, SubReference, MAX_MODEL_REF_CHAIN,
};

/// Connect a registry client for a reference with shared defaults.
async fn connect(
    reference: &Reference,
    network: &NetworkOpts,
    credentials: Option<&dyn CredentialsStore>,
) -> Result<Registry> {
    Registry::builder()
        .reference(reference)
        .network(network.clone())
        .maybe_credentials(credentials)
        .build()
        .await
        .with_context(|| format!("connect to registry {}", reference.registry))
}

/// Push a locally stored ModelKit to its remote registry.
///
/// Blobs the registry already holds are skipped; the manifest is put last so
/// the remote reference only appears once its content is complete.
#[instrument(skip(store, network, credentials))]
pub async fn push(
    store: &Store,
    reference: &Reference,
    network: &NetworkOpts,
    credentials: Option<&dyn CredentialsStore>,
) -> Result<Descriptor> {
    if reference.is_local() {
        Err(Error::InvalidInput(format!(
            "cannot push {reference}: no remote registry in the reference"
        )))?;
    }

    let desc = store
        .resolve(reference)
        .await
        .with_context(|| format!("resolve {reference} in the local store"))?;
    let manifest = store.read_manifest(&reference.repository, &desc).await?;
    let registry = connect(reference, network, credentials).await?;

    for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        let source = store.blob_path(&reference.repository, &blob.digest);
        registry
            .push_blob(blob, &source)
            .await
            .with_context(|| format!("push blob {}", blob.digest))?;
    }

    let pushed = registry
        .put_manifest(&manifest, &reference.sub_reference)
        .await?;
    info!(manifest = %pushed.digest, "pushed modelkit");
    Ok(pushed)
}

/// Pull a ModelKit (and the parent chain it references) into the local store.
#[instrument(skip(store, network, credentials))]
pub async fn pull(
    store: &Store,
    reference: &Reference,
    network: &NetworkOpts,
    credentials: Option<&dyn CredentialsStore>,
) -> Result<Descriptor> {
    let mut visited: Vec<String> = Vec::new();
    let mut queue = vec![reference.clone()];
    let mut first: Option<Descriptor> = None;

    while let Some(next) = queue.pop() {
        let key = next.to_string();
        if visited.iter().any(|seen| seen == &key) {
            Err(Error::CycleDetected(key.clone()))?;
        }
        if visited.len() >= MAX_MODEL_REF_CHAIN {
            Err(Error::DepthExceeded)?;
        }
        visited.push(key);

        let desc = pull_one(store, &next, network, credentials).await?;
        let manifest = store.read_manifest(&next.repository, &desc).await?;
        if first.is_none() {
            first = Some(desc);
        }

        let kitfile = resolver::load_kitfile(store, &next, &manifest).await?;
        if let Some(parent) = kitfile.model_parent()? {
            debug!(parent = %parent, "queueing parent kit");
            queue.push(parent);
        }
    }

    first.ok_or_else(|| Error::NotFound(format!("manifest for {reference}")).into())
}

async fn pull_one(
    store: &Store,
    reference: &Reference,
    network: &NetworkOpts,
    credentials: Option<&dyn CredentialsStore>,
) -> Result<Descriptor> {
    let registry = connect(reference, network, credentials).await?;
    let desc = registry.resolve(&reference.sub_reference).await?;
    let manifest = registry.fetch_manifest(&desc).await?;

    for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        if store
            .blob_path(&reference.repository, &blob.digest)
            .exists()
        {
            debug!(digest = %blob.digest, "skip: blob already in store");
            continue;
        }
        let stream = registry
            .fetch_blob(blob)
            .await
            .with_context(|| format!("fetch blob {}", blob.digest))?;
        store
            .push_blob(&reference.repository, blob, StreamReader::new(stream))
            .await
            .with_context(|| format!("store blob {}", blob.digest))?;
    }

    let tag = match &reference.sub_reference {
        SubReference::Tag(tag) => Some(tag.as_str()),
        _ => None,
    };
    let stored = store
        .put_manifest(&reference.repository, &manifest, tag)
        .await?;
    info!(manifest = %stored.digest, "pulled modelkit");
    Ok(stored)
}

/// Resolve a reference to its manifest descriptor, locally or remotely.
#[instrument(skip(store, network, credentials))]
pub async fn resolve(
    store: &Store,
    reference: &Reference,
    network: &NetworkOpts,
    credentials: Option<&dyn CredentialsStore>,
) -> Result<Descriptor> {
    if reference.is_local() {
        return store.resolve(reference).await;
    }
    let registry = connect(reference, network, credentials).await?;
    registry.resolve(&reference.sub_reference).await
}

/// Remove a ModelKit.
///
/// A digest reference (or a tag with `force`) removes the manifest and every
/// tag pointing at it; a tag without `force` removes only the tag.
#[instrument(skip(store, network, credentials))]
pub async fn remove(
    store: &Store,
    reference: &Reference,
    force: bool,
    network: &NetworkOpts,
    credentials: Option<&dyn CredentialsStore>,
) -> Result<()> {
    if reference.is_local() {
        return remove_local(store, reference, force).await;
    }

    let registry = connect(reference, network, credentials).await?;
    match &reference.sub_reference {
        SubReference::Digest(digest) => {
            registry
                .delete_manifest(&SubReference::Digest(digest.clone()))
                .await
        }
        SubReference::Tag(tag) if force => {
            // Force removal deletes the manifest itself, which drops every
            // tag referencing it server-side.
            let desc = registry.resolve(&reference.sub_reference).await?;
            registry
                .delete_manifest(&SubReference::Digest(desc.digest))
                .await
                .with_context(|| format!("remove manifest for tag {tag}"))
        }
        SubReference::Tag(_) => registry.delete_manifest(&reference.sub_reference).await,
        SubReference::Bare => Err(Error::InvalidInput(
            "a tag or digest is required to remove a modelkit".to_string(),
        ))?,
    }
}

async fn remove_local(store: &Store, reference: &Reference, force: bool) -> Result<()> {
    match &reference.sub_reference {
        SubReference::Digest(_) => {
            let desc = store.resolve(reference).await?;
            store.delete(&reference.repository, &desc).await
        }
        SubReference::Tag(tag) => {
            if force {
                let desc = store.resolve(reference).await?;
                store.delete(&reference.repository, &desc).await
            } else {
                store.untag(&reference.repository, tag).await
            }
        }
        SubReference::Bare => Err(Error::InvalidInput(
            "a tag or digest is required to remove a modelkit".to_string(),
        ))?,
    }
}

/// Enumerate the local store.
pub async fn list(store: &Store) -> Result<Vec<ManifestInfo>> {
    store.list().await
}

/// Fetch the manifest and embedded Kitfile of a reference, for inspection.
pub async fn inspect(
    store: &Store,
    reference: &Reference,
) -> Result<(Manifest, crate::kitfile::Kitfile)> {
    let desc = store.resolve(reference).await?;
    let manifest = store.read_manifest(&reference.repository, &desc).await?;
    let kitfile = resolver::load_kitfile(store, reference, &manifest).await?;
    Ok((manifest, kitfile))
}
