//! Shared fixtures for the integration suite.

use std::path::Path;

use async_tempfile::TempDir;
use color_eyre::Result;
use kitops_lib::{
    oci::{Descriptor, Manifest},
    store::Store,
    ByteStream, ModelSource, Reference,
};

/// A store in a fresh temp directory. Keep the temp dir alive for the test.
pub async fn temp_store() -> (TempDir, Store) {
    let tmp = TempDir::new().await.expect("create temp dir");
    let store = Store::open(tmp.dir_path());
    (tmp, store)
}

/// Write a file, creating parent directories as needed.
pub async fn write_file(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.expect("create parents");
    }
    tokio::fs::write(&path, contents).await.expect("write file");
}

/// Assert a report's chain carries the expected typed error.
#[macro_export]
macro_rules! assert_error_kind {
    ($report:expr, $pattern:pat) => {{
        let report = &$report;
        let found = kitops_lib::error::Error::find(report);
        assert!(
            matches!(found, Some($pattern)),
            "expected {}, got: {report:?}",
            stringify!($pattern),
        );
    }};
}

/// A [`ModelSource`] wrapper that records which blob digests were fetched,
/// so tests can observe exactly what an unpack read.
#[derive(Debug)]
pub struct CountingSource<'a> {
    inner: &'a Store,
    pub fetched: std::sync::Mutex<Vec<String>>,
}

impl<'a> CountingSource<'a> {
    pub fn new(inner: &'a Store) -> Self {
        Self {
            inner,
            fetched: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().expect("lock").clone()
    }
}

impl ModelSource for CountingSource<'_> {
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        self.inner.resolve(reference).await
    }

    async fn manifest(&self, reference: &Reference, desc: &Descriptor) -> Result<Manifest> {
        self.inner.read_manifest(&reference.repository, desc).await
    }

    async fn blob(&self, reference: &Reference, desc: &Descriptor) -> Result<ByteStream> {
        self.fetched
            .lock()
            .expect("lock")
            .push(desc.digest.to_string());
        self.inner.fetch_blob(&reference.repository, desc).await
    }
}

