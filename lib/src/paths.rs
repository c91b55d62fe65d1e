//! Subpath verification: keeping packed and unpacked files inside their
//! declared roots, with symlinks resolved.

use std::path::{Component, Path, PathBuf};

use color_eyre::{eyre::Context, Result};
use tap::Pipe;

use crate::error::Error;

/// Whether a relative path stays inside its root lexically: no root, no
/// prefix, and no `..` that climbs above the starting point.
pub fn is_local(path: &Path) -> bool {
    let mut depth = 0i32;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return false,
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
        }
        if depth < 0 {
            return false;
        }
    }
    true
}

/// Join `candidate` onto `root` and verify the result stays inside `root`
/// after resolving symlinks. Returns the joined (unresolved) path, which may
/// not exist yet.
///
/// The check resolves the deepest *existing* ancestor of the joined path
/// canonically and compares it against the canonical root, so a symlink
/// planted anywhere along the way cannot redirect writes outside the root.
pub async fn verify_subpath(root: &Path, candidate: &Path) -> Result<PathBuf> {
    if !is_local(candidate) {
        Err(Error::PathEscape(candidate.to_path_buf()))?;
    }

    let root_resolved = tokio::fs::canonicalize(root)
        .await
        .with_context(|| format!("resolve root {}", root.display()))?;
    let joined = root.join(candidate);

    // Walk up to the deepest ancestor that exists and resolve it; everything
    // below it is yet to be created and was already checked lexically.
    let mut existing = joined.clone();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent.to_path_buf(),
            None => Err(Error::PathEscape(candidate.to_path_buf()))?,
        }
    }

    let resolved = tokio::fs::canonicalize(&existing)
        .await
        .with_context(|| format!("resolve {}", existing.display()))?;
    if !resolved.starts_with(&root_resolved) {
        Err(Error::PathEscape(candidate.to_path_buf()))?;
    }

    joined.pipe(Ok)
}
