//! `.kitignore` matching: which files the packer leaves out of a layer.
//!
//! The dialect is gitignore's: blank lines, `#` comments, `/` anchoring, `!`
//! negation, `**` recursion, with later rules overriding earlier ones. The
//! default set always ignores the Kitfile itself and the ignore file, and
//! those two cannot be negated back in.

use std::path::Path;

use color_eyre::{eyre::Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;

use crate::KITFILE_NAME;

/// The standard name for the ignore file inside a pack context.
pub const KITIGNORE_NAME: &str = ".kitignore";

/// A compiled `.kitignore` pattern set for one pack context.
#[derive(Debug)]
pub struct IgnoreSet {
    matcher: Gitignore,
}

impl IgnoreSet {
    /// Load the ignore set for a context directory.
    ///
    /// A missing `.kitignore` is fine; the defaults still apply. The Kitfile
    /// name is passed in because it can be overridden on the command line.
    pub fn load(context_dir: &Path, kitfile_name: &str) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(context_dir);

        let ignore_file = context_dir.join(KITIGNORE_NAME);
        if ignore_file.is_file() {
            if let Some(err) = builder.add(&ignore_file) {
                return Err(err).context("parse .kitignore");
            }
            debug!(path = ?ignore_file, "loaded ignore file");
        }

        // Appended last so file rules cannot negate them.
        builder
            .add_line(None, kitfile_name)
            .and_then(|builder| builder.add_line(None, KITIGNORE_NAME))
            .context("add default ignore rules")?;

        let matcher = builder.build().context("compile ignore rules")?;
        Ok(Self { matcher })
    }

    /// An ignore set with only the defaults, for contexts without a file.
    pub fn defaults() -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        builder
            .add_line(None, KITFILE_NAME)
            .and_then(|builder| builder.add_line(None, KITIGNORE_NAME))
            .context("add default ignore rules")?;
        let matcher = builder.build().context("compile ignore rules")?;
        Ok(Self { matcher })
    }

    /// Whether the given context-relative path is ignored.
    pub fn matches(&self, relative_path: &Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(relative_path, is_dir)
            .is_ignore()
    }
}
