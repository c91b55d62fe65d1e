use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{bail, Context, Result};
use kitops_lib::{kitfile::Kitfile, KITFILE_NAME};
use tracing::info;

#[derive(Debug, Parser)]
pub struct Options {
    /// Directory to scan for model files, datasets, code, and docs
    #[arg(default_value = ".")]
    context_dir: PathBuf,

    /// Package name for the generated Kitfile
    #[arg(long, short)]
    name: Option<String>,

    /// Overwrite an existing Kitfile
    #[arg(long, short)]
    overwrite: bool,
}

pub async fn main(opts: Options) -> Result<()> {
    let target = opts.context_dir.join(KITFILE_NAME);
    if target.exists() && !opts.overwrite {
        bail!(
            "{} already exists; pass --overwrite to replace it",
            target.display()
        );
    }

    let name = match opts.name {
        Some(name) => name,
        None => opts
            .context_dir
            .canonicalize()
            .context("resolve context directory")?
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "my-model".to_string()),
    };

    let kitfile = Kitfile::from_directory(&opts.context_dir, &name)
        .await
        .context("scan context directory")?;
    tokio::fs::write(&target, kitfile.to_yaml()?)
        .await
        .context("write Kitfile")?;

    info!(path = ?target, "generated Kitfile");
    println!("{}", target.display());
    Ok(())
}
