use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use kitops_lib::{
    mediatype::Compression,
    pack::{pack, PackOpts},
};
use tracing::info;

use crate::StoreOpts;

#[derive(Debug, Parser)]
pub struct Options {
    /// Directory to pack
    #[arg(default_value = ".")]
    context_dir: PathBuf,

    /// Reference to store the result under (e.g. my-model:v1)
    #[arg(long, short)]
    tag: Option<String>,

    /// Path to the Kitfile, relative to the context directory
    #[arg(long, short = 'f')]
    kitfile: Option<PathBuf>,

    /// Layer compression: none, gzip, or gzipFastest
    #[arg(long, default_value = "gzip", value_parser = Compression::from_user)]
    compression: Compression,

    /// Emit CNCF ModelPack media types instead of KitOps ones
    #[arg(long)]
    modelpack: bool,

    /// Preserve source file mtimes instead of zeroing them
    #[arg(long)]
    preserve_mtimes: bool,

    #[command(flatten)]
    store: StoreOpts,
}

pub async fn main(opts: Options) -> Result<()> {
    let store = opts.store.open()?;
    let desc = pack(
        &store,
        PackOpts::builder()
            .context_dir(opts.context_dir)
            .maybe_kitfile_path(opts.kitfile)
            .maybe_tag(opts.tag)
            .compression(opts.compression)
            .use_modelpack(opts.modelpack)
            .normalize_mtimes(!opts.preserve_mtimes)
            .build(),
    )
    .await
    .context("pack modelkit")?;

    info!(digest = %desc.digest, "packed");
    println!("{}", desc.digest);
    Ok(())
}
