use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use kitops_lib::{
    filter::FilterConf,
    unpack::{unpack, UnpackOpts},
    Reference,
};

use crate::StoreOpts;

#[derive(Debug, Parser)]
pub struct Options {
    /// ModelKit to unpack (e.g. my-model:v1)
    #[arg(value_parser = Reference::from_str)]
    reference: Reference,

    /// Directory to unpack into
    #[arg(default_value = ".")]
    unpack_dir: PathBuf,

    /// Only unpack matching layers (e.g. "model", "datasets:train")
    #[arg(long, short = 'F', value_parser = FilterConf::from_str)]
    filter: Vec<FilterConf>,

    /// Overwrite existing files
    #[arg(long, short)]
    overwrite: bool,

    /// Skip files that already exist
    #[arg(long)]
    ignore_existing: bool,

    #[command(flatten)]
    store: StoreOpts,
}

pub async fn main(opts: Options) -> Result<()> {
    let store = opts.store.open()?;
    let unpack_opts = UnpackOpts::builder()
        .unpack_dir(opts.unpack_dir)
        .filters(opts.filter)
        .overwrite(opts.overwrite)
        .ignore_existing(opts.ignore_existing)
        .build();

    unpack(&store, &opts.reference, &unpack_opts)
        .await
        .with_context(|| format!("unpack {}", opts.reference))
}
