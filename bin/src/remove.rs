use std::str::FromStr;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use kitops_lib::{ops, Reference};

use crate::{RemoteOpts, StoreOpts};

#[derive(Debug, Parser)]
pub struct Options {
    /// ModelKit or tag to remove
    #[arg(value_parser = Reference::from_str)]
    reference: Reference,

    /// Remove the manifest itself, dropping every tag that points at it
    #[arg(long, short)]
    force: bool,

    #[command(flatten)]
    store: StoreOpts,

    #[command(flatten)]
    remote: RemoteOpts,
}

pub async fn main(opts: Options) -> Result<()> {
    let store = opts.store.open()?;
    let credentials = opts.remote.credentials();
    ops::remove(
        &store,
        &opts.reference,
        opts.force,
        &opts.remote.network(),
        Some(&credentials),
    )
    .await
    .with_context(|| format!("remove {}", opts.reference))
}
