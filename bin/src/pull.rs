use std::str::FromStr;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use kitops_lib::{ops, Reference};

use crate::{RemoteOpts, StoreOpts};

#[derive(Debug, Parser)]
pub struct Options {
    /// ModelKit to pull (e.g. ghcr.io/jozu/my-model:v1)
    #[arg(value_parser = Reference::from_str)]
    reference: Reference,

    #[command(flatten)]
    store: StoreOpts,

    #[command(flatten)]
    remote: RemoteOpts,
}

pub async fn main(opts: Options) -> Result<()> {
    let store = opts.store.open()?;
    let credentials = opts.remote.credentials();
    let desc = ops::pull(
        &store,
        &opts.reference,
        &opts.remote.network(),
        Some(&credentials),
    )
    .await
    .with_context(|| format!("pull {}", opts.reference))?;

    println!("{}", desc.digest);
    Ok(())
}
