use clap::Parser;
use color_eyre::eyre::{Context, Result};

use crate::StoreOpts;

#[derive(Debug, Parser)]
pub struct Options {
    /// Repository to verify (e.g. jozu/my-model)
    repository: String,

    #[command(flatten)]
    store: StoreOpts,
}

pub async fn main(opts: Options) -> Result<()> {
    let store = opts.store.open()?;
    let verified = store
        .fsck(&opts.repository)
        .await
        .with_context(|| format!("verify {}", opts.repository))?;

    println!("{verified} blobs verified");
    Ok(())
}
