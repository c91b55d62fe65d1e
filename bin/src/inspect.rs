use std::str::FromStr;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use kitops_lib::{ops, Reference};

use crate::StoreOpts;

#[derive(Debug, Parser)]
pub struct Options {
    /// ModelKit to inspect
    #[arg(value_parser = Reference::from_str)]
    reference: Reference,

    #[command(flatten)]
    store: StoreOpts,
}

pub async fn main(opts: Options) -> Result<()> {
    let store = opts.store.open()?;
    let (manifest, kitfile) = ops::inspect(&store, &opts.reference)
        .await
        .with_context(|| format!("inspect {}", opts.reference))?;

    let rendered = serde_json::json!({
        "manifest": manifest,
        "kitfile": kitfile,
    });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}
