use clap::Parser;
use color_eyre::eyre::Result;
use kitops_lib::ops;

use crate::StoreOpts;

#[derive(Debug, Parser)]
pub struct Options {
    /// Emit the listing as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    store: StoreOpts,
}

pub async fn main(opts: Options) -> Result<()> {
    let store = opts.store.open()?;
    let infos = ops::list(&store).await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }

    for info in infos {
        let tags = if info.tags.is_empty() {
            "<untagged>".to_string()
        } else {
            info.tags.join(", ")
        };
        println!(
            "{}\t{}\t{}\t{} bytes\t[{}]",
            info.repository,
            tags,
            info.digest,
            info.size,
            info.layers.join(", "),
        );
    }
    Ok(())
}
