#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::path::PathBuf;

use clap::{
    builder::{styling::AnsiColor, Styles},
    Args, Parser,
};
use color_eyre::eyre::{Context, Result};
use kitops_lib::{store::Store, CredentialsStore, NetworkOpts};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{self, prelude::*};

mod init;
mod inspect;
mod list;
mod pack;
mod pull;
mod push;
mod remove;
mod unpack;
mod verify;

#[derive(Debug, Parser)]
#[command(version, about, styles = style())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser)]
enum Commands {
    /// Generate a Kitfile from a directory scan
    Init(init::Options),

    /// Pack a context directory into the local store
    Pack(pack::Options),

    /// Unpack a ModelKit into a directory
    Unpack(unpack::Options),

    /// Push a ModelKit to a remote registry
    Push(push::Options),

    /// Pull a ModelKit (and its parents) from a remote registry
    Pull(pull::Options),

    /// List ModelKits in the local store
    List(list::Options),

    /// Remove a ModelKit or tag
    Remove(remove::Options),

    /// Print a ModelKit's manifest and Kitfile
    Inspect(inspect::Options),

    /// Digest-check every blob of a repository in the local store
    Verify(verify::Options),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match Cli::parse().command {
        Commands::Init(opts) => init::main(opts).await,
        Commands::Pack(opts) => pack::main(opts).await,
        Commands::Unpack(opts) => unpack::main(opts).await,
        Commands::Push(opts) => push::main(opts).await,
        Commands::Pull(opts) => pull::main(opts).await,
        Commands::List(opts) => list::main(opts).await,
        Commands::Remove(opts) => remove::main(opts).await,
        Commands::Inspect(opts) => inspect::main(opts).await,
        Commands::Verify(opts) => verify::main(opts).await,
    }
}

fn style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default())
        .invalid(AnsiColor::Red.on_default())
        .valid(AnsiColor::Blue.on_default())
}

/// Flags shared by every command that touches the local store.
#[derive(Debug, Args)]
pub struct StoreOpts {
    /// Root directory of the local store (defaults to ~/.kitops)
    #[arg(long)]
    store: Option<PathBuf>,
}

impl StoreOpts {
    pub fn open(&self) -> Result<Store> {
        let root = match &self.store {
            Some(root) => root.clone(),
            None => kitops_lib::default_store_root().context("locate local store")?,
        };
        Ok(Store::open(root))
    }
}

/// Flags shared by every command that talks to a remote registry.
#[derive(Debug, Args)]
pub struct RemoteOpts {
    /// Use plain HTTP instead of TLS
    #[arg(long)]
    plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure_skip_tls_verify: bool,

    /// Additional PEM certificates to trust
    #[arg(long)]
    tls_trust_cert: Vec<PathBuf>,

    /// Client certificate for mutual TLS, PEM
    #[arg(long, requires = "client_key")]
    client_cert: Option<PathBuf>,

    /// Client key for mutual TLS, PEM
    #[arg(long, requires = "client_cert")]
    client_key: Option<PathBuf>,

    /// Proxy URL to route requests through
    #[arg(long)]
    proxy: Option<String>,
}

impl RemoteOpts {
    pub fn network(&self) -> NetworkOpts {
        NetworkOpts::builder()
            .plain_http(self.plain_http)
            .tls_verify(!self.insecure_skip_tls_verify)
            .tls_trust_cert_paths(self.tls_trust_cert.clone())
            .maybe_client_cert_path(self.client_cert.clone())
            .maybe_client_key_path(self.client_key.clone())
            .maybe_proxy(self.proxy.clone())
            .build()
    }

    /// Credentials from the environment; a real credential-store integration
    /// plugs in behind the same trait.
    pub fn credentials(&self) -> EnvCredentials {
        EnvCredentials
    }
}

/// Reads `KITOPS_USER` / `KITOPS_PASSWORD` from the environment.
#[derive(Debug)]
pub struct EnvCredentials;

impl CredentialsStore for EnvCredentials {
    fn get(&self, _host: &str) -> Option<(String, String)> {
        let user = std::env::var("KITOPS_USER").ok()?;
        let password = std::env::var("KITOPS_PASSWORD").ok()?;
        Some((user, password))
    }
}
