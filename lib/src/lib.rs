#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

//! The ModelKit artifact engine.
//!
//! Packs AI/ML projects (model weights, datasets, code, prompts, docs) into
//! immutable, content-addressed OCI artifacts; stores them in a local OCI
//! image layout; and pushes/pulls them over the OCI Distribution v2 API.

use std::{future::Future, path::PathBuf, pin::Pin, str::FromStr};

use bon::Builder;
use color_eyre::{
    eyre::{bail, ensure, eyre, Context},
    Result, Section, SectionExt,
};
use derive_more::derive::{Debug, Display};
use futures_lite::Stream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tap::Pipe;

pub mod error;
pub mod filter;
pub mod ignore;
pub mod kitfile;
pub mod mediatype;
pub mod oci;
pub mod ops;
pub mod pack;
pub mod paths;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod transform;
pub mod unpack;

use error::Error;

/// The longest chain of parent-model references the engine will follow.
pub const MAX_MODEL_REF_CHAIN: usize = 10;

/// The default file name for a ModelKit manifest inside its context directory.
pub const KITFILE_NAME: &str = "Kitfile";

/// Users can set this environment variable to relocate the local store.
/// If not set, the default is `~/.kitops`.
pub const KITOPS_HOME_VAR: &str = "KITOPS_HOME";

/// The root directory of the local content-addressed store.
pub fn default_store_root() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(KITOPS_HOME_VAR) {
        return Ok(PathBuf::from(home));
    }
    homedir()
        .map(|home| home.join(".kitops"))
        .context("locate home directory; set KITOPS_HOME to override")
}

/// Create a [`Digest`] from a hex string at compile time.
/// ```
/// let digest = kitops_lib::digest!("sha256", "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
///
/// If algorithm is not provided, it defaults to [`Digest::SHA256`].
/// ```
/// let digest = kitops_lib::digest!("a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// assert_eq!(digest.algorithm, "sha256");
/// ```
///
/// This macro assumes that the hash is 32 bytes long unless a third argument
/// provides the size.
#[macro_export]
macro_rules! digest {
    ($hex:expr) => {{
        $crate::digest!($crate::Digest::SHA256, $hex, 32)
    }};
    ($algorithm:expr, $hex:expr) => {{
        $crate::digest!($algorithm, $hex, 32)
    }};
    ($algorithm:expr, $hex:expr, $size:expr) => {{
        const HASH: [u8; $size] = hex_magic::hex!($hex);
        static_assertions::const_assert_ne!(HASH.len(), 0);
        static_assertions::const_assert_ne!($algorithm.len(), 0);
        $crate::Digest {
            algorithm: $algorithm.to_string(),
            hash: HASH.to_vec(),
        }
    }};
}

/// A content-addressable digest in the format `algorithm:hash`.
///
/// Only `sha256` digests are computed by this crate; other algorithms are
/// carried as opaque pass-through. The canonical form is lowercase hex.
///
/// ```
/// # use std::str::FromStr;
/// let digest = kitops_lib::Digest::from_str("sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4").expect("parse digest");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[debug("{}", self.to_string())]
pub struct Digest {
    /// The hashing algorithm used (e.g. "sha256")
    pub algorithm: String,

    /// The raw hash bytes
    pub hash: Vec<u8>,
}

impl Digest {
    /// The SHA256 algorithm
    pub const SHA256: &'static str = "sha256";

    /// Returns the hash as a hex string
    pub fn as_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Parse the provided string as a SHA256 hex digest.
    pub fn from_sha256(s: &str) -> Result<Self> {
        Ok(Self {
            algorithm: Self::SHA256.to_string(),
            hash: hex::decode(s).map_err(|e| eyre!("invalid hex string: {e}"))?,
        })
    }

    /// Create a new instance assuming it is sha256 encoded.
    pub fn from_hash(hash: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm: Self::SHA256.to_string(),
            hash: hash.into(),
        }
    }

    /// Digest the given bytes with SHA256.
    pub fn digest_of(bytes: impl AsRef<[u8]>) -> Self {
        use sha2::Digest as _;
        Self::from_hash(sha2::Sha256::digest(bytes).to_vec())
    }
}

impl FromStr for Digest {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            eyre!("invalid digest format: missing algorithm separator ':'")
                .with_section(input_section)
        })?;

        if algorithm.is_empty() {
            bail!("algorithm cannot be empty");
        }
        if hex.is_empty() {
            bail!("hex cannot be empty");
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hex::decode(hex).map_err(|e| eyre!("invalid hex string: {e}"))?,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.as_hex())
    }
}

impl From<&Digest> for Digest {
    fn from(digest: &Digest) -> Self {
        digest.clone()
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// The tag or digest component of a [`Reference`].
///
/// A reference may be *tagged* (mutable name), *pinned* (digest), or *bare*
/// (no sub-reference; meaningful only against the local store).
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SubReference {
    /// No tag or digest was provided.
    #[display("")]
    Bare,

    /// A named tag (e.g. "latest", "1.0.0")
    #[display("{_0}")]
    Tag(String),

    /// A digest (e.g. "sha256:123abc...")
    #[display("{_0}")]
    Digest(Digest),
}

/// A ModelKit reference provided by a user:
/// `[registry/]repository[:tag][@algorithm:hex]`.
///
/// The first path segment is taken as the registry when it looks like a host
/// (contains `.` or `:`, or is literally `localhost`); otherwise the
/// reference addresses the local store through the sentinel registry
/// [`Reference::LOCAL`]. Hosts are normalized to lowercase; repository
/// segments stay case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize)]
pub struct Reference {
    /// Registry host, possibly with a port (e.g. "ghcr.io", "registry.local:5000").
    #[builder(into, default = Reference::LOCAL.to_string())]
    pub registry: String,

    /// Repository path below the registry (e.g. "jozu/llama3").
    #[builder(into)]
    pub repository: String,

    /// Tag or digest, if any.
    #[builder(into, default = SubReference::Bare)]
    pub sub_reference: SubReference,
}

impl Reference {
    /// The sentinel registry addressing the local store.
    pub const LOCAL: &'static str = "localhost";

    /// Whether this reference addresses the local store.
    pub fn is_local(&self) -> bool {
        self.registry == Self::LOCAL
    }

    /// Succeeds iff the sub-reference is a digest literal.
    pub fn as_digest(&self) -> Result<&Digest> {
        match &self.sub_reference {
            SubReference::Digest(digest) => Ok(digest),
            other => Err(Error::InvalidInput(format!(
                "expected a digest reference, got '{other}'"
            )))?,
        }
    }

    /// Clone this reference with a different sub-reference.
    pub fn with_sub_reference(&self, sub_reference: SubReference) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            sub_reference,
        }
    }

    /// Whether the first path segment of `s` is shaped like a registry host.
    pub(crate) fn registry_shaped(segment: &str) -> bool {
        segment.contains('.') || segment.contains(':') || segment == "localhost"
    }
}

impl<S: reference_builder::State> ReferenceBuilder<S> {
    /// Set the reference to a tag.
    pub fn tag(self, tag: &str) -> ReferenceBuilder<reference_builder::SetSubReference<S>>
    where
        S::SubReference: reference_builder::IsUnset,
    {
        self.sub_reference(SubReference::Tag(tag.to_string()))
    }

    /// Set the reference to a digest.
    pub fn digest(
        self,
        digest: impl Into<Digest>,
    ) -> ReferenceBuilder<reference_builder::SetSubReference<S>>
    where
        S::SubReference: reference_builder::IsUnset,
    {
        self.sub_reference(SubReference::Digest(digest.into()))
    }
}

impl FromStr for Reference {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let help_section = || {
            [
                "Provide a reference in the form [registry/]repository[:tag][@digest].",
                "Without a registry-shaped first segment, the reference addresses the local store.",
            ]
            .join("\n")
            .header("Help:")
        };
        let examples_section = || {
            [
                "ghcr.io/jozu/llama3:latest",
                "jozu/llama3@sha256:123abc",
                "my-model:v1",
            ]
            .join("\n")
            .header("Examples:")
        };

        ensure!(!s.is_empty(), "reference cannot be empty");
        ensure!(
            !s.chars().any(char::is_whitespace),
            "reference cannot contain whitespace: {s}"
        );

        // The digest is everything after the first `@`; the tag is everything
        // after the last `:` that follows the last `/`.
        let (name, sub_reference) = if let Some((name, digest)) = s.split_once('@') {
            let digest = Digest::from_str(digest).context("parse digest")?;
            (name, SubReference::Digest(digest))
        } else {
            let slash = s.rfind('/').map(|idx| idx + 1).unwrap_or(0);
            match s[slash..].rfind(':') {
                Some(colon) => {
                    let (name, tag) = s.split_at(slash + colon);
                    (name, SubReference::Tag(tag[1..].to_string()))
                }
                None => (s, SubReference::Bare),
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((head, rest)) if Reference::registry_shaped(head) => {
                (head.to_lowercase(), rest.to_string())
            }
            _ => (Reference::LOCAL.to_string(), name.to_string()),
        };

        let bad_segment = |segment: &str| segment.is_empty() || segment == "." || segment == "..";
        if repository.is_empty() || repository.split('/').any(bad_segment) {
            return eyre!("invalid reference format: {s}")
                .with_section(help_section)
                .with_section(examples_section)
                .pipe(Err);
        }
        if let SubReference::Tag(tag) = &sub_reference {
            ensure!(!tag.is_empty(), "tag cannot be empty: {s}");
        }

        Ok(Reference {
            registry,
            repository,
            sub_reference,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_local() {
            write!(f, "{}/", self.registry)?;
        }
        write!(f, "{}", self.repository)?;
        match &self.sub_reference {
            SubReference::Bare => Ok(()),
            SubReference::Tag(tag) => write!(f, ":{tag}"),
            SubReference::Digest(digest) => write!(f, "@{digest}"),
        }
    }
}

impl From<&Reference> for Reference {
    fn from(reference: &Reference) -> Self {
        reference.clone()
    }
}

/// The kind of payload a packed layer carries, in Kitfile traversal terms.
///
/// This is finer-grained than [`mediatype::BaseType`]: prompts share the
/// `code` base type on the wire and are told apart by a layer annotation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
pub enum LayerKind {
    #[display("model")]
    Model,
    #[display("model part")]
    ModelPart,
    #[display("code")]
    Code,
    #[display("prompt")]
    Prompt,
    #[display("dataset")]
    Dataset,
    #[display("docs")]
    Docs,
}

impl LayerKind {
    /// The wire base type for this layer kind.
    pub fn base_type(&self) -> mediatype::BaseType {
        match self {
            LayerKind::Model => mediatype::BaseType::Model,
            LayerKind::ModelPart => mediatype::BaseType::ModelPart,
            LayerKind::Code | LayerKind::Prompt => mediatype::BaseType::Code,
            LayerKind::Dataset => mediatype::BaseType::Dataset,
            LayerKind::Docs => mediatype::BaseType::Docs,
        }
    }
}

/// Supplies registry credentials for a host.
///
/// Credential storage is the caller's concern (OS keychains, config files,
/// environment); the engine only ever asks for the pair to present.
pub trait CredentialsStore: Send + Sync {
    /// Return `(username, secret)` for the given host, if known.
    fn get(&self, host: &str) -> Option<(String, String)>;
}

/// Networking options consumed by the registry client.
#[derive(Debug, Clone, Builder)]
pub struct NetworkOpts {
    /// Talk to the registry over plain HTTP instead of TLS.
    #[builder(default)]
    pub plain_http: bool,

    /// Verify TLS certificates. Defaults to on.
    #[builder(default = true)]
    pub tls_verify: bool,

    /// Additional PEM certificates to trust.
    #[builder(default)]
    pub tls_trust_cert_paths: Vec<PathBuf>,

    /// Client certificate for mutual TLS, PEM.
    pub client_cert_path: Option<PathBuf>,

    /// Client key for mutual TLS, PEM.
    pub client_key_path: Option<PathBuf>,

    /// Proxy URL to route requests through.
    pub proxy: Option<String>,
}

impl Default for NetworkOpts {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A pinned stream of blob bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = transform::Chunk> + Send>>;

/// A source of manifests and blobs, either the local store or a remote
/// registry.
///
/// Implementations verify blob bytes against the descriptor digest while
/// streaming; a mismatch surfaces as an [`error::Error::Integrity`] error at
/// end of stream.
pub trait ModelSource: std::fmt::Debug {
    /// Resolve a reference to its manifest descriptor.
    fn resolve(&self, reference: &Reference) -> impl Future<Output = Result<oci::Descriptor>>;

    /// Fetch and parse the manifest for a previously resolved descriptor.
    fn manifest(
        &self,
        reference: &Reference,
        desc: &oci::Descriptor,
    ) -> impl Future<Output = Result<oci::Manifest>>;

    /// Stream the bytes of a blob, verifying the digest on the fly.
    fn blob(
        &self,
        reference: &Reference,
        desc: &oci::Descriptor,
    ) -> impl Future<Output = Result<ByteStream>>;
}

/// Get the current home directory for the current user.
fn homedir() -> Result<PathBuf, std::env::VarError> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
}
