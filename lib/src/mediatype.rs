//! The media-type algebra for ModelKit and CNCF ModelPack artifacts.
//!
//! Two dialects share one decomposition into base type, format, and
//! compression:
//!
//! - *Kit*: `application/vnd.kitops.modelkit.<base>.v1.tar[+<comp>]`, plus the
//!   config constant [`KIT_CONFIG_MEDIA_TYPE`]. Kit layers are always tar.
//! - *ModelPack*: `application/vnd.cncf.model.<base>.v1.<format>[+<comp>]`,
//!   plus [`MODELPACK_CONFIG_MEDIA_TYPE`]. ModelPack admits raw (un-tarred)
//!   layers, which must not be compressed.
//!
//! Parsing and emission are pure inverses: `parse(s).to_string() == s` for
//! every valid `s`.

use std::{str::FromStr, sync::LazyLock};

use color_eyre::eyre;
use enum_assoc::Assoc;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{AsRefStr, EnumIter, IntoEnumIterator};
use tap::Pipe;

use crate::error::Error;

/// Media type of the Kitfile config blob.
pub const KIT_CONFIG_MEDIA_TYPE: &str = "application/vnd.kitops.modelkit.config.v1+json";

/// Media type of the CNCF ModelPack config blob.
pub const MODELPACK_CONFIG_MEDIA_TYPE: &str = "application/vnd.cncf.model.config.v1+json";

static KIT_LAYER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^application/vnd\.kitops\.modelkit\.(\w+)\.v1\.tar(?:\+(\w+))?$")
        .expect("compile kit layer media type pattern")
});

static MODELPACK_LAYER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^application/vnd\.cncf\.model\.(\w+(?:\.\w+)?)\.v1\.(\w+)(?:\+?(\w+))?$")
        .expect("compile modelpack layer media type pattern")
});

/// The kind of payload carried by a blob.
///
/// The Kit spelling is the `strum` serialization; the ModelPack dialect
/// renames a few of them (`weight`, `weight.config`, `doc`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, AsRefStr, EnumIter, Assoc)]
#[func(pub const fn modelpack_name(&self) -> &'static str)]
#[func(pub const fn user_name(&self) -> &'static str)]
pub enum BaseType {
    #[strum(serialize = "config")]
    #[assoc(modelpack_name = "config", user_name = "config")]
    Config,

    #[strum(serialize = "model")]
    #[assoc(modelpack_name = "weight", user_name = "model")]
    Model,

    #[strum(serialize = "modelpart")]
    #[assoc(modelpack_name = "weight.config", user_name = "model part")]
    ModelPart,

    #[strum(serialize = "dataset")]
    #[assoc(modelpack_name = "dataset", user_name = "dataset")]
    Dataset,

    #[strum(serialize = "code")]
    #[assoc(modelpack_name = "code", user_name = "code")]
    Code,

    #[strum(serialize = "docs")]
    #[assoc(modelpack_name = "doc", user_name = "docs")]
    Docs,
}

impl BaseType {
    fn from_kit_name(s: &str) -> Option<Self> {
        Self::iter().find(|base| base.as_ref() == s)
    }

    fn from_modelpack_name(s: &str) -> Option<Self> {
        Self::iter().find(|base| base.modelpack_name() == s)
    }
}

/// Payload framing of a layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, AsRefStr, EnumIter)]
pub enum Format {
    /// The payload is a tar archive. Kit layers are always tar.
    #[strum(serialize = "tar")]
    Tar,

    /// The payload is the file's bytes, unframed. ModelPack only.
    #[strum(serialize = "raw")]
    Raw,
}

impl Format {
    fn from_name(s: &str) -> Option<Self> {
        Self::iter().find(|format| format.as_ref() == s)
    }
}

/// Compression applied to a layer's payload.
///
/// [`Compression::GzipFastest`] is a pack-time encoder choice: its wire
/// suffix is `gzip`, indistinguishable from [`Compression::Gzip`], so parsing
/// never produces it.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    GzipFastest,
    Zstd,
}

impl Compression {
    /// The wire suffix emitted after `+`, if any.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip | Compression::GzipFastest => Some("gzip"),
            Compression::Zstd => Some("zstd"),
        }
    }

    fn from_suffix(s: &str) -> Result<Self, Error> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::InvalidInput(format!("invalid compression: {other}"))),
        }
    }

    /// Parse a compression name as provided by a user (e.g. on the CLI).
    ///
    /// `zstd` parses in the media-type grammar but is rejected here: there is
    /// no stable encoder selection for it yet, so users cannot author it.
    pub fn from_user(s: &str) -> color_eyre::Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "gzipFastest" => Ok(Compression::GzipFastest),
            "zstd" => Err(Error::Unsupported("zstd compression is not supported for packing".into()))?,
            other => Err(Error::InvalidInput(format!("invalid compression: {other}")))?,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::GzipFastest => write!(f, "gzipFastest"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

/// A parsed artifact media type, in either dialect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// The Kitfile config blob.
    KitConfig,

    /// A Kit layer: always a tar payload, optionally compressed.
    Kit {
        base: BaseType,
        compression: Compression,
    },

    /// The ModelPack config blob.
    ModelPackConfig,

    /// A ModelPack layer: tar or raw payload; raw forbids compression.
    ModelPack {
        base: BaseType,
        format: Format,
        compression: Compression,
    },
}

impl MediaType {
    /// Construct a Kit layer media type.
    pub fn kit(base: BaseType, compression: Compression) -> Self {
        MediaType::Kit { base, compression }
    }

    /// Construct a ModelPack layer media type.
    pub fn modelpack(base: BaseType, format: Format, compression: Compression) -> Self {
        MediaType::ModelPack {
            base,
            format,
            compression,
        }
    }

    /// The kind of payload this media type names.
    pub fn base(&self) -> BaseType {
        match self {
            MediaType::KitConfig | MediaType::ModelPackConfig => BaseType::Config,
            MediaType::Kit { base, .. } | MediaType::ModelPack { base, .. } => *base,
        }
    }

    /// The payload framing. Config blobs and Kit layers are fixed.
    pub fn format(&self) -> Format {
        match self {
            MediaType::KitConfig | MediaType::ModelPackConfig => Format::Raw,
            MediaType::Kit { .. } => Format::Tar,
            MediaType::ModelPack { format, .. } => *format,
        }
    }

    /// The compression applied to the payload.
    pub fn compression(&self) -> Compression {
        match self {
            MediaType::KitConfig | MediaType::ModelPackConfig => Compression::None,
            MediaType::Kit { compression, .. } | MediaType::ModelPack { compression, .. } => {
                *compression
            }
        }
    }

    /// Whether this media type belongs to the ModelPack dialect.
    pub fn is_modelpack(&self) -> bool {
        matches!(
            self,
            MediaType::ModelPackConfig | MediaType::ModelPack { .. }
        )
    }

    /// A short human-facing name for the payload, e.g. for listings.
    pub fn user_string(&self) -> &'static str {
        self.base().user_name()
    }
}

impl FromStr for MediaType {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            KIT_CONFIG_MEDIA_TYPE => return Ok(MediaType::KitConfig),
            MODELPACK_CONFIG_MEDIA_TYPE => return Ok(MediaType::ModelPackConfig),
            _ => {}
        }

        if let Some(captures) = KIT_LAYER.captures(s) {
            let base = &captures[1];
            let base = BaseType::from_kit_name(base)
                .ok_or_else(|| Error::InvalidInput(format!("invalid base type: {base}")))?;
            let compression = match captures.get(2) {
                Some(suffix) => Compression::from_suffix(suffix.as_str())?,
                None => Compression::None,
            };
            return MediaType::Kit { base, compression }.pipe(Ok);
        }

        if let Some(captures) = MODELPACK_LAYER.captures(s) {
            let base = &captures[1];
            let base = BaseType::from_modelpack_name(base)
                .ok_or_else(|| Error::InvalidInput(format!("invalid base type: {base}")))?;
            let format = &captures[2];
            let format = Format::from_name(format)
                .ok_or_else(|| Error::InvalidInput(format!("invalid format: {format}")))?;
            let compression = match captures.get(3) {
                Some(suffix) => Compression::from_suffix(suffix.as_str())?,
                None => Compression::None,
            };
            if format == Format::Raw && compression != Compression::None {
                return Err(Error::InvalidInput(format!(
                    "invalid compression: raw layers must not be compressed: {s}"
                )))?;
            }
            return MediaType::ModelPack {
                base,
                format,
                compression,
            }
            .pipe(Ok);
        }

        Err(Error::InvalidInput(format!("unrecognized media type: {s}")))?
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::KitConfig => write!(f, "{KIT_CONFIG_MEDIA_TYPE}"),
            MediaType::ModelPackConfig => write!(f, "{MODELPACK_CONFIG_MEDIA_TYPE}"),
            MediaType::Kit { base, compression } => {
                write!(f, "application/vnd.kitops.modelkit.{}.v1.tar", base.as_ref())?;
                if let Some(suffix) = compression.suffix() {
                    write!(f, "+{suffix}")?;
                }
                Ok(())
            }
            MediaType::ModelPack {
                base,
                format,
                compression,
            } => {
                write!(
                    f,
                    "application/vnd.cncf.model.{}.v1.{}",
                    base.modelpack_name(),
                    format.as_ref()
                )?;
                if let Some(suffix) = compression.suffix() {
                    write!(f, "+{suffix}")?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}
