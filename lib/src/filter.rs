//! Layer-selection filters: `type[,type][:name[,name]]`.
//!
//! Filters pick which layers an unpack touches. Types select layer kinds;
//! the optional name list narrows a type to entries whose `name` or `path`
//! matches exactly. An empty filter set admits everything.

use std::str::FromStr;

use color_eyre::{eyre::Context, Result};
use strum::EnumString;

use crate::{error::Error, LayerKind};

/// A layer category selectable in a filter expression.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FilterType {
    /// The config blob (the Kitfile itself).
    Kitfile,

    /// Model weights and model parts.
    Model,

    Datasets,
    Code,
    Prompts,
    Docs,
}

impl From<LayerKind> for FilterType {
    fn from(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Model | LayerKind::ModelPart => FilterType::Model,
            LayerKind::Code => FilterType::Code,
            LayerKind::Prompt => FilterType::Prompts,
            LayerKind::Dataset => FilterType::Datasets,
            LayerKind::Docs => FilterType::Docs,
        }
    }
}

/// One parsed filter expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterConf {
    /// Selected layer categories. Never empty in a parsed filter.
    pub types: Vec<FilterType>,

    /// Entry names (or paths) to narrow to. Empty matches all names.
    pub names: Vec<String>,
}

impl FilterConf {
    /// A filter admitting only model layers, used for parent-chain recursion.
    pub fn model_only() -> Self {
        Self {
            types: vec![FilterType::Model],
            names: Vec::new(),
        }
    }

    /// Whether this filter admits the given layer kind at all.
    fn admits_type(&self, kind: LayerKind) -> bool {
        self.types.contains(&FilterType::from(kind))
    }

    /// Whether this filter admits an entry of the given kind and identity.
    ///
    /// Docs, code, and prompt entries have no `name` field and match on
    /// `path` alone; the caller passes `None` for them.
    fn admits(&self, kind: LayerKind, name: Option<&str>, path: &str) -> bool {
        if !self.admits_type(kind) {
            return false;
        }
        if self.names.is_empty() {
            return true;
        }
        self.names
            .iter()
            .any(|candidate| Some(candidate.as_str()) == name || candidate == path)
    }
}

impl FromStr for FilterConf {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (types, names) = match s.split_once(':') {
            Some((types, names)) => (types, Some(names)),
            None => (s, None),
        };

        let types = types
            .split(',')
            .map(str::trim)
            .map(|candidate| {
                FilterType::from_str(candidate).map_err(|_| {
                    Error::InvalidInput(format!("invalid filter type: {candidate}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .context("parse filter types")?;

        let names = names
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { types, names })
    }
}

/// Whether a filter set admits unpacking the config blob.
///
/// The config is written only when some filter names `kitfile`, or when the
/// filter set is empty (which admits everything).
pub fn admits_config(filters: &[FilterConf]) -> bool {
    filters.is_empty()
        || filters
            .iter()
            .any(|filter| filter.types.contains(&FilterType::Kitfile))
}

/// Whether a filter set admits a typed layer entry.
pub fn admits_entry(
    filters: &[FilterConf],
    kind: LayerKind,
    name: Option<&str>,
    path: &str,
) -> bool {
    filters.is_empty() || filters.iter().any(|filter| filter.admits(kind, name, path))
}

/// Whether a filter set admits any model layer, which decides whether the
/// unpacker follows a parent-model reference.
pub fn admits_model(filters: &[FilterConf]) -> bool {
    filters.is_empty()
        || filters
            .iter()
            .any(|filter| filter.admits_type(LayerKind::Model))
}
