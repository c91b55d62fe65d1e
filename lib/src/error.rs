//! The semantic error taxonomy for the artifact engine.
//!
//! Most functions in this crate return [`color_eyre::Result`] and build their
//! reports with `.context(...)` as usual; failures that callers need to react
//! to programmatically (integrity violations, cycles, path escapes, ...) are
//! raised as an [`Error`] so they survive the context chain. Use
//! [`Error::find`] to recover the kind from a report.

use std::path::PathBuf;

use crate::MAX_MODEL_REF_CHAIN;

/// Failure kinds that are part of the engine's contract.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A reference, filter, media type, or Kitfile field failed to parse.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A manifest, blob, tag, or Kitfile is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bytes on disk or on the wire disagree with their digest or size.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// The operation is valid but the peer cannot perform it.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A parent-model chain revisited a reference already on the active path.
    #[error("cycle detected in model references at {0}")]
    CycleDetected(String),

    /// A parent-model chain is longer than [`MAX_MODEL_REF_CHAIN`].
    #[error("model reference chain exceeds the maximum depth of {MAX_MODEL_REF_CHAIN}")]
    DepthExceeded,

    /// A candidate path resolves outside its declared root.
    #[error("path {} escapes the allowed root", .0.display())]
    PathEscape(PathBuf),

    /// A file already exists and overwriting was not requested.
    #[error("file {} already exists and would be overwritten", .0.display())]
    Conflict(PathBuf),

    /// The operation was canceled before it completed.
    #[error("operation canceled")]
    Canceled,

    /// The transport failed after exhausting any applicable retries.
    #[error("network failure: {0}")]
    Network(String),

    /// The registry answered with a non-retryable error status.
    #[error("registry error: {status}: {message}")]
    Server { status: u16, message: String },

    /// A ModelPack layer carries no file path annotation to synthesize from.
    #[error("layer {0} carries no file path annotation")]
    UnknownLayerPath(String),

    /// A tar entry type the unpacker does not handle.
    #[error("unrecognized tar entry type {0:#04x}")]
    UnrecognizedTarType(u8),
}

impl Error {
    /// Recover the typed error from anywhere in a report's chain.
    pub fn find(report: &color_eyre::Report) -> Option<&Error> {
        report.chain().find_map(|err| err.downcast_ref::<Error>())
    }

    /// Wrap this error into an [`std::io::Error`] so it can travel through
    /// byte-stream adapters without losing its kind. Reversed by [`Error::from_io`].
    pub(crate) fn into_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, self)
    }

    /// Recover a typed error previously wrapped with [`Error::into_io`].
    pub(crate) fn from_io(err: &std::io::Error) -> Option<&Error> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }
}

/// Convert an [`std::io::Error`] back into a report, resurfacing any typed
/// error that was tunneled through a byte-stream adapter.
pub(crate) fn restore_io(err: std::io::Error) -> color_eyre::Report {
    match Error::from_io(&err) {
        Some(Error::Integrity(message)) => Error::Integrity(message.clone()).into(),
        Some(Error::NotFound(message)) => Error::NotFound(message.clone()).into(),
        Some(Error::PathEscape(path)) => Error::PathEscape(path.clone()).into(),
        Some(Error::UnrecognizedTarType(flag)) => Error::UnrecognizedTarType(*flag).into(),
        _ => err.into(),
    }
}
