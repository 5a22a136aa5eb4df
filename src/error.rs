//! Error types shared by the loader, the host bindings and the codecs.

use thiserror::Error;

/// The provider could not hand out the hstore capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not acquire hstore functions: {reason}")]
pub struct AcquisitionError {
    reason: String,
}

impl AcquisitionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A query run through the host failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("query \"{query}\" failed: {message}")]
pub struct ExecuteError {
    pub query: String,
    pub message: String,
}

/// Failure of [`crate::loader::Loader::load`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("{module} can only be used inside a PostgreSQL backend")]
    HostContextMissing { module: &'static str },

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("hstore {what} cannot contain NUL bytes")]
    NulByte { what: &'static str },

    #[error("arrays must have same bounds: {keys} keys, {values} values")]
    MismatchedArrays { keys: usize, values: usize },

    #[error("{0}")]
    Host(String),
}

/// Everything the crate-level `parse_hstore` / `serialize_hstore` can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PghstoreError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
