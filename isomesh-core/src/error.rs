//! Error types for isomesh

use thiserror::Error;

/// Main error type for isomesh operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Resource creation failed for '{label}': {reason}")]
    ResourceCreation { label: String, reason: String },

    #[error("Invalid pass graph: {0}")]
    InvalidGraph(String),

    #[error("Deferred resource '{0}' was consumed before its producer ran")]
    UnresolvedResource(&'static str),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl Error {
    /// Shorthand for a failed GPU allocation
    pub fn resource(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ResourceCreation {
            label: label.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for isomesh operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "gpu")]
impl From<wgpu::BufferAsyncError> for Error {
    fn from(e: wgpu::BufferAsyncError) -> Self {
        Error::Gpu(e.to_string())
    }
}
