//! Error types for the OVATool core library.

use std::path::PathBuf;

/// The main error type for OVATool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Error parsing a VMX file.
    #[error("VMX parse error: {message}")]
    VmxParse { message: String },

    /// Error reading or processing a VMDK file.
    #[error("VMDK error: {message}")]
    Vmdk { message: String },

    /// A header or geometry value violates the format's invariants
    /// (bad grain size, non-power-of-two GTE count, capacity that
    /// doesn't fit the geometry, ...).
    #[error("Geometry error: {message}")]
    Geometry { message: String },

    /// A grain record, GD/GT entry, or header failed a consistency
    /// check on read (bad magic, checksum/stream-end mismatch, entry
    /// pointing outside the file, ...).
    #[error("Integrity error: {message}")]
    Integrity { message: String },

    /// An operation was attempted that the format's contract forbids,
    /// such as rewriting an already-written grain in an append-only
    /// stream.
    #[error("Policy violation: {message}")]
    PolicyViolation { message: String },

    /// A resource limit was exceeded (too many worker threads for the
    /// disk's grain count, output buffer undersized, ...).
    #[error("Resource error: {message}")]
    Resource { message: String },

    /// A requested entity (grain, extent, descriptor line) does not
    /// exist.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Error generating OVF descriptor.
    #[error("OVF error: {message}")]
    Ovf { message: String },

    /// Error creating OVA archive.
    #[error("OVA error: {message}")]
    Ova { message: String },

    /// Error in the export pipeline.
    #[error("Pipeline error: {message}")]
    Pipeline { message: String },
}

/// A specialized Result type for OVATool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a VMX parse error.
    pub fn vmx_parse(message: impl Into<String>) -> Self {
        Self::VmxParse {
            message: message.into(),
        }
    }

    /// Create a VMDK error.
    pub fn vmdk(message: impl Into<String>) -> Self {
        Self::Vmdk {
            message: message.into(),
        }
    }

    /// Create a geometry error.
    pub fn geometry(message: impl Into<String>) -> Self {
        Self::Geometry {
            message: message.into(),
        }
    }

    /// Create an integrity error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Create a policy violation error.
    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self::PolicyViolation {
            message: message.into(),
        }
    }

    /// Create a resource error.
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an OVF error.
    pub fn ovf(message: impl Into<String>) -> Self {
        Self::Ovf {
            message: message.into(),
        }
    }

    /// Create an OVA error.
    pub fn ova(message: impl Into<String>) -> Self {
        Self::Ova {
            message: message.into(),
        }
    }

    /// Create a pipeline error.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
