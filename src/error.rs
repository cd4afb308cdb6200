//! Error types for superio.
//!
//! Every fallible step inside the crate returns [`Result`]. At the backend
//! boundary these errors are rendered into the backend's
//! [`ErrorQueue`](crate::ErrorQueue) and the public call reports `false`.

use crate::types::TypeTag;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for superio operations.
pub type Result<T> = std::result::Result<T, IoError>;

/// How a file is being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Opened for reading.
    Read,
    /// Created (truncated) for writing.
    Write,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
        }
    }
}

/// Errors that can occur in superio.
#[derive(Debug, Error)]
pub enum IoError {
    /// Failed to open a file.
    #[error("Failed to open {path} for {mode}: {source}")]
    FileOpen {
        path: PathBuf,
        mode: AccessMode,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An operation needed an open file in a particular mode.
    #[error("File is not open for {mode}")]
    NotOpen { mode: AccessMode },

    /// The backend already has an open file.
    #[error("File is already open for {mode}")]
    AlreadyOpen { mode: AccessMode },

    /// The storage technology was not compiled in.
    #[error("Backend '{extension}' is disabled in this build")]
    BackendDisabled { extension: String },

    /// Group does not exist.
    #[error("Group {group} does not exist")]
    GroupNotFound { group: String },

    /// Variable does not exist.
    #[error("Variable {path} does not exist")]
    VariableNotFound { path: String },

    /// Variable already exists and cannot be recreated.
    #[error("Variable {path} already exists")]
    VariableExists { path: String },

    /// Attribute does not exist.
    #[error("Attribute {name} does not exist on '{owner}'")]
    AttributeNotFound { owner: String, name: String },

    /// Attribute holds a different kind of value than requested.
    #[error("Attribute {name} holds {found}, expected {expected}")]
    AttributeType {
        name: String,
        expected: &'static str,
        found: TypeTag,
    },

    /// A type tag has no counterpart in the storage format.
    #[error("Unable to map type {tag} for {context}")]
    UnmappableType { tag: TypeTag, context: String },

    /// More axes than a shape descriptor can carry.
    #[error("Too many dimensions: {dims} (at most {max})")]
    TooManyDimensions { dims: usize, max: usize },

    /// A shape descriptor or region violates its invariants.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Stored shape disagrees with the caller's shape descriptor.
    #[error("Shape mismatch for {path}:\n{detail}")]
    ShapeMismatch { path: String, detail: String },

    /// Buffer size disagrees with the shape descriptor.
    #[error("Buffer for {path} holds {actual} bytes, expected {expected}")]
    BufferSize {
        path: String,
        expected: usize,
        actual: usize,
    },

    /// Discovered superdomain is larger than the live process group.
    #[error("Superdomain size {super_size} exceeds live process count {live}")]
    SuperdomainTooLarge { super_size: usize, live: usize },

    /// Malformed tag container.
    #[error("Corrupt container {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Communication failure between ranks.
    #[error("Communication error: {0}")]
    Comm(String),

    /// A backend call failed; details are in its error queue.
    #[error("Backend failed to {operation} {target}")]
    Backend {
        operation: &'static str,
        target: String,
    },

    /// Failed to read or write through netCDF.
    #[error("NetCDF error: {0}")]
    NetCDF(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IoError {
    /// Create a FileOpen error.
    pub fn file_open(
        path: impl Into<PathBuf>,
        mode: AccessMode,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::FileOpen {
            path: path.into(),
            mode,
            source: source.into(),
        }
    }

    /// Create a BackendDisabled error.
    pub fn backend_disabled(extension: impl Into<String>) -> Self {
        Self::BackendDisabled {
            extension: extension.into(),
        }
    }

    /// Create a GroupNotFound error.
    pub fn group_not_found(group: impl Into<String>) -> Self {
        Self::GroupNotFound {
            group: group.into(),
        }
    }

    /// Create a VariableNotFound error.
    pub fn variable_not_found(path: impl Into<String>) -> Self {
        Self::VariableNotFound { path: path.into() }
    }

    /// Create an AttributeNotFound error.
    pub fn attribute_not_found(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AttributeNotFound {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Create an UnmappableType error.
    pub fn unmappable(tag: TypeTag, context: impl Into<String>) -> Self {
        Self::UnmappableType {
            tag,
            context: context.into(),
        }
    }

    /// Create a Corrupt error.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a Backend error.
    pub fn backend(operation: &'static str, target: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            target: target.into(),
        }
    }
}

#[cfg(feature = "netcdf")]
impl From<netcdf::Error> for IoError {
    fn from(err: netcdf::Error) -> Self {
        Self::NetCDF(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn file_open_keeps_the_native_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = IoError::file_open("/data/run.hdf", AccessMode::Read, cause);
        assert_eq!(
            err.to_string(),
            "Failed to open /data/run.hdf for read: no such file"
        );
        let source = err.source().unwrap();
        let io = source.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
