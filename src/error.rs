//! Error types for plugin host operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::abi::SignatureShape;

/// Errors that can occur during plugin host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Configuration descriptor missing or invalid
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Descriptor targets a runtime or ABI version this host cannot provide
    #[error("Incompatible runtime: expected {expected}, got {actual}")]
    IncompatibleRuntime { expected: String, actual: String },

    /// Another context already owns a process-exclusive runtime
    #[error("Runtime '{0}' is already hosting an active context in this process")]
    ContextConflict(String),

    /// Module image could not be loaded
    #[error("Failed to load module {path:?}: {reason}")]
    ModuleLoad { path: PathBuf, reason: String },

    /// Type or member not exported by the module
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// Requested signature differs from the exported declaration
    #[error("Signature mismatch for {symbol}: requested {requested}, module declares {declared}")]
    SignatureMismatch {
        symbol: String,
        requested: SignatureShape,
        declared: SignatureShape,
    },

    /// Malformed type qualifier or member name
    #[error("Invalid entry point: {0}")]
    InvalidEntryPoint(String),

    /// API called in the wrong lifecycle state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`HostError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Initialization,
    ModuleLoad,
    SymbolNotFound,
    SignatureMismatch,
    InvalidOperation,
    Io,
}

impl HostError {
    pub(crate) fn module_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HostError::ModuleLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Which class of failure this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::InitializationFailed(_)
            | HostError::IncompatibleRuntime { .. }
            | HostError::ContextConflict(_) => ErrorKind::Initialization,
            HostError::ModuleLoad { .. } => ErrorKind::ModuleLoad,
            HostError::SymbolNotFound(_) | HostError::InvalidEntryPoint(_) => {
                ErrorKind::SymbolNotFound
            }
            HostError::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            HostError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            HostError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether retrying after fixing the environment (e.g. the module path) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ModuleLoad | ErrorKind::Io)
    }
}

/// Result type for plugin host operations
pub type Result<T> = std::result::Result<T, HostError>;
