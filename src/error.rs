//! Error types for event processing and queries

use crate::store::StoreError;

/// Errors surfaced by the resolver, executor, estimators and query engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FluxError {
    /// An `@`-directive the resolver does not know
    UnknownIdentifier(String),
    /// A bare identifier with no matching event attribute
    MissingAttribute(String),
    /// Malformed handler or target expression
    Schema(String),
    /// Empty or malformed query range, or out-of-range estimator parameter
    Range(String),
    /// Event ingestion attempted while the deployment is read-only
    ReadOnly,
    /// No schema registered under the given id
    UnknownSchema(String),
    /// Invalid configuration value
    Config(String),
    /// Event queue closed or full
    Dispatch(String),
    /// Failure reported by the set store
    Store(StoreError),
}

impl FluxError {
    /// Resolution failures that only skip one handler/key combination when
    /// an event is processed against a schema. Unknown `@`-directives are
    /// schema bugs and still abort the event.
    pub fn is_skippable(&self) -> bool {
        matches!(self, FluxError::MissingAttribute(_))
    }
}

impl std::fmt::Display for FluxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FluxError::UnknownIdentifier(id) => write!(f, "Unknown identifier {}", id),
            FluxError::MissingAttribute(name) => write!(f, "Undefined attribute {}", name),
            FluxError::Schema(msg) => write!(f, "Schema error: {}", msg),
            FluxError::Range(msg) => write!(f, "Range error: {}", msg),
            FluxError::ReadOnly => write!(f, "Service is in read-only mode"),
            FluxError::UnknownSchema(id) => write!(f, "Unknown schema {}", id),
            FluxError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FluxError::Dispatch(msg) => write!(f, "Dispatch error: {}", msg),
            FluxError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for FluxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FluxError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for FluxError {
    fn from(e: StoreError) -> Self {
        FluxError::Store(e)
    }
}

pub type Result<T> = std::result::Result<T, FluxError>;
