//! Error types for DocPack

use crate::types::ValueType;
use thiserror::Error;

/// Result type alias for DocPack operations
pub type Result<T> = std::result::Result<T, DocPackError>;

/// DocPack error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocPackError {
    /// Value type is not valid for column storage
    #[error("{0} is not valid for storage")]
    InvalidType(ValueType),
}

impl DocPackError {
    /// Check if the error left the builder usable
    ///
    /// All recoverable errors are reported before any state change, so the
    /// builder that returned them can keep accepting values.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DocPackError::InvalidType(_))
    }
}
