//! CRD validation errors

use thiserror::Error;

/// A custom resource failed validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrdError {
    /// A required field is empty
    #[error("{kind} {name}: {field} must not be empty")]
    MissingField {
        /// Resource kind
        kind: &'static str,
        /// Resource name
        name: String,
        /// Offending field
        field: &'static str,
    },

    /// A field holds a value outside its allowed set
    #[error("{kind} {name}: invalid {field} '{value}'")]
    InvalidValue {
        /// Resource kind
        kind: &'static str,
        /// Resource name
        name: String,
        /// Offending field
        field: &'static str,
        /// Rejected value
        value: String,
    },
}
