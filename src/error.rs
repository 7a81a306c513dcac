//! Errors raised while building or rewriting filter trees.
//!
//! Evaluation failures are not errors: a value that does not satisfy a
//! condition is reported through [`crate::check::FilterCheckResult`].

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    /// A definition array has the wrong arity or element types.
    #[error("malformed configuration at {path}: {message}")]
    Malformed { path: String, message: String },

    #[error("unknown filter unit '{0}'")]
    UnknownUnit(String),

    #[error("unknown filter parameter '{0}'")]
    UnknownParameter(String),

    /// A parameter group was used before a value was supplied.
    #[error("filter parameter '{0}' has no value")]
    UnboundParameter(String),

    #[error("cannot compile filter: {0}")]
    Compile(String),
}

impl FilterError {
    pub fn malformed(path: impl Into<String>, message: impl Into<String>) -> Self {
        FilterError::Malformed {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
