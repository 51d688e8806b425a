//! Error types for deployment parameter parsing.

use thiserror::Error;

/// Errors raised while turning a parameter file into [`super::DeploymentParameters`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParamsError {
    /// Raised when the parameter file cannot be read.
    #[error("failed to read parameter file `{path}`: {message}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the document is not valid YAML.
    #[error("parameter file is not valid YAML: {0}")]
    Syntax(String),
    /// Raised when the document root is not a mapping.
    #[error("parameter file root must be a mapping")]
    NotAMapping,
    /// Raised when a section has the wrong shape.
    #[error("invalid `{key}` section: {message}")]
    Invalid {
        /// Top-level key of the offending section.
        key: String,
        /// Deserialiser message.
        message: String,
    },
    /// Raised when more than one user carries `primary: true`.
    #[error("at most one user may be primary, found: {}", users.join(", "))]
    MultiplePrimary {
        /// Keys of the users marked primary.
        users: Vec<String>,
    },
    /// Raised when a datastore path does not follow `[store] folder/file`.
    #[error("invalid datastore path `{0}`: expected `[store-name] folder/file`")]
    DatastorePath(String),
}
