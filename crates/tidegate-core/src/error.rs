use thiserror::Error;

/// Result type alias for domain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Domain-level errors shared across the tidegate crates
#[derive(Error, Debug)]
pub enum Error {
    /// User lookup failed
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Virtual folder lookup failed
    #[error("folder not found: {0}")]
    FolderNotFound(String),

    /// Credential verification failed
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A user or folder definition violates a model invariant
    #[error("validation error: {0}")]
    Validation(String),

    /// The provider backend failed
    #[error("provider error: {0}")]
    Provider(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
