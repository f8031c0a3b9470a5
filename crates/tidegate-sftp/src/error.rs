//! Error types for the SFTP/SCP core.
//!
//! Every error that can reach a client maps onto an SFTP status code via
//! [`Error::to_status_code`], and [`Error::sanitized_message`] strips the
//! details that belong in the log rather than on the wire.

use thiserror::Error;

use crate::protocol::StatusCode;

/// Result type alias for SFTP operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// SFTP or SCP protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Path does not exist
    #[error("no such file: {0}")]
    NotFound(String),

    /// ACL, extension filter, or path-resolution escape
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The backend cannot perform the operation
    #[error("operation unsupported: {0}")]
    OpUnsupported(String),

    /// File count or byte cap reached
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Resume offset below the accepted watermark
    #[error("invalid write offset {requested}, minimum is {min}")]
    InvalidOffset { requested: u64, min: u64 },

    /// Operation on an already-closed transfer
    #[error("transfer already closed")]
    TransferClosed,

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Network-level failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Catch-all failure
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// SFTP status code for the STATUS reply
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NoSuchFile,
            Error::PermissionDenied(_) => StatusCode::PermissionDenied,
            Error::OpUnsupported(_) => StatusCode::OpUnsupported,
            Error::Protocol(_) => StatusCode::BadMessage,
            Error::Connection(_) | Error::Ssh(_) => StatusCode::ConnectionLost,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
            _ => StatusCode::Failure,
        }
    }

    /// Message safe to send to the client. Auth and permission failures
    /// never reveal why; the detailed reason goes to the log only.
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::Authentication(_) => "Authentication error".to_string(),
            Error::PermissionDenied(_) => "permission denied".to_string(),
            Error::NotFound(_) => "no such file".to_string(),
            Error::QuotaExceeded(_) => "quota exceeded".to_string(),
            Error::Config(_) => "server configuration error".to_string(),
            Error::Io(_) => "failure".to_string(),
            other => other.to_string(),
        }
    }

    /// Errors worth an audit-level log entry
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::PermissionDenied(_) | Error::QuotaExceeded(_)
        )
    }

    /// Map an I/O error on a known virtual path to the protocol-level kind
    pub fn from_io(err: std::io::Error, virtual_path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(virtual_path.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(virtual_path.to_string())
            }
            _ => Error::Io(err),
        }
    }

    /// Status value carried in action notifications: 0 failed, 1 ok,
    /// 2 quota exceeded
    pub fn notification_status(err: Option<&Error>) -> u8 {
        match err {
            None => 1,
            Some(Error::QuotaExceeded(_)) => 2,
            Some(_) => 0,
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

impl From<tidegate_core::Error> for Error {
    fn from(err: tidegate_core::Error) -> Self {
        match err {
            tidegate_core::Error::UserNotFound(u) => {
                Error::Authentication(format!("unknown user {}", u))
            }
            tidegate_core::Error::InvalidCredentials => {
                Error::Authentication("invalid credentials".to_string())
            }
            tidegate_core::Error::FolderNotFound(f) => Error::NotFound(f),
            tidegate_core::Error::Io(e) => Error::Io(e),
            other => Error::Generic(other.to_string()),
        }
    }
}
