//! # tidegate-sftp
//!
//! The SFTP/SCP core of tidegate: SSH front end, per-session virtual
//! filesystems with permission and quota enforcement, the SCP
//! sub-protocol, an allow-listed SSH command dispatcher, and the
//! process-wide quota-scan and connection registries consumed by the
//! HTTP control plane.
//!
//! The SSH transport is provided by `russh`; the SFTP wire protocol
//! (version 3, draft-ietf-secsh-filexfer-02) is implemented in the
//! [`protocol`] module and driven by [`handler`].

pub mod actions;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod quota;
pub mod registry;
pub mod scp;
pub mod server;
pub mod session;
pub mod ssh_command;
pub mod transfer;
pub mod vfs;

pub use actions::{ActionNotification, ActionsConfig};
pub use config::{SetstatMode, SftpdConfig, UploadMode};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use quota::{ActiveFolderScan, ActiveUserScan, ScanRegistry};
pub use registry::{ConnectionRegistry, ConnectionStatus};
pub use server::SftpServer;
pub use session::{Protocol, ServerSession};
pub use transfer::Transfer;
pub use vfs::VirtualFs;
