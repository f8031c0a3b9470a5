//! # tidegate-core
//!
//! Shared domain types for the tidegate multi-tenant SFTP/SCP server:
//! users, permissions, per-path filters, virtual folders and filesystem
//! provider tags. Everything here is plain data; enforcement lives in the
//! protocol crates, persistence behind the data-provider contract.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    clean_virtual_path, pattern_matches, ExtensionsFilter, FsConfig, FsProvider, LoginMethod,
    Permission, QuotaTracking, User, UserFilters, UserStatus, VirtualFolder,
};
