//! # tidegate-provider
//!
//! The data-provider contract consumed by the protocol front ends, plus a
//! reference in-memory implementation and the delayed quota updater.
//!
//! The provider owns users and virtual folders; the servers only read
//! snapshots and push quota/login updates through the narrow [`DataProvider`]
//! trait. Swapping in a database-backed provider means implementing the
//! trait, nothing else.

pub mod memory;
pub mod provider;
pub mod quota_updater;

pub use memory::MemoryProvider;
pub use provider::DataProvider;
pub use quota_updater::DelayedQuotaProvider;
