//! Quota scans and the process-wide scan registry.
//!
//! At most one scan per user and one per folder may run at a time:
//! admission returns false when a scan for the key is already present.
//! Removal happens through an RAII guard, so a scan that panics or bails
//! out early still releases its slot.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::error::Result;
use crate::vfs;
use tidegate_core::{User, VirtualFolder};
use tidegate_provider::DataProvider;

/// An in-progress scan of a user's home
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveUserScan {
    pub username: String,
    /// Start time as unix milliseconds
    pub start_time: i64,
}

/// An in-progress scan of a shared virtual folder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveFolderScan {
    pub name: String,
    pub start_time: i64,
}

#[derive(Default)]
pub struct ScanRegistry {
    user_scans: RwLock<HashMap<String, i64>>,
    folder_scans: RwLock<HashMap<String, i64>>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScanRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admit a user scan. False when one is already running.
    pub fn add_user_scan(&self, username: &str) -> bool {
        let mut scans = write_lock(&self.user_scans);
        if scans.contains_key(username) {
            return false;
        }
        scans.insert(username.to_string(), Utc::now().timestamp_millis());
        true
    }

    pub fn remove_user_scan(&self, username: &str) {
        let mut scans = write_lock(&self.user_scans);
        if scans.remove(username).is_none() {
            warn!(username, "user scan to remove not found");
        }
    }

    /// Admit a folder scan. False when one is already running.
    pub fn add_folder_scan(&self, name: &str) -> bool {
        let mut scans = write_lock(&self.folder_scans);
        if scans.contains_key(name) {
            return false;
        }
        scans.insert(name.to_string(), Utc::now().timestamp_millis());
        true
    }

    pub fn remove_folder_scan(&self, name: &str) {
        let mut scans = write_lock(&self.folder_scans);
        if scans.remove(name).is_none() {
            warn!(folder = name, "folder scan to remove not found");
        }
    }

    /// Independent snapshot of the running user scans
    pub fn user_scans(&self) -> Vec<ActiveUserScan> {
        let scans = read_lock(&self.user_scans);
        scans
            .iter()
            .map(|(username, start_time)| ActiveUserScan {
                username: username.clone(),
                start_time: *start_time,
            })
            .collect()
    }

    /// Independent snapshot of the running folder scans
    pub fn folder_scans(&self) -> Vec<ActiveFolderScan> {
        let scans = read_lock(&self.folder_scans);
        scans
            .iter()
            .map(|(name, start_time)| ActiveFolderScan {
                name: name.clone(),
                start_time: *start_time,
            })
            .collect()
    }

    /// Admission with RAII release for user scans
    pub fn guard_user_scan(self: &Arc<Self>, username: &str) -> Option<ScanGuard> {
        if !self.add_user_scan(username) {
            return None;
        }
        Some(ScanGuard {
            registry: Arc::clone(self),
            key: username.to_string(),
            kind: ScanKind::User,
        })
    }

    /// Admission with RAII release for folder scans
    pub fn guard_folder_scan(self: &Arc<Self>, name: &str) -> Option<ScanGuard> {
        if !self.add_folder_scan(name) {
            return None;
        }
        Some(ScanGuard {
            registry: Arc::clone(self),
            key: name.to_string(),
            kind: ScanKind::Folder,
        })
    }
}

enum ScanKind {
    User,
    Folder,
}

/// Releases the scan slot on every exit path, panics included
pub struct ScanGuard {
    registry: Arc<ScanRegistry>,
    key: String,
    kind: ScanKind,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        match self.kind {
            ScanKind::User => self.registry.remove_user_scan(&self.key),
            ScanKind::Folder => self.registry.remove_folder_scan(&self.key),
        }
    }
}

/// Walk the user's home and replace the stored totals with the result.
/// A scan always runs in reset mode: it sets, never accumulates. Mapped
/// paths of the user's virtual folders are excluded; those belong to
/// the shared folder totals.
pub async fn perform_user_scan(
    provider: &Arc<dyn DataProvider>,
    user: &User,
) -> Result<(i64, i64)> {
    let excluded: Vec<std::path::PathBuf> = user
        .virtual_folders
        .iter()
        .map(|f| f.mapped_path.clone())
        .collect();
    let (files, bytes) = vfs::dir_size_excluding(&user.home_dir, &excluded).await?;
    provider
        .update_user_quota(&user.username, files, bytes, true)
        .await?;
    info!(username = %user.username, files, bytes, "user quota scan completed");
    Ok((files, bytes))
}

/// Walk a folder's mapped path and replace the stored totals
pub async fn perform_folder_scan(
    provider: &Arc<dyn DataProvider>,
    folder: &VirtualFolder,
) -> Result<(i64, i64)> {
    let (files, bytes) = vfs::dir_size(&folder.mapped_path).await?;
    provider
        .update_folder_quota(&folder.name, files, bytes, true)
        .await?;
    info!(folder = %folder.name, files, bytes, "folder quota scan completed");
    Ok((files, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_at_most_once() {
        let registry = ScanRegistry::new();
        assert!(registry.add_user_scan("u1"));
        assert!(!registry.add_user_scan("u1"));
        assert!(registry.add_user_scan("u2"));
        assert_eq!(registry.user_scans().len(), 2);

        registry.remove_user_scan("u1");
        assert!(registry.add_user_scan("u1"));
    }

    #[test]
    fn test_folder_scans_are_disjoint_from_user_scans() {
        let registry = ScanRegistry::new();
        assert!(registry.add_user_scan("name"));
        assert!(registry.add_folder_scan("name"));
        assert_eq!(registry.user_scans().len(), 1);
        assert_eq!(registry.folder_scans().len(), 1);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let registry = ScanRegistry::new();
        registry.add_user_scan("u1");
        let snapshot = registry.user_scans();
        registry.remove_user_scan("u1");
        assert_eq!(snapshot.len(), 1);
        assert!(registry.user_scans().is_empty());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = ScanRegistry::new();
        {
            let _guard = registry.guard_user_scan("u1").unwrap();
            assert!(registry.guard_user_scan("u1").is_none());
        }
        assert!(registry.guard_user_scan("u1").is_some());
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let registry = ScanRegistry::new();
        let cloned = Arc::clone(&registry);
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.guard_folder_scan("f1").unwrap();
            panic!("scan blew up");
        });
        assert!(result.is_err());
        assert!(registry.guard_folder_scan("f1").is_some());
    }

    #[test]
    fn test_remove_nonexistent_scan_is_harmless() {
        let registry = ScanRegistry::new();
        registry.remove_user_scan("ghost");
        registry.remove_folder_scan("ghost");
        assert!(registry.user_scans().is_empty());
    }
}
