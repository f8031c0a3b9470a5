//! Delayed quota accounting.
//!
//! [`DelayedQuotaProvider`] decorates another provider: quota deltas are
//! buffered in signed per-key pairs and flushed periodically, so busy
//! transfer loops do not hit the backing store once per file. Reads fold
//! the pending deltas into the stored totals, preserving read-your-writes.
//!
//! A key is dropped from the pending map as soon as both of its deltas
//! return to zero. Flushes subtract exactly what was written, so a flush
//! racing new deltas never loses updates, and a failed flush leaves the
//! deltas in place for an idempotent retry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::provider::DataProvider;
use tidegate_core::{QuotaTracking, Result, User, VirtualFolder};

type PendingMap = Mutex<HashMap<String, (i64, i64)>>;

pub struct DelayedQuotaProvider {
    inner: Arc<dyn DataProvider>,
    users: PendingMap,
    folders: PendingMap,
    /// Zero means write-through: every update goes straight to the
    /// backing provider
    interval: Duration,
    shutdown: Notify,
}

impl DelayedQuotaProvider {
    pub fn new(inner: Arc<dyn DataProvider>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            users: Mutex::new(HashMap::new()),
            folders: Mutex::new(HashMap::new()),
            interval,
            shutdown: Notify::new(),
        })
    }

    pub fn is_write_through(&self) -> bool {
        self.interval.is_zero()
    }

    /// Start the periodic flusher. A no-op in write-through mode.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.is_write_through() {
            return None;
        }
        let updater = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(updater.interval) => {
                        updater.store_users_quota().await;
                        updater.store_folders_quota().await;
                    }
                    _ = updater.shutdown.notified() => {
                        debug!("quota flusher stopping");
                        break;
                    }
                }
            }
        }))
    }

    /// Pending (files, bytes) deltas for a user, zero when absent
    pub async fn user_pending_quota(&self, username: &str) -> (i64, i64) {
        let users = self.users.lock().await;
        users.get(username).copied().unwrap_or((0, 0))
    }

    /// Pending (files, bytes) deltas for a folder, zero when absent
    pub async fn folder_pending_quota(&self, name: &str) -> (i64, i64) {
        let folders = self.folders.lock().await;
        folders.get(name).copied().unwrap_or((0, 0))
    }

    /// Usernames with a pending delta
    pub async fn pending_usernames(&self) -> Vec<String> {
        let users = self.users.lock().await;
        users.keys().cloned().collect()
    }

    /// Flush the pending user deltas to the backing provider
    pub async fn store_users_quota(&self) {
        let snapshot: Vec<(String, (i64, i64))> = {
            let users = self.users.lock().await;
            users.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        for (username, (files, size)) in snapshot {
            if files == 0 && size == 0 {
                continue;
            }
            match self.inner.update_user_quota(&username, files, size, false).await {
                Ok(()) => accumulate(&self.users, &username, -files, -size).await,
                Err(e) => {
                    warn!(username, error = %e, "user quota flush failed, will retry");
                }
            }
        }
    }

    /// Flush the pending folder deltas to the backing provider
    pub async fn store_folders_quota(&self) {
        let snapshot: Vec<(String, (i64, i64))> = {
            let folders = self.folders.lock().await;
            folders.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        for (name, (files, size)) in snapshot {
            if files == 0 && size == 0 {
                continue;
            }
            match self.inner.update_folder_quota(&name, files, size, false).await {
                Ok(()) => accumulate(&self.folders, &name, -files, -size).await,
                Err(e) => {
                    warn!(folder = name, error = %e, "folder quota flush failed, will retry");
                }
            }
        }
    }
}

/// Add a signed delta to a pending entry, removing it when both values
/// return to zero
async fn accumulate(map: &PendingMap, key: &str, files: i64, size: i64) {
    let mut map = map.lock().await;
    let entry = map.entry(key.to_string()).or_insert((0, 0));
    entry.0 += files;
    entry.1 += size;
    if entry.0 == 0 && entry.1 == 0 {
        map.remove(key);
    }
}

async fn clear(map: &PendingMap, key: &str) {
    let mut map = map.lock().await;
    map.remove(key);
}

#[async_trait]
impl DataProvider for DelayedQuotaProvider {
    async fn user_exists(&self, username: &str) -> Result<User> {
        self.inner.user_exists(username).await
    }

    async fn check_user_and_pass(
        &self,
        username: &str,
        password: &str,
        ip: &str,
        protocol: &str,
    ) -> Result<User> {
        self.inner
            .check_user_and_pass(username, password, ip, protocol)
            .await
    }

    async fn check_user_and_pub_key(
        &self,
        username: &str,
        pub_key: &str,
    ) -> Result<(User, String)> {
        self.inner.check_user_and_pub_key(username, pub_key).await
    }

    async fn check_keyboard_interactive_auth(&self, username: &str, ip: &str) -> Result<User> {
        self.inner.check_keyboard_interactive_auth(username, ip).await
    }

    async fn update_user_quota(
        &self,
        username: &str,
        files: i64,
        size: i64,
        reset: bool,
    ) -> Result<()> {
        if reset {
            // a reset supersedes whatever was buffered
            clear(&self.users, username).await;
            return self.inner.update_user_quota(username, files, size, true).await;
        }
        if self.is_write_through() {
            return self.inner.update_user_quota(username, files, size, false).await;
        }
        accumulate(&self.users, username, files, size).await;
        Ok(())
    }

    async fn update_folder_quota(
        &self,
        name: &str,
        files: i64,
        size: i64,
        reset: bool,
    ) -> Result<()> {
        if reset {
            clear(&self.folders, name).await;
            return self.inner.update_folder_quota(name, files, size, true).await;
        }
        if self.is_write_through() {
            return self.inner.update_folder_quota(name, files, size, false).await;
        }
        accumulate(&self.folders, name, files, size).await;
        Ok(())
    }

    async fn get_used_quota(&self, username: &str) -> Result<(i64, i64)> {
        let (files, size) = self.inner.get_used_quota(username).await?;
        let (pending_files, pending_size) = self.user_pending_quota(username).await;
        Ok((files + pending_files, size + pending_size))
    }

    async fn get_used_folder_quota(&self, name: &str) -> Result<(i64, i64)> {
        let (files, size) = self.inner.get_used_folder_quota(name).await?;
        let (pending_files, pending_size) = self.folder_pending_quota(name).await;
        Ok((files + pending_files, size + pending_size))
    }

    async fn get_folder_by_name(&self, name: &str) -> Result<VirtualFolder> {
        self.inner.get_folder_by_name(name).await
    }

    fn quota_tracking(&self) -> QuotaTracking {
        self.inner.quota_tracking()
    }

    async fn update_last_login(&self, username: &str) -> Result<()> {
        self.inner.update_last_login(username).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        self.store_users_quota().await;
        self.store_folders_quota().await;
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryProvider, StoredUser};
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;
    use tidegate_core::Permission;

    async fn provider_with_user(name: &str) -> Arc<MemoryProvider> {
        let provider = Arc::new(MemoryProvider::new(QuotaTracking::Full));
        let mut permissions = StdHashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        let stored = StoredUser {
            user: User {
                username: name.to_string(),
                home_dir: PathBuf::from("/srv").join(name),
                status: Default::default(),
                expiration_date: 0,
                permissions,
                filters: Default::default(),
                quota_files: 100,
                quota_size: 0,
                max_sessions: 0,
                used_quota_files: 0,
                used_quota_size: 0,
                last_login: None,
                fs_config: Default::default(),
                virtual_folders: Vec::new(),
            },
            password: String::new(),
            public_keys: Vec::new(),
        };
        provider.add_user(stored).await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_pending_entry_removed_at_zero() {
        let inner = provider_with_user("user1").await;
        let delayed = DelayedQuotaProvider::new(inner, Duration::from_secs(120));

        delayed.update_user_quota("user1", 10, 1234, false).await.unwrap();
        assert_eq!(delayed.user_pending_quota("user1").await, (10, 1234));
        assert_eq!(delayed.pending_usernames().await.len(), 1);

        delayed.update_user_quota("user1", -10, -1234, false).await.unwrap();
        assert_eq!(delayed.user_pending_quota("user1").await, (0, 0));
        assert!(delayed.pending_usernames().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_pending() {
        let inner = provider_with_user("user1").await;
        let delayed = DelayedQuotaProvider::new(inner, Duration::from_secs(120));

        delayed.update_user_quota("user1", 10, 1234, false).await.unwrap();
        delayed.update_user_quota("user1", 3, 300, true).await.unwrap();
        assert_eq!(delayed.user_pending_quota("user1").await, (0, 0));
        assert_eq!(delayed.get_used_quota("user1").await.unwrap(), (3, 300));
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let inner = provider_with_user("user1").await;
        let delayed = DelayedQuotaProvider::new(inner.clone(), Duration::from_secs(120));

        delayed.update_user_quota("user1", 10, 6000, false).await.unwrap();
        // the backing store has not seen the delta yet
        assert_eq!(inner.get_used_quota("user1").await.unwrap(), (0, 0));
        // but the folded read has
        assert_eq!(delayed.get_used_quota("user1").await.unwrap(), (10, 6000));

        delayed.store_users_quota().await;
        assert_eq!(inner.get_used_quota("user1").await.unwrap(), (10, 6000));
        assert_eq!(delayed.user_pending_quota("user1").await, (0, 0));
        assert_eq!(delayed.get_used_quota("user1").await.unwrap(), (10, 6000));
    }

    #[tokio::test]
    async fn test_write_through_mode() {
        let inner = provider_with_user("user1").await;
        let delayed = DelayedQuotaProvider::new(inner.clone(), Duration::ZERO);
        assert!(delayed.start().is_none());

        delayed.update_user_quota("user1", 1, 100, false).await.unwrap();
        assert_eq!(inner.get_used_quota("user1").await.unwrap(), (1, 100));
        assert_eq!(delayed.user_pending_quota("user1").await, (0, 0));
    }

    #[tokio::test]
    async fn test_close_flushes() {
        let inner = provider_with_user("user1").await;
        let delayed = DelayedQuotaProvider::new(inner.clone(), Duration::from_secs(120));

        delayed.update_user_quota("user1", 5, 500, false).await.unwrap();
        delayed.close().await.unwrap();
        assert_eq!(inner.get_used_quota("user1").await.unwrap(), (5, 500));
    }
}
