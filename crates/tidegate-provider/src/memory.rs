//! Reference in-memory data provider.
//!
//! Backs the test suite and the `initprovider` bootstrap path. Users and
//! folders can be loaded from a JSON dump; passwords are stored either as
//! `$sha256$<hex>` digests or, for test fixtures, as plaintext.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::provider::DataProvider;
use tidegate_core::{Error, QuotaTracking, Result, User, VirtualFolder};

const SHA256_PREFIX: &str = "$sha256$";

/// Serialized provider state, also the `initprovider` dump format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProviderDump {
    #[serde(default)]
    pub users: Vec<StoredUser>,
    #[serde(default)]
    pub folders: Vec<VirtualFolder>,
}

/// A user record together with its credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredUser {
    #[serde(flatten)]
    pub user: User,
    /// `$sha256$<hex>` or plaintext
    #[serde(default)]
    pub password: String,
    /// Authorized public keys, OpenSSH one-line format
    #[serde(default)]
    pub public_keys: Vec<String>,
}

/// In-memory provider guarded by a read-write lock per table
pub struct MemoryProvider {
    users: RwLock<HashMap<String, StoredUser>>,
    folders: RwLock<HashMap<String, VirtualFolder>>,
    tracking: QuotaTracking,
}

impl MemoryProvider {
    pub fn new(tracking: QuotaTracking) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            folders: RwLock::new(HashMap::new()),
            tracking,
        }
    }

    /// Load users and folders from a JSON dump file
    pub async fn from_dump_file(path: &Path, tracking: QuotaTracking) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let dump: ProviderDump = serde_json::from_slice(&data)
            .map_err(|e| Error::Provider(format!("invalid provider dump: {}", e)))?;
        let provider = Self::new(tracking);
        for folder in dump.folders {
            provider.add_folder(folder).await?;
        }
        for user in dump.users {
            provider.add_user(user).await?;
        }
        info!(path = %path.display(), "provider state loaded");
        Ok(provider)
    }

    /// Write an empty dump file, creating parent directories
    pub async fn write_initial_dump(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dump = ProviderDump::default();
        let data = serde_json::to_vec_pretty(&dump)
            .map_err(|e| Error::Provider(format!("cannot serialize dump: {}", e)))?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    pub async fn add_user(&self, stored: StoredUser) -> Result<()> {
        validate_user(&stored.user)?;
        let mut users = self.users.write().await;
        users.insert(stored.user.username.clone(), stored);
        Ok(())
    }

    pub async fn add_folder(&self, folder: VirtualFolder) -> Result<()> {
        if !folder.mapped_path.is_absolute() {
            return Err(Error::Validation(format!(
                "folder {} has a relative mapped path",
                folder.name
            )));
        }
        let mut folders = self.folders.write().await;
        folders.insert(folder.name.clone(), folder);
        Ok(())
    }

    /// Hash a password into the stored representation
    pub fn hash_password(plain: &str) -> String {
        let digest = Sha256::digest(plain.as_bytes());
        format!("{}{:x}", SHA256_PREFIX, digest)
    }

    fn verify_password(stored: &str, offered: &str) -> bool {
        if let Some(hex) = stored.strip_prefix(SHA256_PREFIX) {
            let digest = Sha256::digest(offered.as_bytes());
            return format!("{:x}", digest) == hex;
        }
        !stored.is_empty() && stored == offered
    }

    async fn lookup(&self, username: &str) -> Result<StoredUser> {
        let users = self.users.read().await;
        users
            .get(username)
            .cloned()
            .ok_or_else(|| Error::UserNotFound(username.to_string()))
    }

    /// Attach the shared folder usage counters to the user snapshot
    async fn hydrate_folders(&self, user: &mut User) {
        let folders = self.folders.read().await;
        for vf in &mut user.virtual_folders {
            if let Some(stored) = folders.get(&vf.name) {
                vf.used_quota_files = stored.used_quota_files;
                vf.used_quota_size = stored.used_quota_size;
                vf.mapped_path = stored.mapped_path.clone();
            }
        }
    }
}

#[async_trait]
impl DataProvider for MemoryProvider {
    async fn user_exists(&self, username: &str) -> Result<User> {
        let mut user = self.lookup(username).await?.user;
        self.hydrate_folders(&mut user).await;
        Ok(user)
    }

    async fn check_user_and_pass(
        &self,
        username: &str,
        password: &str,
        ip: &str,
        protocol: &str,
    ) -> Result<User> {
        let stored = self.lookup(username).await?;
        if !Self::verify_password(&stored.password, password) {
            debug!(username, ip, protocol, "password mismatch");
            return Err(Error::InvalidCredentials);
        }
        let mut user = stored.user;
        self.hydrate_folders(&mut user).await;
        Ok(user)
    }

    async fn check_user_and_pub_key(
        &self,
        username: &str,
        pub_key: &str,
    ) -> Result<(User, String)> {
        let stored = self.lookup(username).await?;
        let offered = key_blob(pub_key);
        for (idx, authorized) in stored.public_keys.iter().enumerate() {
            if key_blob(authorized) == offered {
                let key_id = authorized
                    .split_whitespace()
                    .nth(2)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("key-{}", idx));
                let mut user = stored.user;
                self.hydrate_folders(&mut user).await;
                return Ok((user, key_id));
            }
        }
        Err(Error::InvalidCredentials)
    }

    async fn check_keyboard_interactive_auth(&self, username: &str, _ip: &str) -> Result<User> {
        let mut user = self.lookup(username).await?.user;
        self.hydrate_folders(&mut user).await;
        Ok(user)
    }

    async fn update_user_quota(
        &self,
        username: &str,
        files: i64,
        size: i64,
        reset: bool,
    ) -> Result<()> {
        let mut users = self.users.write().await;
        let stored = users
            .get_mut(username)
            .ok_or_else(|| Error::UserNotFound(username.to_string()))?;
        if reset {
            stored.user.used_quota_files = files;
            stored.user.used_quota_size = size;
        } else {
            stored.user.used_quota_files += files;
            stored.user.used_quota_size += size;
        }
        if stored.user.used_quota_files < 0 || stored.user.used_quota_size < 0 {
            warn!(
                username,
                files = stored.user.used_quota_files,
                size = stored.user.used_quota_size,
                "negative quota usage clamped"
            );
            stored.user.used_quota_files = stored.user.used_quota_files.max(0);
            stored.user.used_quota_size = stored.user.used_quota_size.max(0);
        }
        Ok(())
    }

    async fn update_folder_quota(
        &self,
        name: &str,
        files: i64,
        size: i64,
        reset: bool,
    ) -> Result<()> {
        let mut folders = self.folders.write().await;
        let folder = folders
            .get_mut(name)
            .ok_or_else(|| Error::FolderNotFound(name.to_string()))?;
        if reset {
            folder.used_quota_files = files;
            folder.used_quota_size = size;
        } else {
            folder.used_quota_files = (folder.used_quota_files + files).max(0);
            folder.used_quota_size = (folder.used_quota_size + size).max(0);
        }
        Ok(())
    }

    async fn get_used_quota(&self, username: &str) -> Result<(i64, i64)> {
        let stored = self.lookup(username).await?;
        Ok((stored.user.used_quota_files, stored.user.used_quota_size))
    }

    async fn get_used_folder_quota(&self, name: &str) -> Result<(i64, i64)> {
        let folders = self.folders.read().await;
        let folder = folders
            .get(name)
            .ok_or_else(|| Error::FolderNotFound(name.to_string()))?;
        Ok((folder.used_quota_files, folder.used_quota_size))
    }

    async fn get_folder_by_name(&self, name: &str) -> Result<VirtualFolder> {
        let folders = self.folders.read().await;
        folders
            .get(name)
            .cloned()
            .ok_or_else(|| Error::FolderNotFound(name.to_string()))
    }

    fn quota_tracking(&self) -> QuotaTracking {
        self.tracking
    }

    async fn update_last_login(&self, username: &str) -> Result<()> {
        let mut users = self.users.write().await;
        if let Some(stored) = users.get_mut(username) {
            stored.user.last_login = Some(Utc::now());
        }
        Ok(())
    }
}

fn validate_user(user: &User) -> Result<()> {
    if user.username.is_empty() {
        return Err(Error::Validation("username is empty".to_string()));
    }
    if !user.home_dir.is_absolute() {
        return Err(Error::Validation(format!(
            "user {} has a relative home dir",
            user.username
        )));
    }
    if !user.permissions.contains_key("/") {
        return Err(Error::Validation(format!(
            "user {} has no root permission entry",
            user.username
        )));
    }
    for vf in &user.virtual_folders {
        if !vf.virtual_path.starts_with('/') {
            return Err(Error::Validation(format!(
                "virtual folder {} has a relative virtual path",
                vf.name
            )));
        }
    }
    Ok(())
}

/// The base64 blob of an OpenSSH one-line key, ignoring type prefix
/// differences in spacing and the trailing comment
fn key_blob(line: &str) -> &str {
    let mut parts = line.split_whitespace();
    let first = parts.next().unwrap_or("");
    match parts.next() {
        Some(blob) => blob,
        None => first,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tidegate_core::Permission;

    fn test_user(name: &str) -> StoredUser {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        StoredUser {
            user: User {
                username: name.to_string(),
                home_dir: PathBuf::from("/srv").join(name),
                status: Default::default(),
                expiration_date: 0,
                permissions,
                filters: Default::default(),
                quota_files: 0,
                quota_size: 0,
                max_sessions: 0,
                used_quota_files: 0,
                used_quota_size: 0,
                last_login: None,
                fs_config: Default::default(),
                virtual_folders: Vec::new(),
            },
            password: MemoryProvider::hash_password("secret"),
            public_keys: vec!["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKx7 test@host".to_string()],
        }
    }

    #[tokio::test]
    async fn test_password_auth() {
        let provider = MemoryProvider::new(QuotaTracking::Full);
        provider.add_user(test_user("alice")).await.unwrap();

        assert!(provider
            .check_user_and_pass("alice", "secret", "127.0.0.1", "SFTP")
            .await
            .is_ok());
        assert!(provider
            .check_user_and_pass("alice", "wrong", "127.0.0.1", "SFTP")
            .await
            .is_err());
        assert!(provider
            .check_user_and_pass("nobody", "secret", "127.0.0.1", "SFTP")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pub_key_auth() {
        let provider = MemoryProvider::new(QuotaTracking::Full);
        provider.add_user(test_user("alice")).await.unwrap();

        let (user, key_id) = provider
            .check_user_and_pub_key("alice", "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKx7")
            .await
            .unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(key_id, "test@host");

        assert!(provider
            .check_user_and_pub_key("alice", "ssh-ed25519 AAAAother")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_quota_updates() {
        let provider = MemoryProvider::new(QuotaTracking::Full);
        provider.add_user(test_user("alice")).await.unwrap();

        provider
            .update_user_quota("alice", 2, 1024, false)
            .await
            .unwrap();
        assert_eq!(provider.get_used_quota("alice").await.unwrap(), (2, 1024));

        provider
            .update_user_quota("alice", -1, -512, false)
            .await
            .unwrap();
        assert_eq!(provider.get_used_quota("alice").await.unwrap(), (1, 512));

        provider
            .update_user_quota("alice", 7, 7777, true)
            .await
            .unwrap();
        assert_eq!(provider.get_used_quota("alice").await.unwrap(), (7, 7777));
    }

    #[tokio::test]
    async fn test_folder_usage_is_shared() {
        let provider = MemoryProvider::new(QuotaTracking::Full);
        provider
            .add_folder(VirtualFolder {
                name: "shared".to_string(),
                mapped_path: PathBuf::from("/data/shared"),
                virtual_path: "/shared".to_string(),
                used_quota_files: 0,
                used_quota_size: 0,
                quota_files: -1,
                quota_size: -1,
            })
            .await
            .unwrap();
        let mut stored = test_user("alice");
        stored.user.virtual_folders.push(VirtualFolder {
            name: "shared".to_string(),
            mapped_path: PathBuf::from("/data/shared"),
            virtual_path: "/shared".to_string(),
            used_quota_files: 0,
            used_quota_size: 0,
            quota_files: -1,
            quota_size: -1,
        });
        provider.add_user(stored).await.unwrap();

        provider
            .update_folder_quota("shared", 3, 999, false)
            .await
            .unwrap();
        let user = provider.user_exists("alice").await.unwrap();
        assert_eq!(user.virtual_folders[0].used_quota_files, 3);
        assert_eq!(user.virtual_folders[0].used_quota_size, 999);
    }

    #[tokio::test]
    async fn test_validation() {
        let provider = MemoryProvider::new(QuotaTracking::Full);
        let mut bad = test_user("bob");
        bad.user.home_dir = PathBuf::from("relative/home");
        assert!(provider.add_user(bad).await.is_err());

        let mut no_root = test_user("bob");
        no_root.user.permissions.remove("/");
        assert!(provider.add_user(no_root).await.is_err());
    }

    #[tokio::test]
    async fn test_dump_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.json");
        MemoryProvider::write_initial_dump(&path).await.unwrap();
        let provider = MemoryProvider::from_dump_file(&path, QuotaTracking::Full)
            .await
            .unwrap();
        assert!(provider.user_exists("anyone").await.is_err());
    }
}
