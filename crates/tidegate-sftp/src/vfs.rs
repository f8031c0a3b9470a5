//! Per-session virtual filesystem.
//!
//! A [`VirtualFs`] binds a user snapshot to a connection: it translates
//! virtual paths rooted at the user's home, delegates segments that fall
//! inside a virtual folder to the folder's mapped path, and refuses any
//! resolution that escapes the owning prefix. All concrete I/O goes
//! through `tokio::fs` against local disk; remote provider tags only
//! drive the capability flags consumed by the transfer pipeline.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::FileAttrs;
use tidegate_core::{clean_virtual_path, User};

pub struct VirtualFs {
    user: Arc<User>,
    connection_id: String,
}

impl VirtualFs {
    pub fn new(user: Arc<User>, connection_id: impl Into<String>) -> Self {
        Self {
            user,
            connection_id: connection_id.into(),
        }
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_atomic_upload_supported(&self) -> bool {
        self.user.fs_config.provider.supports_atomic_upload()
    }

    pub fn is_upload_resume_supported(&self) -> bool {
        self.user.fs_config.provider.supports_upload_resume()
    }

    /// Translate a virtual path into the backing host path.
    ///
    /// Relative inputs are treated as absolute from "/". After cleaning,
    /// the result must be lexically contained by the user's home or by
    /// the mapped path of the owning virtual folder.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        if virtual_path.contains('\0') {
            return Err(Error::PermissionDenied(virtual_path.to_string()));
        }
        let cleaned = clean_virtual_path(virtual_path);
        let (base, remainder) = match self.user.virtual_folder_for_path(&cleaned) {
            Some(folder) => {
                let mount = clean_virtual_path(&folder.virtual_path);
                let rest = cleaned[mount.len()..].trim_start_matches('/').to_string();
                (folder.mapped_path.clone(), rest)
            }
            None => (
                self.user.home_dir.clone(),
                cleaned.trim_start_matches('/').to_string(),
            ),
        };
        let mut host = base.clone();
        for segment in remainder.split('/').filter(|s| !s.is_empty()) {
            match segment {
                "." => {}
                ".." => {
                    host.pop();
                }
                other => host.push(other),
            }
        }
        let host = normalize(&host);
        if !host.starts_with(normalize(&base)) {
            warn!(
                connection_id = %self.connection_id,
                path = virtual_path,
                "path resolution escaped its base"
            );
            return Err(Error::PermissionDenied(virtual_path.to_string()));
        }
        Ok(host)
    }

    /// Inverse of [`resolve`]: the virtual path for a host path, falling
    /// back to "/" for paths outside the user tree
    pub fn virtual_path(&self, host: &Path) -> String {
        for folder in &self.user.virtual_folders {
            if let Ok(rest) = host.strip_prefix(&folder.mapped_path) {
                let mount = clean_virtual_path(&folder.virtual_path);
                return join_virtual(&mount, rest);
            }
        }
        match host.strip_prefix(&self.user.home_dir) {
            Ok(rest) => join_virtual("/", rest),
            Err(_) => "/".to_string(),
        }
    }

    /// Create the home directory and the mapped paths if missing.
    /// Best-effort: failures are logged, not fatal.
    pub async fn check_root_path(&self) -> bool {
        let mut ok = true;
        let mut roots = vec![self.user.home_dir.clone()];
        roots.extend(self.user.virtual_folders.iter().map(|f| f.mapped_path.clone()));
        for root in roots {
            if let Err(e) = fs::create_dir_all(&root).await {
                warn!(
                    connection_id = %self.connection_id,
                    path = %root.display(),
                    error = %e,
                    "cannot create root directory"
                );
                ok = false;
            }
        }
        ok
    }

    pub async fn stat(&self, virtual_path: &str) -> Result<std::fs::Metadata> {
        let host = self.resolve(virtual_path)?;
        fs::metadata(&host)
            .await
            .map_err(|e| Error::from_io(e, virtual_path))
    }

    pub async fn lstat(&self, virtual_path: &str) -> Result<std::fs::Metadata> {
        let host = self.resolve(virtual_path)?;
        fs::symlink_metadata(&host)
            .await
            .map_err(|e| Error::from_io(e, virtual_path))
    }

    pub async fn open_read(&self, virtual_path: &str) -> Result<fs::File> {
        let host = self.resolve(virtual_path)?;
        fs::File::open(&host)
            .await
            .map_err(|e| Error::from_io(e, virtual_path))
    }

    pub async fn mkdir(&self, virtual_path: &str) -> Result<()> {
        let host = self.resolve(virtual_path)?;
        fs::create_dir(&host)
            .await
            .map_err(|e| Error::from_io(e, virtual_path))
    }

    pub async fn remove(&self, virtual_path: &str, is_dir: bool) -> Result<()> {
        let host = self.resolve(virtual_path)?;
        let res = if is_dir {
            fs::remove_dir(&host).await
        } else {
            fs::remove_file(&host).await
        };
        res.map_err(|e| Error::from_io(e, virtual_path))
    }

    pub async fn rename(&self, virtual_source: &str, virtual_target: &str) -> Result<()> {
        let src = self.resolve(virtual_source)?;
        let dst = self.resolve(virtual_target)?;
        fs::rename(&src, &dst)
            .await
            .map_err(|e| Error::from_io(e, virtual_source))
    }

    /// Directory entries as (name, attrs), with virtual folder mounts
    /// injected so a mount is visible even when no physical directory
    /// shadows it
    pub async fn read_dir(&self, virtual_path: &str) -> Result<Vec<(String, FileAttrs)>> {
        let host = self.resolve(virtual_path)?;
        let cleaned = clean_virtual_path(virtual_path);
        let mut entries = Vec::new();
        let mut reader = fs::read_dir(&host)
            .await
            .map_err(|e| Error::from_io(e, virtual_path))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::from_io(e, virtual_path))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            match entry.metadata().await {
                Ok(metadata) => entries.push((name, FileAttrs::from_metadata(&metadata))),
                Err(e) => debug!(name, error = %e, "skipping unreadable entry"),
            }
        }
        for folder in &self.user.virtual_folders {
            let mount = clean_virtual_path(&folder.virtual_path);
            let Some(parent_end) = mount.rfind('/') else {
                continue;
            };
            let parent = if parent_end == 0 { "/" } else { &mount[..parent_end] };
            let name = &mount[parent_end + 1..];
            if parent == cleaned && !entries.iter().any(|(n, _)| n == name) {
                if let Ok(metadata) = fs::metadata(&folder.mapped_path).await {
                    entries.push((name.to_string(), FileAttrs::from_metadata(&metadata)));
                }
            }
        }
        Ok(entries)
    }

    pub async fn set_permissions(&self, virtual_path: &str, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let host = self.resolve(virtual_path)?;
            fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| Error::from_io(e, virtual_path))
        }
        #[cfg(not(unix))]
        {
            let _ = (virtual_path, mode);
            Err(Error::OpUnsupported("chmod".to_string()))
        }
    }

    pub async fn set_owner(&self, virtual_path: &str, uid: u32, gid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            let host = self.resolve(virtual_path)?;
            std::os::unix::fs::chown(&host, Some(uid), Some(gid))
                .map_err(|e| Error::from_io(e, virtual_path))
        }
        #[cfg(not(unix))]
        {
            let _ = (virtual_path, uid, gid);
            Err(Error::OpUnsupported("chown".to_string()))
        }
    }

    pub async fn set_times(&self, virtual_path: &str, atime: u32, mtime: u32) -> Result<()> {
        let host = self.resolve(virtual_path)?;
        let atime = filetime::FileTime::from_unix_time(atime as i64, 0);
        let mtime = filetime::FileTime::from_unix_time(mtime as i64, 0);
        filetime::set_file_times(&host, atime, mtime).map_err(|e| Error::from_io(e, virtual_path))
    }

    pub async fn truncate(&self, virtual_path: &str, size: u64) -> Result<()> {
        let host = self.resolve(virtual_path)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&host)
            .await
            .map_err(|e| Error::from_io(e, virtual_path))?;
        file.set_len(size)
            .await
            .map_err(|e| Error::from_io(e, virtual_path))
    }

    pub async fn symlink(&self, target: &str, virtual_link: &str) -> Result<()> {
        #[cfg(unix)]
        {
            let link = self.resolve(virtual_link)?;
            // a virtual target resolves inside the user tree; a relative
            // one is kept as given
            let target_host = if target.starts_with('/') {
                self.resolve(target)?
            } else {
                PathBuf::from(target)
            };
            fs::symlink(&target_host, &link)
                .await
                .map_err(|e| Error::from_io(e, virtual_link))
        }
        #[cfg(not(unix))]
        {
            let _ = (target, virtual_link);
            Err(Error::OpUnsupported("symlink".to_string()))
        }
    }

    pub async fn read_link(&self, virtual_path: &str) -> Result<String> {
        let host = self.resolve(virtual_path)?;
        let target = fs::read_link(&host)
            .await
            .map_err(|e| Error::from_io(e, virtual_path))?;
        Ok(self.virtual_path(&target))
    }

    /// Recursive (files, bytes) total under the user's home. Mapped
    /// paths of virtual folders are excluded: their usage belongs to
    /// the shared folder, not to the user.
    pub async fn scan_root_contents(&self) -> Result<(i64, i64)> {
        let excluded: Vec<PathBuf> = self
            .user
            .virtual_folders
            .iter()
            .map(|f| f.mapped_path.clone())
            .collect();
        dir_size_excluding(&self.user.home_dir, &excluded).await
    }
}

/// Recursive (files, bytes) total under `root`. Symlinks are counted as
/// entries, never followed.
pub async fn dir_size(root: &Path) -> Result<(i64, i64)> {
    dir_size_excluding(root, &[]).await
}

/// Like [`dir_size`], skipping any subtree rooted at one of `excluded`
pub async fn dir_size_excluding(root: &Path, excluded: &[PathBuf]) -> Result<(i64, i64)> {
    let mut files = 0i64;
    let mut bytes = 0i64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut reader = match fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        while let Some(entry) = reader.next_entry().await.map_err(Error::Io)? {
            let path = entry.path();
            if excluded.iter().any(|e| *e == path) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.is_dir() {
                stack.push(path);
            } else if metadata.is_file() {
                files += 1;
                bytes += metadata.len() as i64;
            }
        }
    }
    Ok((files, bytes))
}

/// Lexical normalization of a host path: resolves `.` and `..`
/// components without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn join_virtual(base: &str, rest: &Path) -> String {
    let rest = rest.to_string_lossy();
    if rest.is_empty() {
        base.to_string()
    } else if base == "/" {
        format!("/{}", rest)
    } else {
        format!("{}/{}", base, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tidegate_core::{Permission, VirtualFolder};

    fn make_user(home: &Path) -> User {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        User {
            username: "fsuser".to_string(),
            home_dir: home.to_path_buf(),
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
        }
    }

    fn make_fs(user: User) -> VirtualFs {
        VirtualFs::new(Arc::new(user), "test-conn")
    }

    #[test]
    fn test_resolve_inside_home() {
        let fs = make_fs(make_user(Path::new("/srv/u1")));
        assert_eq!(fs.resolve("/a/b.txt").unwrap(), PathBuf::from("/srv/u1/a/b.txt"));
        // relative inputs anchor at "/"
        assert_eq!(fs.resolve("a/b.txt").unwrap(), PathBuf::from("/srv/u1/a/b.txt"));
        assert_eq!(fs.resolve("/").unwrap(), PathBuf::from("/srv/u1"));
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let fs = make_fs(make_user(Path::new("/srv/u1")));
        // cleaning swallows the traversal, the result stays in the home
        assert_eq!(
            fs.resolve("/../../etc/passwd").unwrap(),
            PathBuf::from("/srv/u1/etc/passwd")
        );
        assert!(fs.resolve("/ok\0bad").is_err());
    }

    #[test]
    fn test_resolve_through_virtual_folder() {
        let mut user = make_user(Path::new("/srv/u1"));
        user.virtual_folders.push(VirtualFolder {
            name: "shared".to_string(),
            mapped_path: PathBuf::from("/data/shared"),
            virtual_path: "/mnt/shared".to_string(),
            used_quota_files: 0,
            used_quota_size: 0,
            quota_files: -1,
            quota_size: -1,
        });
        let fs = make_fs(user);
        assert_eq!(
            fs.resolve("/mnt/shared/doc.txt").unwrap(),
            PathBuf::from("/data/shared/doc.txt")
        );
        assert_eq!(fs.resolve("/mnt/shared").unwrap(), PathBuf::from("/data/shared"));
        // outside the mount it is home-rooted again
        assert_eq!(fs.resolve("/mnt/other").unwrap(), PathBuf::from("/srv/u1/mnt/other"));
    }

    #[test]
    fn test_virtual_path_inverse() {
        let mut user = make_user(Path::new("/srv/u1"));
        user.virtual_folders.push(VirtualFolder {
            name: "shared".to_string(),
            mapped_path: PathBuf::from("/data/shared"),
            virtual_path: "/mnt/shared".to_string(),
            used_quota_files: 0,
            used_quota_size: 0,
            quota_files: -1,
            quota_size: -1,
        });
        let fs = make_fs(user);
        assert_eq!(fs.virtual_path(Path::new("/srv/u1/a/b")), "/a/b");
        assert_eq!(fs.virtual_path(Path::new("/data/shared/x")), "/mnt/shared/x");
        assert_eq!(fs.virtual_path(Path::new("/srv/u1")), "/");
        assert_eq!(fs.virtual_path(Path::new("/elsewhere")), "/");
    }

    #[test]
    fn test_resolution_idempotent() {
        let fs = make_fs(make_user(Path::new("/srv/u1")));
        let host = fs.resolve("/x/../y/z").unwrap();
        let roundtrip = fs.resolve(&fs.virtual_path(&host)).unwrap();
        assert_eq!(host, roundtrip);
    }

    #[tokio::test]
    async fn test_local_operations() {
        let dir = tempfile::tempdir().unwrap();
        let fs = make_fs(make_user(dir.path()));

        fs.mkdir("/sub").await.unwrap();
        tokio::fs::write(dir.path().join("sub/file.txt"), b"hello")
            .await
            .unwrap();

        let metadata = fs.stat("/sub/file.txt").await.unwrap();
        assert_eq!(metadata.len(), 5);

        let entries = fs.read_dir("/sub").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "file.txt");

        fs.rename("/sub/file.txt", "/sub/renamed.txt").await.unwrap();
        assert!(fs.stat("/sub/file.txt").await.is_err());

        fs.remove("/sub/renamed.txt", false).await.unwrap();
        fs.remove("/sub", true).await.unwrap();
        assert!(matches!(fs.stat("/sub").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_dir_size() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("a/b")).await.unwrap();
        tokio::fs::write(dir.path().join("a/one.bin"), vec![0u8; 100])
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("a/b/two.bin"), vec![0u8; 50])
            .await
            .unwrap();
        let (files, bytes) = dir_size(dir.path()).await.unwrap();
        assert_eq!(files, 2);
        assert_eq!(bytes, 150);
    }

    #[tokio::test]
    async fn test_scan_excludes_nested_mapped_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mapped = dir.path().join("mounted");
        tokio::fs::create_dir_all(&mapped).await.unwrap();
        tokio::fs::write(dir.path().join("own.bin"), vec![0u8; 10])
            .await
            .unwrap();
        tokio::fs::write(mapped.join("shared.bin"), vec![0u8; 999])
            .await
            .unwrap();

        let mut user = make_user(dir.path());
        user.virtual_folders.push(VirtualFolder {
            name: "mounted".to_string(),
            mapped_path: mapped,
            virtual_path: "/mounted".to_string(),
            used_quota_files: 0,
            used_quota_size: 0,
            quota_files: -1,
            quota_size: -1,
        });
        let fs = make_fs(user);
        // the mounted subtree belongs to the shared folder totals
        assert_eq!(fs.scan_root_contents().await.unwrap(), (1, 10));
    }

    #[tokio::test]
    async fn test_read_dir_injects_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let mapped = tempfile::tempdir().unwrap();
        let mut user = make_user(dir.path());
        user.virtual_folders.push(VirtualFolder {
            name: "shared".to_string(),
            mapped_path: mapped.path().to_path_buf(),
            virtual_path: "/shared".to_string(),
            used_quota_files: 0,
            used_quota_size: 0,
            quota_files: -1,
            quota_size: -1,
        });
        let fs = make_fs(user);
        let entries = fs.read_dir("/").await.unwrap();
        assert!(entries.iter().any(|(n, a)| n == "shared" && a.is_dir()));
    }
}
