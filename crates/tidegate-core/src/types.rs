use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Permission atoms that can be granted on a virtual path prefix.
///
/// `Any` implies every other atom. The set is closed: unknown names fail
/// deserialization instead of being silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// All permissions
    #[serde(rename = "*")]
    Any,
    /// List directory contents
    #[serde(rename = "list")]
    List,
    /// Download files
    #[serde(rename = "download")]
    Download,
    /// Upload new files
    #[serde(rename = "upload")]
    Upload,
    /// Overwrite existing files
    #[serde(rename = "overwrite")]
    Overwrite,
    /// Delete files and directories
    #[serde(rename = "delete")]
    Delete,
    /// Rename files and directories
    #[serde(rename = "rename")]
    Rename,
    /// Create directories
    #[serde(rename = "create_dirs")]
    CreateDirs,
    /// Create symbolic links
    #[serde(rename = "create_symlinks")]
    CreateSymlinks,
    /// Change file mode
    #[serde(rename = "chmod")]
    Chmod,
    /// Change file owner/group
    #[serde(rename = "chown")]
    Chown,
    /// Change file access/modification times
    #[serde(rename = "chtimes")]
    Chtimes,
    /// Start quota scans for the own account
    #[serde(rename = "quota_scans")]
    QuotaScans,
    /// Read server status over the control plane
    #[serde(rename = "view_server_status")]
    ViewServerStatus,
}

/// SSH login methods, including the two-step combinations used for
/// partial-success authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginMethod {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive,
    #[serde(rename = "publickey+password")]
    KeyAndPassword,
    #[serde(rename = "publickey+keyboard-interactive")]
    KeyAndKeyboardInt,
}

impl LoginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethod::Password => "password",
            LoginMethod::PublicKey => "publickey",
            LoginMethod::KeyboardInteractive => "keyboard-interactive",
            LoginMethod::KeyAndPassword => "publickey+password",
            LoginMethod::KeyAndKeyboardInt => "publickey+keyboard-interactive",
        }
    }
}

impl std::fmt::Display for LoginMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota tracking mode reported by the data provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaTracking {
    /// No quota accounting at all
    Off,
    /// Track usage for every user
    Full,
    /// Track usage only for users with quota restrictions
    RestrictionsOnly,
}

/// Filesystem provider tag.
///
/// Only the local provider has a concrete backend in this repository;
/// the remote tags drive capability decisions (atomic upload, resume) and
/// enrich action notifications with bucket/endpoint details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsProvider {
    Local,
    S3,
    Gcs,
    AzureBlob,
}

impl Default for FsProvider {
    fn default() -> Self {
        FsProvider::Local
    }
}

impl FsProvider {
    /// Renames on the final path are atomic only on local disk
    pub fn supports_atomic_upload(&self) -> bool {
        matches!(self, FsProvider::Local)
    }

    /// Partial uploads can only be resumed where random-access writes exist
    pub fn supports_upload_resume(&self) -> bool {
        matches!(self, FsProvider::Local)
    }

    /// Numeric tag used in action notifications
    pub fn as_code(&self) -> u8 {
        match self {
            FsProvider::Local => 0,
            FsProvider::S3 => 1,
            FsProvider::Gcs => 2,
            FsProvider::AzureBlob => 3,
        }
    }
}

/// Remote object-storage coordinates, kept only for notification
/// enrichment and capability decisions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsConfig {
    #[serde(default)]
    pub provider: FsProvider,
    /// Bucket or container name for remote providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Custom endpoint for S3-compatible providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Per-path allowed/denied filename suffix lists.
///
/// The filter applies to every file inside `path`. Denied suffixes win
/// over allowed ones; a non-empty allowed list means "only these".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionsFilter {
    /// Virtual directory the filter applies to
    pub path: String,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub denied_extensions: Vec<String>,
}

/// Additional per-user restrictions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserFilters {
    /// Patterns matched against the remote IP. Empty means any source.
    /// `*` and `?` wildcards are honored, so `192.168.1.*` works.
    #[serde(default)]
    pub allowed_ip: Vec<String>,
    /// Login methods the user may authenticate with. Empty means all.
    #[serde(default)]
    pub allowed_login_methods: Vec<LoginMethod>,
    /// Filename suffix filters, one entry per virtual directory
    #[serde(default)]
    pub file_extensions: Vec<ExtensionsFilter>,
}

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Disabled,
    Enabled,
}

impl Default for UserStatus {
    fn default() -> Self {
        UserStatus::Enabled
    }
}

/// A named mapping of a host directory into a user's virtual tree.
///
/// One folder may be attached to many users; its usage counters are
/// shared between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFolder {
    pub name: String,
    /// Host-side absolute path backing the folder
    pub mapped_path: PathBuf,
    /// Mount point inside the user tree, must begin with "/"
    pub virtual_path: String,
    #[serde(default)]
    pub used_quota_files: i64,
    #[serde(default)]
    pub used_quota_size: i64,
    /// `-1` inherits the user quota, `0` is unlimited
    #[serde(default = "default_folder_quota")]
    pub quota_files: i64,
    #[serde(default = "default_folder_quota")]
    pub quota_size: i64,
}

fn default_folder_quota() -> i64 {
    -1
}

impl VirtualFolder {
    /// Whether usage inside the folder also counts toward the user quota
    pub fn is_included_in_user_quota(&self) -> bool {
        self.quota_files == -1 && self.quota_size == -1
    }

    pub fn has_quota_restrictions(&self) -> bool {
        self.quota_files > 0 || self.quota_size > 0
    }
}

/// A tenant account.
///
/// Sessions operate on immutable snapshots of this value: the data
/// provider owns the authoritative copy, the SSH layer serializes a
/// snapshot into the connection at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Absolute home directory; logins with a relative home are refused
    pub home_dir: PathBuf,
    #[serde(default)]
    pub status: UserStatus,
    /// Unix timestamp in milliseconds, 0 means no expiration
    #[serde(default)]
    pub expiration_date: i64,
    /// Virtual-path prefix -> granted atoms. The "/" entry is the root
    /// grant; deeper entries override it (longest prefix wins).
    pub permissions: HashMap<String, Vec<Permission>>,
    #[serde(default)]
    pub filters: UserFilters,
    /// Maximum number of files, 0 means unlimited
    #[serde(default)]
    pub quota_files: i64,
    /// Maximum total size in bytes, 0 means unlimited
    #[serde(default)]
    pub quota_size: i64,
    /// Maximum concurrent sessions, 0 means unlimited
    #[serde(default)]
    pub max_sessions: i32,
    #[serde(default)]
    pub used_quota_files: i64,
    #[serde(default)]
    pub used_quota_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fs_config: FsConfig,
    #[serde(default)]
    pub virtual_folders: Vec<VirtualFolder>,
}

impl User {
    /// Permissions granted at `virtual_path`, resolved at the deepest
    /// prefix present in the permission map
    pub fn perms_for_path(&self, virtual_path: &str) -> &[Permission] {
        let mut path = clean_virtual_path(virtual_path);
        loop {
            if let Some(perms) = self.permissions.get(&path) {
                return perms;
            }
            if path == "/" {
                return &[];
            }
            path = parent_virtual_path(&path);
        }
    }

    /// True when every atom in `wanted` is granted at `virtual_path`
    pub fn has_perms(&self, wanted: &[Permission], virtual_path: &str) -> bool {
        let granted = self.perms_for_path(virtual_path);
        if granted.contains(&Permission::Any) {
            return true;
        }
        wanted.iter().all(|p| granted.contains(p))
    }

    pub fn has_perm(&self, wanted: Permission, virtual_path: &str) -> bool {
        self.has_perms(&[wanted], virtual_path)
    }

    /// Evaluate the filename suffix filter enclosing `virtual_path`.
    ///
    /// The deepest filter whose path contains the file's directory wins;
    /// denied suffixes take precedence over allowed ones.
    pub fn is_file_allowed(&self, virtual_path: &str) -> bool {
        if self.filters.file_extensions.is_empty() {
            return true;
        }
        let cleaned = clean_virtual_path(virtual_path);
        let dir = parent_virtual_path(&cleaned);
        let mut best: Option<&ExtensionsFilter> = None;
        for filter in &self.filters.file_extensions {
            let fpath = clean_virtual_path(&filter.path);
            if is_virtual_prefix(&fpath, &dir)
                && best.map_or(true, |b| fpath.len() > clean_virtual_path(&b.path).len())
            {
                best = Some(filter);
            }
        }
        let Some(filter) = best else {
            return true;
        };
        let name = cleaned.rsplit('/').next().unwrap_or("").to_lowercase();
        for denied in &filter.denied_extensions {
            if name.ends_with(&denied.to_lowercase()) {
                return false;
            }
        }
        if filter.allowed_extensions.is_empty() {
            return true;
        }
        filter
            .allowed_extensions
            .iter()
            .any(|a| name.ends_with(&a.to_lowercase()))
    }

    /// Whether a login from `ip` is permitted. The filter list holds
    /// wildcard patterns, an empty list admits any source.
    pub fn is_login_from_addr_allowed(&self, ip: &str) -> bool {
        if self.filters.allowed_ip.is_empty() {
            return true;
        }
        self.filters
            .allowed_ip
            .iter()
            .any(|pattern| pattern_matches(pattern, ip))
    }

    /// Whether `method` completes a login given the already satisfied
    /// partial methods
    pub fn is_login_method_allowed(&self, method: LoginMethod, partial: &[LoginMethod]) -> bool {
        if self.filters.allowed_login_methods.is_empty() {
            return true;
        }
        if self.filters.allowed_login_methods.contains(&method) {
            return true;
        }
        // a second step of a two-step method is allowed when the
        // combination itself is
        if partial.contains(&LoginMethod::PublicKey) {
            match method {
                LoginMethod::Password => self
                    .filters
                    .allowed_login_methods
                    .contains(&LoginMethod::KeyAndPassword),
                LoginMethod::KeyboardInteractive => self
                    .filters
                    .allowed_login_methods
                    .contains(&LoginMethod::KeyAndKeyboardInt),
                _ => false,
            }
        } else {
            false
        }
    }

    /// True when a successful public-key check must yield partial success
    /// because the user is restricted to two-step methods
    pub fn is_partial_auth(&self, method: LoginMethod) -> bool {
        if method != LoginMethod::PublicKey {
            return false;
        }
        let allowed = &self.filters.allowed_login_methods;
        if allowed.is_empty() || allowed.contains(&LoginMethod::PublicKey) {
            return false;
        }
        allowed
            .iter()
            .any(|m| matches!(m, LoginMethod::KeyAndPassword | LoginMethod::KeyAndKeyboardInt))
    }

    /// Methods that can still complete the login after the given partial
    /// successes
    pub fn next_auth_methods(&self, partial: &[LoginMethod]) -> Vec<LoginMethod> {
        let mut next = Vec::new();
        if !partial.contains(&LoginMethod::PublicKey) {
            return next;
        }
        for method in &self.filters.allowed_login_methods {
            match method {
                LoginMethod::KeyAndPassword => next.push(LoginMethod::Password),
                LoginMethod::KeyAndKeyboardInt => next.push(LoginMethod::KeyboardInteractive),
                _ => {}
            }
        }
        next
    }

    /// Deepest virtual folder containing `virtual_path`, if any
    pub fn virtual_folder_for_path(&self, virtual_path: &str) -> Option<&VirtualFolder> {
        let cleaned = clean_virtual_path(virtual_path);
        self.virtual_folders
            .iter()
            .filter(|f| is_virtual_prefix(&clean_virtual_path(&f.virtual_path), &cleaned))
            .max_by_key(|f| clean_virtual_path(&f.virtual_path).len())
    }

    /// True when `virtual_path` is the mount point of one of the user's
    /// virtual folders
    pub fn is_virtual_folder_root(&self, virtual_path: &str) -> bool {
        let cleaned = clean_virtual_path(virtual_path);
        self.virtual_folders
            .iter()
            .any(|f| clean_virtual_path(&f.virtual_path) == cleaned)
    }

    /// Detect virtual folders that overlap each other or nest inside one
    /// another, either in the virtual tree or on the host side.
    /// Overlapping folders break shared quota accounting.
    pub fn has_overlapping_folders(&self) -> bool {
        for (i, a) in self.virtual_folders.iter().enumerate() {
            for b in self.virtual_folders.iter().skip(i + 1) {
                let va = clean_virtual_path(&a.virtual_path);
                let vb = clean_virtual_path(&b.virtual_path);
                if is_virtual_prefix(&va, &vb) || is_virtual_prefix(&vb, &va) {
                    return true;
                }
                let ma = a.mapped_path.to_string_lossy();
                let mb = b.mapped_path.to_string_lossy();
                if is_virtual_prefix(&ma, &mb) || is_virtual_prefix(&mb, &ma) {
                    return true;
                }
            }
        }
        false
    }

    pub fn has_quota_restrictions(&self) -> bool {
        self.quota_files > 0 || self.quota_size > 0
    }

    /// Account gate evaluated at login time
    pub fn is_active(&self) -> bool {
        if self.status == UserStatus::Disabled {
            return false;
        }
        if self.expiration_date > 0 {
            return Utc::now().timestamp_millis() < self.expiration_date;
        }
        true
    }
}

/// Clean a virtual path the way the SFTP tree expects: always absolute,
/// no `.`/`..` segments, no duplicate separators, no trailing slash
/// (except for the root itself). Relative inputs are anchored at "/".
pub fn clean_virtual_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Parent of a cleaned virtual path; the root is its own parent
fn parent_virtual_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// True when `prefix` contains `path` in the virtual tree ("/a" contains
/// "/a" and "/a/b" but not "/ab")
fn is_virtual_prefix(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// Wildcard match supporting `*` (any run) and `?` (any single char)
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    fn inner(p: &[char], v: &[char]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some('*'), _) => inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..])),
            (Some('?'), Some(_)) => inner(&p[1..], &v[1..]),
            (Some(c), Some(d)) if c == d => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(&p, &v)
}
