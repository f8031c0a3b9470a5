use async_trait::async_trait;
use tidegate_core::{QuotaTracking, Result, User, VirtualFolder};

/// The persistence contract the servers authenticate and account against.
///
/// Implementations must be safe to share across sessions; every method can
/// be called concurrently. Quota updates use signed deltas unless `reset`
/// is set, in which case the given values replace the stored totals.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Look up a user without verifying any credential
    async fn user_exists(&self, username: &str) -> Result<User>;

    /// Verify a password login. `ip` and `protocol` are used for logging
    /// and per-source restrictions only.
    async fn check_user_and_pass(
        &self,
        username: &str,
        password: &str,
        ip: &str,
        protocol: &str,
    ) -> Result<User>;

    /// Verify a public-key login against the stored authorized keys.
    /// `pub_key` is the offered key in OpenSSH one-line format. Returns
    /// the user and an identifier for the matched key.
    async fn check_user_and_pub_key(&self, username: &str, pub_key: &str)
        -> Result<(User, String)>;

    /// Gate a keyboard-interactive login: the challenge/response exchange
    /// itself is driven by the configured hook, the provider only vets the
    /// account.
    async fn check_keyboard_interactive_auth(&self, username: &str, ip: &str) -> Result<User>;

    /// Apply a quota change for a user. With `reset` the values replace
    /// the stored totals, otherwise they are added as signed deltas.
    async fn update_user_quota(
        &self,
        username: &str,
        files: i64,
        size: i64,
        reset: bool,
    ) -> Result<()>;

    /// Apply a quota change for a shared virtual folder
    async fn update_folder_quota(
        &self,
        name: &str,
        files: i64,
        size: i64,
        reset: bool,
    ) -> Result<()>;

    /// Stored (files, bytes) usage for a user
    async fn get_used_quota(&self, username: &str) -> Result<(i64, i64)>;

    /// Stored (files, bytes) usage for a virtual folder
    async fn get_used_folder_quota(&self, name: &str) -> Result<(i64, i64)>;

    async fn get_folder_by_name(&self, name: &str) -> Result<VirtualFolder>;

    /// Quota tracking mode configured for this provider
    fn quota_tracking(&self) -> QuotaTracking;

    async fn update_last_login(&self, username: &str) -> Result<()>;

    /// Flush any buffered state. Called on shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
