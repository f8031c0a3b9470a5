//! Per-connection session state.
//!
//! A [`ServerSession`] is created once the SSH handshake and
//! authentication complete and the first `session` channel is accepted.
//! The identity, filesystem binding and addresses are immutable; the
//! activity clock, protocol tag and current command live behind a lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::transfer::{Transfer, TransferType};
use crate::vfs::VirtualFs;
use tidegate_core::User;

/// Protocol bound to the session's active channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "SFTP")]
    Sftp,
    #[serde(rename = "SCP")]
    Scp,
    #[serde(rename = "SSH")]
    Ssh,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Sftp => "SFTP",
            Protocol::Scp => "SCP",
            Protocol::Ssh => "SSH",
        }
    }
}

struct SessionState {
    last_activity: Instant,
    protocol: Protocol,
    command: Option<String>,
}

pub struct ServerSession {
    id: String,
    user: Arc<User>,
    fs: Arc<VirtualFs>,
    remote_addr: SocketAddr,
    client_version: String,
    start_time: DateTime<Utc>,
    state: StdMutex<SessionState>,
    /// Abort handle of the connection driver task; used by close() and
    /// the post-removal linger deadline
    abort: StdMutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl ServerSession {
    pub fn new(
        id: impl Into<String>,
        user: Arc<User>,
        fs: Arc<VirtualFs>,
        remote_addr: SocketAddr,
        client_version: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            user,
            fs,
            remote_addr,
            client_version: client_version.into(),
            start_time: Utc::now(),
            state: StdMutex::new(SessionState {
                last_activity: Instant::now(),
                protocol: Protocol::Ssh,
                command: None,
            }),
            abort: StdMutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn fs(&self) -> &Arc<VirtualFs> {
        &self.fs
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn touch(&self) {
        self.state.lock().expect("session lock poisoned").last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().expect("session lock poisoned").last_activity
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        self.state.lock().expect("session lock poisoned").protocol = protocol;
    }

    pub fn protocol(&self) -> Protocol {
        self.state.lock().expect("session lock poisoned").protocol
    }

    pub fn set_command(&self, command: Option<String>) {
        self.state.lock().expect("session lock poisoned").command = command;
    }

    pub fn command(&self) -> Option<String> {
        self.state.lock().expect("session lock poisoned").command.clone()
    }

    /// Attach the abort handle of the task driving this connection
    pub fn bind_driver(&self, handle: AbortHandle) {
        *self.abort.lock().expect("session lock poisoned") = Some(handle);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Best-effort close: aborts the connection driver. The disposal
    /// path of the driver still runs via the registry removal.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(connection_id = %self.id, username = %self.user.username, "closing session");
        if let Some(handle) = self.abort.lock().expect("session lock poisoned").take() {
            handle.abort();
        }
        true
    }

    /// Abort the driver if it is still running; used when the linger
    /// grace window expires
    pub fn abort_driver(&self) {
        if let Some(handle) = self.abort.lock().expect("session lock poisoned").take() {
            debug!(connection_id = %self.id, "linger deadline reached, aborting driver");
            handle.abort();
        }
    }

    /// Idle duration considering only the session clock; the registry
    /// folds transfer activity on top
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Introspection row for the control plane
    pub fn status(&self, transfers: &[Arc<Transfer>]) -> ConnectionStatus {
        let now = Utc::now().timestamp_millis();
        let mut last_activity_ms = now - self.idle_for().as_millis() as i64;
        let mut rows = Vec::new();
        for transfer in transfers {
            if transfer.session_id() != self.id {
                continue;
            }
            let t_activity = now - transfer.last_activity().elapsed().as_millis() as i64;
            if t_activity > last_activity_ms {
                last_activity_ms = t_activity;
            }
            let (operation_type, size) = match transfer.transfer_type() {
                TransferType::Upload => ("upload", transfer.bytes_received() as i64),
                TransferType::Download => ("download", transfer.bytes_sent() as i64),
            };
            rows.push(ConnectionTransfer {
                operation_type: operation_type.to_string(),
                start_time: transfer.start_time().timestamp_millis(),
                size,
                last_activity: t_activity,
                path: transfer.virtual_path().to_string(),
            });
        }
        ConnectionStatus {
            username: self.user.username.clone(),
            connection_id: self.id.clone(),
            client_version: self.client_version.clone(),
            remote_address: self.remote_addr.to_string(),
            connection_time: self.start_time.timestamp_millis(),
            last_activity: last_activity_ms,
            protocol: self.protocol(),
            transfers: rows,
            ssh_command: self.command().unwrap_or_default(),
        }
    }
}

/// One row of `GET /api/connections`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub username: String,
    pub connection_id: String,
    pub client_version: String,
    pub remote_address: String,
    /// Unix milliseconds
    pub connection_time: i64,
    /// Unix milliseconds, folded over the session and its transfers
    pub last_activity: i64,
    pub protocol: Protocol,
    pub transfers: Vec<ConnectionTransfer>,
    #[serde(default)]
    pub ssh_command: String,
}

/// An active upload or download inside a connection row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTransfer {
    pub operation_type: String,
    pub start_time: i64,
    pub size: i64,
    pub last_activity: i64,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tidegate_core::Permission;

    fn make_session() -> Arc<ServerSession> {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        let user = Arc::new(User {
            username: "sess".to_string(),
            home_dir: PathBuf::from("/srv/sess"),
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
        });
        let fs = Arc::new(VirtualFs::new(user.clone(), "conn-1"));
        ServerSession::new(
            "conn-1",
            user,
            fs,
            "127.0.0.1:40000".parse().unwrap(),
            "SSH-2.0-TestClient",
        )
    }

    #[test]
    fn test_protocol_and_command_tracking() {
        let session = make_session();
        assert_eq!(session.protocol(), Protocol::Ssh);
        session.set_protocol(Protocol::Scp);
        session.set_command(Some("scp -t /in".to_string()));
        assert_eq!(session.protocol(), Protocol::Scp);
        assert_eq!(session.command().as_deref(), Some("scp -t /in"));
    }

    #[test]
    fn test_status_row() {
        let session = make_session();
        session.set_protocol(Protocol::Sftp);
        let status = session.status(&[]);
        assert_eq!(status.username, "sess");
        assert_eq!(status.connection_id, "conn-1");
        assert_eq!(status.remote_address, "127.0.0.1:40000");
        assert_eq!(status.protocol, Protocol::Sftp);
        assert!(status.transfers.is_empty());
    }

    #[test]
    fn test_close_is_single_shot() {
        let session = make_session();
        assert!(!session.is_closed());
        assert!(session.close());
        assert!(session.is_closed());
        assert!(!session.close());
    }
}
