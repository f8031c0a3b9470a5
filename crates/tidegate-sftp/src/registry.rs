//! Process-wide connection registry and idle sweeper.
//!
//! Live sessions and their transfers are tracked here for the control
//! plane, for per-user session caps and for the idle sweeper. Removal
//! does not kill the connection outright: the driver task gets a grace
//! window to flush lingering reads, matching a socket deadline rather
//! than a hard close.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::session::ServerSession;
use crate::transfer::Transfer;

pub use crate::session::ConnectionStatus;

/// Grace window granted to a removed connection before its driver is
/// aborted
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(120);

/// Idle sweeper wake interval
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ServerSession>>>,
    transfers: RwLock<Vec<Arc<Transfer>>>,
    metrics: Metrics,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionRegistry {
    pub fn new(metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            transfers: RwLock::new(Vec::new()),
            metrics,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn add(&self, session: Arc<ServerSession>) {
        let count = {
            let mut connections = write_lock(&self.connections);
            connections.insert(session.id().to_string(), session.clone());
            connections.len()
        };
        self.metrics.connection_opened();
        self.metrics.set_active_connections(count);
        debug!(
            connection_id = %session.id(),
            num_open_connections = count,
            "connection added"
        );
    }

    /// Remove a session and grant its driver the teardown grace window
    pub fn remove(&self, session_id: &str) {
        let removed = {
            let mut connections = write_lock(&self.connections);
            let removed = connections.remove(session_id);
            self.metrics.set_active_connections(connections.len());
            removed
        };
        if let Some(session) = removed {
            debug!(connection_id = %session_id, "connection removed");
            // lingering reads may still be draining the channel; abort
            // the driver only after the grace window
            tokio::spawn(async move {
                tokio::time::sleep(TEARDOWN_GRACE).await;
                session.abort_driver();
            });
        }
    }

    /// Close an active connection. Returns true when it was found.
    pub fn close(&self, session_id: &str) -> bool {
        let session = {
            let connections = read_lock(&self.connections);
            connections.get(session_id).cloned()
        };
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        read_lock(&self.connections).len()
    }

    /// Open sessions for a username, the input to the per-user cap
    pub fn count_for_user(&self, username: &str) -> usize {
        let connections = read_lock(&self.connections);
        connections
            .values()
            .filter(|s| s.user().username == username)
            .count()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ServerSession>> {
        read_lock(&self.connections).get(session_id).cloned()
    }

    /// Stats rows for every open connection
    pub fn snapshot(&self) -> Vec<ConnectionStatus> {
        let connections: Vec<Arc<ServerSession>> =
            read_lock(&self.connections).values().cloned().collect();
        let transfers: Vec<Arc<Transfer>> = read_lock(&self.transfers).clone();
        connections.iter().map(|s| s.status(&transfers)).collect()
    }

    pub fn add_transfer(&self, transfer: Arc<Transfer>) {
        write_lock(&self.transfers).push(transfer);
    }

    pub fn remove_transfer(&self, transfer_id: u64) {
        let mut transfers = write_lock(&self.transfers);
        let before = transfers.len();
        transfers.retain(|t| t.id() != transfer_id);
        if transfers.len() == before {
            warn!(transfer_id, "transfer to remove not found");
        }
    }

    pub fn transfers_for(&self, session_id: &str) -> Vec<Arc<Transfer>> {
        read_lock(&self.transfers)
            .iter()
            .filter(|t| t.session_id() == session_id)
            .cloned()
            .collect()
    }

    /// Close every session idle longer than `timeout`, folding transfer
    /// activity into the idle computation
    pub fn check_idle_connections(&self, timeout: Duration) {
        let connections: Vec<Arc<ServerSession>> =
            read_lock(&self.connections).values().cloned().collect();
        for session in connections {
            let mut idle = session.idle_for();
            for transfer in self.transfers_for(session.id()) {
                let transfer_idle = transfer.last_activity().elapsed();
                if transfer_idle < idle {
                    idle = transfer_idle;
                }
            }
            if idle > timeout {
                info!(
                    connection_id = %session.id(),
                    username = %session.user().username,
                    idle_secs = idle.as_secs(),
                    "closing idle connection"
                );
                session.close();
            }
        }
    }

    /// Long-lived sweeper task; logs and continues on every pass
    pub fn start_idle_sweeper(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        info!(timeout_secs = timeout.as_secs(), "idle sweeper started");
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                registry.check_idle_connections(timeout);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Protocol;
    use crate::vfs::VirtualFs;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;
    use tidegate_core::{Permission, User};

    fn make_session(id: &str, username: &str) -> Arc<ServerSession> {
        let mut permissions = StdHashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        let user = Arc::new(User {
            username: username.to_string(),
            home_dir: PathBuf::from("/srv").join(username),
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
        let fs = Arc::new(VirtualFs::new(user.clone(), id));
        ServerSession::new(id, user, fs, "10.0.0.9:51000".parse().unwrap(), "SSH-2.0-x")
    }

    #[tokio::test]
    async fn test_add_remove_updates_metrics() {
        let registry = ConnectionRegistry::new(Metrics::new());
        registry.add(make_session("c1", "alice"));
        registry.add(make_session("c2", "alice"));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.count_for_user("alice"), 2);
        assert_eq!(registry.metrics().snapshot().active_connections, 2);

        registry.remove("c1");
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.metrics().snapshot().active_connections, 1);
    }

    #[tokio::test]
    async fn test_close_by_id() {
        let registry = ConnectionRegistry::new(Metrics::new());
        let session = make_session("c1", "alice");
        registry.add(session.clone());
        assert!(registry.close("c1"));
        assert!(session.is_closed());
        assert!(!registry.close("missing"));
    }

    #[tokio::test]
    async fn test_snapshot_rows() {
        let registry = ConnectionRegistry::new(Metrics::new());
        let session = make_session("c1", "alice");
        session.set_protocol(Protocol::Sftp);
        registry.add(session);
        let rows = registry.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].connection_id, "c1");
        assert_eq!(rows[0].username, "alice");
    }

    #[tokio::test]
    async fn test_idle_sweep_closes_only_idle_sessions() {
        let registry = ConnectionRegistry::new(Metrics::new());
        let idle = make_session("idle", "alice");
        let active = make_session("active", "bob");
        registry.add(idle.clone());
        registry.add(active.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        active.touch();
        registry.check_idle_connections(Duration::from_millis(20));

        assert!(idle.is_closed());
        assert!(!active.is_closed());
    }
}
