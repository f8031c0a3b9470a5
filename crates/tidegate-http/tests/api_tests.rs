//! Control plane handler tests against the in-memory provider and the
//! live registries.

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::Json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tidegate_core::{Permission, QuotaTracking, User};
use tidegate_http::api;
use tidegate_http::AppState;
use tidegate_provider::memory::StoredUser;
use tidegate_provider::{DataProvider, MemoryProvider};
use tidegate_sftp::{ConnectionRegistry, Metrics, ScanRegistry, ServerSession, VirtualFs};

fn make_user(name: &str, home: &Path, quota_files: i64) -> StoredUser {
    let mut permissions = HashMap::new();
    permissions.insert("/".to_string(), vec![Permission::Any]);
    StoredUser {
        user: User {
            username: name.to_string(),
            home_dir: home.to_path_buf(),
            status: Default::default(),
            expiration_date: 0,
            permissions,
            filters: Default::default(),
            quota_files,
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
    }
}

async fn make_state(tracking: QuotaTracking) -> (AppState, Arc<MemoryProvider>) {
    let provider = Arc::new(MemoryProvider::new(tracking));
    let state = AppState {
        provider: provider.clone(),
        registry: ConnectionRegistry::new(Metrics::new()),
        scans: ScanRegistry::new(),
    };
    (state, provider)
}

#[tokio::test]
async fn test_double_scan_admission() {
    let home = tempfile::tempdir().unwrap();
    // a large tree is not needed; holding the slot is what matters
    let (state, provider) = make_state(QuotaTracking::Full).await;
    provider
        .add_user(make_user("u1", home.path(), 100))
        .await
        .unwrap();

    // hold the admission slot the way a running scan would
    assert!(state.scans.add_user_scan("u1"));

    let (code, _) = api::start_user_scan(
        State(state.clone()),
        Json(api::UserScanRequest {
            username: "u1".to_string(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::CONFLICT);

    state.scans.remove_user_scan("u1");
    let (code, _) = api::start_user_scan(
        State(state.clone()),
        Json(api::UserScanRequest {
            username: "u1".to_string(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_scan_for_unknown_user_is_404() {
    let (state, _) = make_state(QuotaTracking::Full).await;
    let (code, _) = api::start_user_scan(
        State(state),
        Json(api::UserScanRequest {
            username: "ghost".to_string(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scan_resets_totals() {
    let home = tempfile::tempdir().unwrap();
    std::fs::write(home.path().join("one.bin"), vec![0u8; 100]).unwrap();
    std::fs::write(home.path().join("two.bin"), vec![0u8; 50]).unwrap();

    let (state, provider) = make_state(QuotaTracking::Full).await;
    provider
        .add_user(make_user("u1", home.path(), 100))
        .await
        .unwrap();
    // stale stored totals that the scan must replace, not accumulate
    provider.update_user_quota("u1", 99, 99_999, true).await.unwrap();

    let (code, _) = api::start_user_scan(
        State(state.clone()),
        Json(api::UserScanRequest {
            username: "u1".to_string(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::ACCEPTED);

    // the scan runs in a background task; wait for the slot release
    for _ in 0..100 {
        if state.scans.user_scans().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(provider.get_used_quota("u1").await.unwrap(), (2, 150));
}

#[tokio::test]
async fn test_quota_update_modes() {
    let home = tempfile::tempdir().unwrap();
    let (state, provider) = make_state(QuotaTracking::Full).await;
    provider
        .add_user(make_user("u1", home.path(), 100))
        .await
        .unwrap();

    let (code, _) = api::update_quota(
        State(state.clone()),
        Json(api::QuotaUpdateRequest {
            username: Some("u1".to_string()),
            folder: None,
            used_quota_files: 5,
            used_quota_size: 5000,
            mode: api::QuotaUpdateMode::Reset,
        }),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(provider.get_used_quota("u1").await.unwrap(), (5, 5000));

    let (code, _) = api::update_quota(
        State(state.clone()),
        Json(api::QuotaUpdateRequest {
            username: Some("u1".to_string()),
            folder: None,
            used_quota_files: 1,
            used_quota_size: 1000,
            mode: api::QuotaUpdateMode::Add,
        }),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(provider.get_used_quota("u1").await.unwrap(), (6, 6000));
}

#[tokio::test]
async fn test_add_mode_needs_restrictions_under_restricted_tracking() {
    let home = tempfile::tempdir().unwrap();
    let (state, provider) = make_state(QuotaTracking::RestrictionsOnly).await;
    // no quota restrictions on this user
    provider
        .add_user(make_user("u1", home.path(), 0))
        .await
        .unwrap();

    let (code, _) = api::update_quota(
        State(state.clone()),
        Json(api::QuotaUpdateRequest {
            username: Some("u1".to_string()),
            folder: None,
            used_quota_files: 1,
            used_quota_size: 1000,
            mode: api::QuotaUpdateMode::Add,
        }),
    )
    .await;
    assert_eq!(code, StatusCode::FORBIDDEN);

    // reset stays allowed
    let (code, _) = api::update_quota(
        State(state),
        Json(api::QuotaUpdateRequest {
            username: Some("u1".to_string()),
            folder: None,
            used_quota_files: 0,
            used_quota_size: 0,
            mode: api::QuotaUpdateMode::Reset,
        }),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
}

#[tokio::test]
async fn test_quota_update_requires_one_identifier() {
    let (state, _) = make_state(QuotaTracking::Full).await;
    let (code, _) = api::update_quota(
        State(state),
        Json(api::QuotaUpdateRequest {
            username: None,
            folder: None,
            used_quota_files: 0,
            used_quota_size: 0,
            mode: api::QuotaUpdateMode::Reset,
        }),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_connection_listing_and_close() {
    let home = tempfile::tempdir().unwrap();
    let (state, provider) = make_state(QuotaTracking::Full).await;
    provider
        .add_user(make_user("u1", home.path(), 0))
        .await
        .unwrap();
    let user = Arc::new(provider.user_exists("u1").await.unwrap());
    let fs = Arc::new(VirtualFs::new(user.clone(), "conn-1"));
    let session = ServerSession::new(
        "conn-1",
        user,
        fs,
        "10.1.2.3:50000".parse().unwrap(),
        "SSH-2.0-test",
    );
    state.registry.add(session);

    let Json(listing) = api::get_connections(State(state.clone())).await;
    let rows = listing.data.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].username, "u1");
    assert_eq!(rows[0].connection_id, "conn-1");

    let (code, _) = api::close_connection(State(state.clone()), AxumPath("conn-1".to_string())).await;
    assert_eq!(code, StatusCode::OK);
    let (code, _) = api::close_connection(State(state), AxumPath("missing".to_string())).await;
    assert_eq!(code, StatusCode::NOT_FOUND);
}
