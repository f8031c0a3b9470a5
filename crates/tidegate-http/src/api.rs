use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::AppState;
use tidegate_core::QuotaTracking;
use tidegate_sftp::quota::{perform_folder_scan, perform_user_scan};
use tidegate_sftp::{ActiveFolderScan, ActiveUserScan, ConnectionStatus};

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn get_user_scans(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ActiveUserScan>>> {
    Json(ApiResponse::ok(state.scans.user_scans()))
}

pub async fn get_folder_scans(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ActiveFolderScan>>> {
    Json(ApiResponse::ok(state.scans.folder_scans()))
}

#[derive(Debug, Deserialize)]
pub struct UserScanRequest {
    pub username: String,
}

/// 202 on admission, 409 when a scan for the user is already running
pub async fn start_user_scan(
    State(state): State<AppState>,
    Json(request): Json<UserScanRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let user = match state.provider.user_exists(&request.username).await {
        Ok(user) => user,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(e.to_string())),
            )
        }
    };
    let Some(guard) = state.scans.guard_user_scan(&user.username) else {
        return (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(format!(
                "a quota scan for {} is already running",
                user.username
            ))),
        );
    };
    info!(username = %user.username, "user quota scan admitted");
    let provider = state.provider.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = perform_user_scan(&provider, &user).await {
            warn!(username = %user.username, error = %e, "user quota scan failed");
        }
    });
    (StatusCode::ACCEPTED, Json(ApiResponse::ok(())))
}

#[derive(Debug, Deserialize)]
pub struct FolderScanRequest {
    pub name: String,
}

/// 202 on admission, 409 when a scan for the folder is already running
pub async fn start_folder_scan(
    State(state): State<AppState>,
    Json(request): Json<FolderScanRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let folder = match state.provider.get_folder_by_name(&request.name).await {
        Ok(folder) => folder,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(e.to_string())),
            )
        }
    };
    let Some(guard) = state.scans.guard_folder_scan(&folder.name) else {
        return (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(format!(
                "a quota scan for folder {} is already running",
                folder.name
            ))),
        );
    };
    info!(folder = %folder.name, "folder quota scan admitted");
    let provider = state.provider.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = perform_folder_scan(&provider, &folder).await {
            warn!(folder = %folder.name, error = %e, "folder quota scan failed");
        }
    });
    (StatusCode::ACCEPTED, Json(ApiResponse::ok(())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaUpdateMode {
    Reset,
    Add,
}

/// Either `username` or `folder` must be set
#[derive(Debug, Deserialize)]
pub struct QuotaUpdateRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    pub used_quota_files: i64,
    pub used_quota_size: i64,
    pub mode: QuotaUpdateMode,
}

pub async fn update_quota(
    State(state): State<AppState>,
    Json(request): Json<QuotaUpdateRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let reset = request.mode == QuotaUpdateMode::Reset;
    match (&request.username, &request.folder) {
        (Some(username), None) => {
            let user = match state.provider.user_exists(username).await {
                Ok(user) => user,
                Err(e) => {
                    return (
                        StatusCode::NOT_FOUND,
                        Json(ApiResponse::error(e.to_string())),
                    )
                }
            };
            // add mode needs a tracked user
            if !reset
                && state.provider.quota_tracking() == QuotaTracking::RestrictionsOnly
                && !user.has_quota_restrictions()
            {
                return (
                    StatusCode::FORBIDDEN,
                    Json(ApiResponse::error(
                        "add mode requires quota restrictions with restrictions-only tracking",
                    )),
                );
            }
            match state
                .provider
                .update_user_quota(
                    username,
                    request.used_quota_files,
                    request.used_quota_size,
                    reset,
                )
                .await
            {
                Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse::error(e.to_string())),
                ),
            }
        }
        (None, Some(folder)) => {
            if state.provider.get_folder_by_name(folder).await.is_err() {
                return (
                    StatusCode::NOT_FOUND,
                    Json(ApiResponse::error(format!("folder {} not found", folder))),
                );
            }
            match state
                .provider
                .update_folder_quota(
                    folder,
                    request.used_quota_files,
                    request.used_quota_size,
                    reset,
                )
                .await
            {
                Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse::error(e.to_string())),
                ),
            }
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(
                "exactly one of username and folder must be provided",
            )),
        ),
    }
}

pub async fn get_connections(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ConnectionStatus>>> {
    Json(ApiResponse::ok(state.registry.snapshot()))
}

pub async fn close_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    if state.registry.close(&id) {
        info!(connection_id = %id, "connection close requested over the control plane");
        (StatusCode::OK, Json(ApiResponse::ok(())))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("connection {} not found", id))),
        )
    }
}

pub async fn get_metrics(
    State(state): State<AppState>,
) -> Json<ApiResponse<tidegate_sftp::metrics::MetricsSnapshot>> {
    Json(ApiResponse::ok(state.registry.metrics().snapshot()))
}
