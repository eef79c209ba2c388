use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use common::StatusSnapshot;
use serde::Serialize;
use tracing::{info, warn};

use super::AppState;
use crate::ingest::fetch_capabilities;
use crate::session::SessionCommand;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn not_found(device_id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::<()>::error(format!("Device not found: {}", device_id))),
    )
}

/// 健康检查
pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}

/// 所有设备的状态
pub async fn list_devices(State(state): State<AppState>) -> Json<ApiResponse<Vec<StatusSnapshot>>> {
    let statuses = state
        .sessions
        .statuses()
        .into_iter()
        .map(|status| (*status).clone())
        .collect();
    Json(ApiResponse::success(statuses))
}

/// 单台设备状态
pub async fn device_status(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StatusSnapshot>>, ApiError> {
    let handle = state.sessions.get(&device_id).ok_or_else(|| not_found(&device_id))?;
    let status = (*handle.status()).clone();
    Ok(Json(ApiResponse::success(status)))
}

/// 启用/禁用/暂停/恢复
pub async fn device_action(
    Path((device_id, action)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<String>>), ApiError> {
    let command = match action.as_str() {
        "enable" => SessionCommand::Enable,
        "disable" => SessionCommand::Disable,
        "pause" => SessionCommand::Pause,
        "resume" => SessionCommand::Resume,
        _ => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ApiResponse::<()>::error(format!("Unknown action: {}", action))),
            ))
        }
    };

    let handle = state.sessions.get(&device_id).ok_or_else(|| not_found(&device_id))?;
    if !handle.send(command).await {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<()>::error(format!("Session {} is not running", device_id))),
        ));
    }

    info!("{} requested for device {}", action, device_id);
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(action))))
}

/// 设备能力描述（透传设备接口）
pub async fn device_capabilities(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let handle = state.sessions.get(&device_id).ok_or_else(|| not_found(&device_id))?;
    match fetch_capabilities(&state.http, handle.device()).await {
        Ok(capabilities) => Ok(Json(ApiResponse::success(capabilities))),
        Err(e) => {
            warn!("⚠️  Capabilities query failed for {}: {}", device_id, e);
            Err((StatusCode::BAD_GATEWAY, Json(ApiResponse::<()>::error(e.to_string()))))
        }
    }
}
