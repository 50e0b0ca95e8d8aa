// 统一低延迟视频流传输系统 - JSON 接口

use super::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use common::ChannelInfo;
use serde::Serialize;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);

/// 健康检查
pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}

/// 获取频道列表
pub async fn list_channels(State(state): State<AppState>) -> Json<ApiResponse<Vec<ChannelInfo>>> {
    Json(ApiResponse::success(state.registry.list()))
}

/// 获取频道详情
pub async fn get_channel(
    Path(number): Path<u32>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ChannelInfo>>, ApiError> {
    match state.registry.require(number) {
        Ok(channel) => Ok(Json(ApiResponse::success(channel.info()))),
        Err(e) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<ChannelInfo>::error(e.to_string())),
        )),
    }
}
