// 统一低延迟视频流传输系统 - 路由

use super::AppState;
use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // 频道信息
        .route("/api/v1/channels", get(super::handlers::list_channels))
        .route("/api/v1/channels/:number", get(super::handlers::get_channel))
        // 直播流（/ch/5 或 /ch/5.ts）
        .route("/ch/:target", get(super::streaming::stream_channel))
        // 健康检查
        .route("/health", get(super::handlers::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
