// 统一低延迟视频流传输系统 - 频道直播流
//
// 每个连接拥有一个 `ClientSession`，响应体按需从会话拉取 MPEG-TS 字节。

use super::AppState;
use crate::error::SessionError;
use crate::mux::{ClientSession, Pull};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
};
use tracing::{debug, info, warn};

const CONTENT_TYPE_TS: &str = "video/mp2t";
const NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";

/// 解析 `/ch/:target` 中的频道号，允许 `.ts` 后缀
fn parse_channel_target(target: &str) -> Option<u32> {
    target.strip_suffix(".ts").unwrap_or(target).parse().ok()
}

fn session_status(error: &SessionError) -> StatusCode {
    match error {
        SessionError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::ChannelFaulted(_)
        | SessionError::NotReady(_)
        | SessionError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// 直播流
///
/// 实现 GET /ch/{number} 与 GET /ch/{number}.ts
///
/// # 返回
///
/// 频道不存在返回 404，频道故障或尚无输出返回 503
pub async fn stream_channel(
    Path(target): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let number = parse_channel_target(&target).ok_or_else(|| {
        debug!("Invalid channel target: {}", target);
        StatusCode::BAD_REQUEST
    })?;

    let channel = state
        .registry
        .get(number)
        .ok_or_else(|| session_status(&SessionError::ChannelNotFound(number)))?;

    let mut session = ClientSession::connect(channel, &state.session, state.ready_timeout)
        .await
        .map_err(|e| {
            warn!("ch{}: rejecting client: {}", number, e);
            session_status(&e)
        })?;

    info!("📺 ch{}: client attached (session {})", number, session.id());

    let chunk_size = state.session.chunk_size.max(1);
    let stream = async_stream::stream! {
        loop {
            match session.pull(chunk_size).await {
                Ok(Pull::Data(bytes)) => yield Ok::<_, std::io::Error>(bytes),
                Ok(Pull::End) => break,
                Err(e) => {
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                    break;
                }
            }
        }
        debug!(
            "ch{}: session {} ended in {:?}: {:?}",
            number,
            session.id(),
            session.state(),
            session.stats()
        );
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, CONTENT_TYPE_TS)
        .header(header::CACHE_CONTROL, NO_CACHE)
        .header("Content-Transfer-Encoding", "BINARY")
        .body(Body::from_stream(stream))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
