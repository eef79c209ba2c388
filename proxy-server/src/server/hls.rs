// HLS推送点
//
// 一个路由处理全部HLS资源：两种播放列表、初始化分段、完整分段和部分分段。

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use super::AppState;
use crate::mux::PlaylistKind;

/// 阻塞刷新参数
#[derive(Debug, Default, Deserialize)]
pub struct BlockingReload {
    #[serde(rename = "_HLS_msn")]
    msn: Option<u64>,
    #[serde(rename = "_HLS_part")]
    part: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HlsResource {
    Playlist(PlaylistKind),
    Init(u32),
    Segment(u64),
    Part(u64, usize),
}

fn parse_resource(name: &str) -> Option<HlsResource> {
    match name {
        "live.m3u8" => return Some(HlsResource::Playlist(PlaylistKind::LowLatency)),
        "legacy.m3u8" => return Some(HlsResource::Playlist(PlaylistKind::Legacy)),
        _ => {}
    }
    if let Some(generation) = name.strip_prefix("init-").and_then(|s| s.strip_suffix(".mp4")) {
        return generation.parse().ok().map(HlsResource::Init);
    }
    if let Some(msn) = name.strip_prefix("seg-").and_then(|s| s.strip_suffix(".m4s")) {
        return msn.parse().ok().map(HlsResource::Segment);
    }
    let (msn, index) = name
        .strip_prefix("part-")
        .and_then(|s| s.strip_suffix(".m4s"))
        .and_then(|s| s.split_once('-'))?;
    Some(HlsResource::Part(msn.parse().ok()?, index.parse().ok()?))
}

fn media(body: Bytes) -> Response {
    (
        [
            (header::CONTENT_TYPE, "video/mp4"),
            (header::CACHE_CONTROL, "max-age=60"),
        ],
        body,
    )
        .into_response()
}

pub async fn hls_resource(
    Path((device_id, file)): Path<(String, String)>,
    Query(reload): Query<BlockingReload>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let handle = state.sessions.get(&device_id).ok_or(StatusCode::NOT_FOUND)?;
    let hub = handle.hub();
    let resource = parse_resource(&file).ok_or(StatusCode::NOT_FOUND)?;
    // 分段刚好被窗口淘汰、或者阻塞刷新等待的上限
    let hold = state.hls.segment_duration * 3;

    match resource {
        HlsResource::Playlist(kind) => {
            if let Some(ConnectInfo(addr)) = connect_info {
                hub.touch_hls_viewer(addr.ip());
            }
            if kind == PlaylistKind::LowLatency {
                if let Some(msn) = reload.msn {
                    // 超时后返回当前播放列表
                    hub.wait_hls_ready(msn, reload.part, hold).await;
                }
            }
            let playlist = hub.hls_playlist(kind).ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
            Ok((
                [
                    (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                playlist,
            )
                .into_response())
        }
        HlsResource::Init(generation) => hub.hls_init(generation).map(media).ok_or(StatusCode::NOT_FOUND),
        HlsResource::Segment(msn) => hub.hls_segment(msn).map(media).ok_or(StatusCode::NOT_FOUND),
        HlsResource::Part(msn, index) => {
            if let Some(part) = hub.hls_part(msn, index) {
                return Ok(media(part));
            }
            // 预加载提示指向的部分分段：等到它生成
            let wait = hold.min(Duration::from_secs(10));
            hub.wait_hls_part(msn, index, wait)
                .await
                .map(media)
                .ok_or(StatusCode::NOT_FOUND)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_names() {
        assert_eq!(
            parse_resource("live.m3u8"),
            Some(HlsResource::Playlist(PlaylistKind::LowLatency))
        );
        assert_eq!(
            parse_resource("legacy.m3u8"),
            Some(HlsResource::Playlist(PlaylistKind::Legacy))
        );
        assert_eq!(parse_resource("init-2.mp4"), Some(HlsResource::Init(2)));
        assert_eq!(parse_resource("seg-41.m4s"), Some(HlsResource::Segment(41)));
        assert_eq!(parse_resource("part-41-3.m4s"), Some(HlsResource::Part(41, 3)));
        assert_eq!(parse_resource("part-41.m4s"), None);
        assert_eq!(parse_resource("seg-x.m4s"), None);
        assert_eq!(parse_resource("index.html"), None);
    }
}
