// 连续流推送点：MJPEG、快照、FLV
//
// 响应体持有客户端订阅，客户端断开时响应体被丢弃，订阅随之注销。

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::hub::FlvSubscription;
use super::queue::Pulled;
use super::AppState;
use crate::mux::FlvMuxer;

const MJPEG_BOUNDARY: &str = "frame";

/// multipart/x-mixed-replace 的一个部分
fn multipart_part(jpeg: &Bytes) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut out = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    out.put_slice(header.as_bytes());
    out.put_slice(jpeg);
    out.put_slice(b"\r\n");
    out.freeze()
}

/// MJPEG连续流
///
/// 停滞期间按固定间隔重发最后一帧，保持连接不断开。
pub async fn mjpeg_stream(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let handle = state.sessions.get(&device_id).ok_or(StatusCode::NOT_FOUND)?;
    let hub = handle.hub().clone();
    let subscription = hub.subscribe_mjpeg();
    let resend_interval = hub.clients_config().mjpeg_resend_interval;
    info!("📹 MJPEG client {} connected to {}", subscription.id(), device_id);

    let body = async_stream::stream! {
        if let Some(frame) = hub.latest_jpeg() {
            yield Ok::<Bytes, std::io::Error>(multipart_part(&frame));
        }
        loop {
            match tokio::time::timeout(resend_interval, subscription.pull()).await {
                Ok(Some(Pulled::Item(frame))) => yield Ok(multipart_part(&frame)),
                Ok(Some(Pulled::Discontinuity)) => {}
                Ok(None) => {
                    debug!("MJPEG subscription {} closed", subscription.id());
                    break;
                }
                Err(_) => {
                    if let Some(frame) = hub.latest_jpeg() {
                        yield Ok(multipart_part(&frame));
                    }
                }
            }
        }
    };

    Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from_stream(body))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// 单张快照
///
/// 还没有缓存帧时触发快照恢复，在超时时间内等待第一帧。
pub async fn snapshot(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let handle = state.sessions.get(&device_id).ok_or(StatusCode::NOT_FOUND)?;
    let hub = handle.hub();

    let frame = match hub.latest_jpeg() {
        Some(frame) => frame,
        None => {
            info!("No cached frame for {}, requesting snapshot recovery", device_id);
            handle.request_snapshot_recovery();
            let timeout = hub.clients_config().snapshot_recovery_timeout;
            hub.wait_for_jpeg(timeout).await.ok_or_else(|| {
                warn!("⚠️  Snapshot recovery timed out for {}", device_id);
                StatusCode::SERVICE_UNAVAILABLE
            })?
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        frame,
    )
        .into_response())
}

/// FLV连续流
///
/// 新客户端先收到最近的GOP，然后按顺序接收后续访问单元；
/// 队列溢出后从下一个关键帧重新同步。
pub async fn flv_stream(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let handle = state.sessions.get(&device_id).ok_or(StatusCode::NOT_FOUND)?;
    let FlvSubscription { seed, subscription } = handle.hub().subscribe_flv();
    info!("📹 FLV client {} connected to {}", subscription.id(), device_id);

    let body = async_stream::stream! {
        let mut muxer = FlvMuxer::new();
        for packet in &seed {
            match muxer.write_packet(packet) {
                Ok(Some(bytes)) => yield Ok::<Bytes, std::io::Error>(bytes),
                Ok(None) => {}
                Err(e) => debug!("Skipping cached packet: {}", e),
            }
        }

        while let Some(pulled) = subscription.pull().await {
            let packet = match pulled {
                Pulled::Item(packet) => packet,
                Pulled::Discontinuity => {
                    debug!("FLV subscription {} overflowed, resyncing", subscription.id());
                    muxer.resync();
                    continue;
                }
            };
            if packet.discontinuity {
                muxer.resync();
            }
            match muxer.write_packet(&packet) {
                Ok(Some(bytes)) => yield Ok(bytes),
                Ok(None) => {}
                Err(e) => warn!("⚠️  FLV mux error: {}", e),
            }
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "video/x-flv")
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from_stream(body))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
