use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::AppState;

pub fn create_router(state: AppState, permissive_cors: bool) -> Router {
    let router = Router::new()
        // 设备状态与控制
        .route("/api/devices", get(super::handlers::list_devices))
        .route("/api/devices/:device_id/status", get(super::handlers::device_status))
        .route(
            "/api/devices/:device_id/capabilities",
            get(super::handlers::device_capabilities),
        )
        .route("/api/devices/:device_id/:action", post(super::handlers::device_action))
        // 媒体推送点
        .route("/devices/:device_id/stream.mjpeg", get(super::streaming::mjpeg_stream))
        .route("/devices/:device_id/snapshot.jpg", get(super::streaming::snapshot))
        .route("/devices/:device_id/stream.flv", get(super::streaming::flv_stream))
        .route("/devices/:device_id/hls/:file", get(super::hls::hls_resource))
        // 健康检查
        .route("/health", get(super::handlers::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if permissive_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, HlsConfig};
    use crate::session::offline_manager;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use bytes::Bytes;
    use common::MediaFrame;
    use futures::StreamExt;
    use tower::ServiceExt;

    const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0snapshot\xFF\xD9";

    fn app_with_device() -> (Router, AppState) {
        let sessions = offline_manager();
        sessions.add(DeviceConfig::new("printer-1", "10.0.0.2")).unwrap();
        let state = AppState {
            sessions,
            http: reqwest::Client::new(),
            hls: HlsConfig::default(),
        };
        (create_router(state.clone(), true), state)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    fn publish_jpeg(state: &AppState) {
        let handle = state.sessions.get("printer-1").unwrap();
        handle.hub().publish_frame(&MediaFrame {
            data: Bytes::from_static(JPEG),
            timestamp_ms: 1,
            sequence: 1,
        });
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check() {
        let (app, _state) = app_with_device();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"], "OK");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_list_and_status() {
        let (app, _state) = app_with_device();

        let response = app.clone().oneshot(get("/api/devices")).await.unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"][0]["device_id"], "printer-1");

        let response = app.clone().oneshot(get("/api/devices/printer-1/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/api/devices/missing/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["status"], "error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_actions() {
        let (app, _state) = app_with_device();

        let response = app.clone().oneshot(post("/api/devices/printer-1/pause")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app.clone().oneshot(post("/api/devices/printer-1/reboot")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(post("/api/devices/missing/enable")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_serves_cached_frame() {
        let (app, state) = app_with_device();
        publish_jpeg(&state);

        let response = app.oneshot(get("/devices/printer-1/snapshot.jpg")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], JPEG);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_without_frame_times_out() {
        let (app, _state) = app_with_device();
        let response = app.oneshot(get("/devices/printer-1/snapshot.jpg")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mjpeg_stream_starts_with_cached_frame() {
        let (app, state) = app_with_device();
        publish_jpeg(&state);

        let response = app.oneshot(get("/devices/printer-1/stream.mjpeg")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let hub = state.sessions.get("printer-1").unwrap().hub().clone();
        assert_eq!(hub.client_counts().mjpeg, 1);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"--frame\r\n"));
        assert!(first.windows(JPEG.len()).any(|window| window == JPEG));

        // 断开后订阅被注销
        drop(body);
        assert_eq!(hub.client_counts().mjpeg, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hls_before_content() {
        let (app, _state) = app_with_device();

        let response = app.clone().oneshot(get("/devices/printer-1/hls/live.m3u8")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app.clone().oneshot(get("/devices/printer-1/hls/seg-3.m4s")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/devices/printer-1/hls/other.txt")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
