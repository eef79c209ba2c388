// 媒体服务
//
// 每台设备每种格式一个推送点：MJPEG、快照、FLV、LL-HLS/传统HLS，以及状态和控制API。

mod handlers;
mod hls;
mod hub;
mod queue;
mod routes;
mod streaming;

pub use hub::{FlvSubscription, MediaHub};
pub use queue::{ClientQueue, Fanout, OverflowPolicy, Pulled, Subscription};
pub use routes::create_router;

use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::HlsConfig;
use crate::session::SessionManager;
use crate::task::AbortOnDrop;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    /// 访问设备能力接口用的HTTP客户端
    pub http: reqwest::Client,
    pub hls: HlsConfig,
}

/// HTTP服务器
pub struct HttpServer {
    addr: SocketAddr,
    state: AppState,
    permissive_cors: bool,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState, permissive_cors: bool) -> Self {
        Self {
            addr,
            state,
            permissive_cors,
        }
    }

    pub async fn run(self) -> Result<()> {
        let app = create_router(self.state, self.permissive_cors);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("✓ HTTP server listening on {}", self.addr);

        // HLS观众按客户端地址计数
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
        Ok(())
    }
}

/// 周期性驱逐失活客户端
pub fn spawn_reaper(sessions: SessionManager, interval: Duration) -> AbortOnDrop {
    AbortOnDrop::new(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted: usize = sessions.handles().iter().map(|handle| handle.hub().reap()).sum();
            if evicted > 0 {
                debug!("Reaper evicted {} stale clients", evicted);
            }
        }
    }))
}
