use anyhow::Result;
use clap::Parser;
use proxy_server::config::ConfigManager;
use proxy_server::control::MqttConnector;
use proxy_server::credentials::SshCredentialResolver;
use proxy_server::encoder::{ffmpeg_backends, FfmpegDecoderFactory};
use proxy_server::ingest::HttpMediaConnector;
use proxy_server::server::{spawn_reaper, AppState, HttpServer};
use proxy_server::session::{SessionDeps, SessionManager, SessionSettings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "proxy-server")]
#[command(about = "Printer camera proxy: MJPEG, FLV and LL-HLS from the printer's camera", long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, env = "CAMPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// 覆盖HTTP监听地址
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 加载配置
    let mut config_manager = ConfigManager::new(args.config.clone());
    config_manager.load().await?;
    let mut config = config_manager.into_config();
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    // 初始化日志（RUST_LOG优先）
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("🚀 Camera proxy starting...");
    match &args.config {
        Some(path) => info!("✓ Configuration loaded from {}", path.display()),
        None => info!("✓ Using default configuration"),
    }
    if config.devices.is_empty() {
        warn!("⚠️  No devices configured");
    }

    // 组件
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()?;
    let deps = SessionDeps {
        credentials: Arc::new(SshCredentialResolver::default()),
        control: Arc::new(MqttConnector::new(
            config.control.clone(),
            config.policy.reachability_timeout,
        )),
        media: Arc::new(HttpMediaConnector::new(http.clone(), config.policy.first_frame_timeout)),
        decoders: Arc::new(FfmpegDecoderFactory::new(config.encoder.clone())),
        encoders: ffmpeg_backends(&config.encoder_preference()?, &config.encoder),
    };
    info!(
        "✓ Encoder candidates: {}",
        config.encoder.preference.join(", ")
    );

    // 会话
    let sessions = SessionManager::new(
        SessionSettings::from_config(&config),
        deps,
        config.runtime.pin_sessions,
    );
    for device in &config.devices {
        sessions.add(device.clone())?;
    }
    info!("✓ {} session(s) started", sessions.len());

    let _reaper = spawn_reaper(sessions.clone(), config.clients.liveness_timeout / 2);

    // HTTP服务
    let state = AppState {
        sessions: sessions.clone(),
        http,
        hls: config.hls.clone(),
    };
    let server = HttpServer::new(config.server.listen, state, config.server.permissive_cors);

    info!("✅ Camera proxy ready!");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    sessions.shutdown_all().await;
    info!("Camera proxy stopped");
    Ok(())
}
