// 代理配置
//
// TOML文件 + CAMPROXY_* 环境变量覆盖 + 命令行覆盖。
// 所有时长字段以毫秒整数存储。

use common::SessionError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::encoder::EncoderKind;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub policy: PolicyConfig,
    pub control: ControlConfig,
    pub encoder: EncoderConfig,
    pub hls: HlsConfig,
    pub clients: ClientsConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP监听地址
    pub listen: SocketAddr,
    /// 允许任意来源跨域访问
    pub permissive_cors: bool,
}

/// 会话恢复策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// 连接内快速重启次数
    pub quick_restart_attempts: u32,

    #[serde(with = "crate::serde_helpers::millis")]
    pub short_backoff: Duration,

    #[serde(with = "crate::serde_helpers::millis")]
    pub long_backoff: Duration,

    /// Failed状态下的周期性重试间隔
    #[serde(with = "crate::serde_helpers::millis")]
    pub failed_retry_interval: Duration,

    /// 运行中多久没有新帧视为停滞
    #[serde(with = "crate::serde_helpers::millis")]
    pub stall_timeout: Duration,

    /// 打开媒体流后等待第一帧的时间
    #[serde(with = "crate::serde_helpers::millis")]
    pub first_frame_timeout: Duration,

    /// 控制端口可达性探测超时
    #[serde(with = "crate::serde_helpers::millis")]
    pub reachability_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    #[serde(with = "crate::serde_helpers::millis")]
    pub subscribe_timeout: Duration,

    #[serde(with = "crate::serde_helpers::millis")]
    pub detection_timeout: Duration,

    /// 自发命令ID的过期时间
    #[serde(with = "crate::serde_helpers::millis")]
    pub command_expiry: Duration,

    #[serde(with = "crate::serde_helpers::millis")]
    pub keep_alive: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// 候选编码器优先顺序（ffmpeg编码器名）
    pub preference: Vec<String>,
    /// 连续失败多少帧后回退
    pub failure_threshold: u32,
    /// 解码输出的JPEG质量（ffmpeg -q:v，2最好）
    pub jpeg_quality: u8,
    pub bitrate_kbps: u32,
    /// 关键帧间隔（帧）
    pub gop: u32,
    pub ffmpeg_path: PathBuf,
    #[serde(with = "crate::serde_helpers::millis")]
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    #[serde(with = "crate::serde_helpers::millis")]
    pub segment_duration: Duration,
    #[serde(with = "crate::serde_helpers::millis")]
    pub part_duration: Duration,
    /// 播放列表保留的分段数
    pub window_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    pub mjpeg_queue: usize,
    pub flv_queue: usize,
    #[serde(with = "crate::serde_helpers::millis")]
    pub liveness_timeout: Duration,
    #[serde(with = "crate::serde_helpers::millis")]
    pub snapshot_recovery_timeout: Duration,
    /// MJPEG停滞期间重发上一帧的间隔
    #[serde(with = "crate::serde_helpers::millis")]
    pub mjpeg_resend_interval: Duration,
    /// GOP缓存的最大包数
    pub gop_cache_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 每个会话独占一个绑核线程
    pub pin_sessions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（trace, debug, info, warn, error）
    pub level: String,
}

/// 设备媒体流格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Flv,
    Mjpeg,
}

/// 单台设备配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,
    #[serde(default = "default_ssh_password")]
    pub ssh_password: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "default_stream_mode")]
    pub stream_mode: StreamMode,
    /// 覆盖默认的媒体流地址
    #[serde(default)]
    pub stream_url: Option<String>,
    /// 即使源是H.264也重新编码
    #[serde(default)]
    pub transcode_h264: bool,
    /// 输出H.264（FLV/HLS）
    #[serde(default = "default_true")]
    pub h264_output: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 检测到设备身份后发布代理接管通知
    #[serde(default)]
    pub announce_upstream: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_username() -> String {
    "root".to_string()
}

fn default_ssh_password() -> String {
    "rockchip".to_string()
}

fn default_mqtt_port() -> u16 {
    9883
}

fn default_stream_mode() -> StreamMode {
    StreamMode::Flv
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            ssh_port: default_ssh_port(),
            ssh_username: default_ssh_username(),
            ssh_password: default_ssh_password(),
            mqtt_port: default_mqtt_port(),
            stream_mode: default_stream_mode(),
            stream_url: None,
            transcode_h264: false,
            h264_output: true,
            enabled: true,
            announce_upstream: false,
        }
    }

    /// 媒体流地址
    pub fn stream_url(&self) -> String {
        if let Some(url) = &self.stream_url {
            return url.clone();
        }
        match self.stream_mode {
            StreamMode::Flv => format!("http://{}:18088/flv", self.address),
            StreamMode::Mjpeg => format!("http://{}:8080/?action=stream", self.address),
        }
    }

    /// 设备能力描述地址
    pub fn capabilities_url(&self) -> String {
        format!("http://{}:18086/info", self.address)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8088)),
            permissive_cors: true,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            quick_restart_attempts: 3,
            short_backoff: Duration::from_secs(5),
            long_backoff: Duration::from_secs(60),
            failed_retry_interval: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(10),
            first_frame_timeout: Duration::from_secs(10),
            reachability_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: Duration::from_secs(5),
            detection_timeout: Duration::from_secs(15),
            command_expiry: Duration::from_secs(30),
            keep_alive: Duration::from_secs(15),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            preference: EncoderKind::ALL
                .iter()
                .map(|kind| kind.ffmpeg_name().to_string())
                .collect(),
            failure_threshold: 5,
            jpeg_quality: 3,
            bitrate_kbps: 2500,
            gop: 30,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            probe_timeout: Duration::from_secs(8),
        }
    }
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_duration: Duration::from_secs(2),
            part_duration: Duration::from_millis(500),
            window_size: 6,
        }
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            mjpeg_queue: 4,
            flv_queue: 256,
            liveness_timeout: Duration::from_secs(20),
            snapshot_recovery_timeout: Duration::from_secs(6),
            mjpeg_resend_interval: Duration::from_secs(2),
            gop_cache_limit: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// 按顺序解析出的编码器候选
    pub fn encoder_preference(&self) -> Result<Vec<EncoderKind>, SessionError> {
        self.encoder
            .preference
            .iter()
            .map(|name| {
                EncoderKind::from_ffmpeg_name(name).ok_or_else(|| {
                    SessionError::Configuration(format!("Unknown encoder candidate: {}", name))
                })
            })
            .collect()
    }
}

/// 配置管理器：加载、校验
pub struct ConfigManager {
    config_path: Option<PathBuf>,
    config: AppConfig,
}

impl ConfigManager {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self {
            config_path,
            config: AppConfig::default(),
        }
    }

    /// 从文件加载配置（未指定路径时使用默认值），然后应用环境变量覆盖
    pub async fn load(&mut self) -> Result<(), SessionError> {
        if let Some(path) = &self.config_path {
            self.config = Self::read_file(path).await?;
        }
        EnvConfigOverride::apply_overrides(&mut self.config);
        self.validate()
    }

    async fn read_file(path: &Path) -> Result<AppConfig, SessionError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SessionError::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&content)
            .map_err(|e| SessionError::Configuration(format!("Failed to parse config file: {}", e)))
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn get_config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    pub fn into_config(self) -> AppConfig {
        self.config
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), SessionError> {
        let config = &self.config;
        let invalid = |message: &str| Err(SessionError::Configuration(message.to_string()));

        if config.encoder.failure_threshold == 0 {
            return invalid("Encoder failure threshold must be greater than 0");
        }
        config.encoder_preference()?;

        if config.hls.window_size < 2 {
            return invalid("HLS window must hold at least 2 segments");
        }
        if config.hls.part_duration.is_zero() || config.hls.part_duration > config.hls.segment_duration {
            return invalid("HLS part duration must be positive and not exceed the segment duration");
        }
        if config.clients.mjpeg_queue == 0 || config.clients.flv_queue == 0 {
            return invalid("Client queues must hold at least one item");
        }
        if config.policy.stall_timeout.is_zero() || config.policy.first_frame_timeout.is_zero() {
            return invalid("Stall and first-frame timeouts must be positive");
        }

        let mut ids = std::collections::HashSet::new();
        for device in &config.devices {
            if device.id.is_empty() || device.address.is_empty() {
                return invalid("Device id and address cannot be empty");
            }
            if !ids.insert(device.id.as_str()) {
                return Err(SessionError::Configuration(format!(
                    "Duplicate device id: {}",
                    device.id
                )));
            }
        }

        Ok(())
    }
}

/// 环境变量覆盖
pub struct EnvConfigOverride;

impl EnvConfigOverride {
    pub fn apply_overrides(config: &mut AppConfig) {
        use std::env;

        if let Ok(listen) = env::var("CAMPROXY_LISTEN") {
            if let Ok(listen) = listen.parse() {
                config.server.listen = listen;
            }
        }
        if let Ok(level) = env::var("CAMPROXY_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(path) = env::var("CAMPROXY_FFMPEG") {
            config.encoder.ffmpeg_path = PathBuf::from(path);
        }
        if let Ok(preference) = env::var("CAMPROXY_ENCODERS") {
            config.encoder.preference = preference
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }
        if let Ok(pin) = env::var("CAMPROXY_PIN_SESSIONS") {
            config.runtime.pin_sessions = pin.eq_ignore_ascii_case("true") || pin == "1";
        }
    }
}
