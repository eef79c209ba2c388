use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ErrorKind, SessionError};

/// 设备控制凭据
///
/// 每次连接尝试解析一次，核心模块从不持久化。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// 凭据文件中携带的设备标识（可选）
    pub device_id: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// 从控制通道检测到的设备身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub model_code: String,
}

/// 解码后的图像帧（JPEG）
#[derive(Debug, Clone)]
pub struct MediaFrame {
    /// JPEG数据
    pub data: Bytes,
    /// 接收时刻的墙钟时间（毫秒），单调不减
    pub timestamp_ms: u64,
    /// 会话内严格递增的序号
    pub sequence: u64,
}

/// H.264参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Bytes,
    pub pps: Bytes,
}

/// 编码后的H.264访问单元（Annex-B）
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Annex-B格式的访问单元数据
    pub data: Bytes,
    /// 继承自源帧的时间戳（毫秒）
    pub timestamp_ms: u64,
    /// 是否为IDR关键帧
    pub keyframe: bool,
    /// 当前生效的参数集（关键帧必带）
    pub parameter_sets: Option<ParameterSets>,
    /// 此包之前存在不连续（参数集变化或丢包）
    pub discontinuity: bool,
}

impl EncodedPacket {
    pub fn has_parameter_sets(&self) -> bool {
        self.parameter_sets.is_some()
    }
}

/// 帧时钟
///
/// 时间戳取自接收时刻而非计数器，以容忍源端可变帧率；
/// 如果墙钟回拨，沿用上一个时间戳，保证单调不减。
/// 接收时刻和已输出帧各自维护水位：解码滞后时，输出帧仍使用源数据包的接收时间。
#[derive(Debug, Default)]
pub struct FrameClock {
    last_receipt_ms: u64,
    last_emitted_ms: u64,
    next_sequence: u64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用当前接收时刻为帧打上时间戳
    pub fn stamp(&mut self, data: Bytes) -> MediaFrame {
        let receipt = self.receipt_timestamp();
        self.stamp_at(data, receipt)
    }

    pub fn stamp_at(&mut self, data: Bytes, timestamp_ms: u64) -> MediaFrame {
        let timestamp_ms = timestamp_ms.max(self.last_emitted_ms);
        self.last_emitted_ms = timestamp_ms;
        self.next_sequence += 1;
        MediaFrame {
            data,
            timestamp_ms,
            sequence: self.next_sequence,
        }
    }

    /// 返回单调不减的接收时间戳（不消耗序号）
    pub fn receipt_timestamp(&mut self) -> u64 {
        self.receipt_timestamp_at(now_millis())
    }

    pub fn receipt_timestamp_at(&mut self, now_ms: u64) -> u64 {
        let timestamp_ms = now_ms.max(self.last_receipt_ms);
        self.last_receipt_ms = timestamp_ms;
        timestamp_ms
    }
}

/// 当前墙钟毫秒数
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Initializing,
    Connecting,
    Running,
    Paused,
    Retrying,
    Failed,
    Disabled,
}

/// 重试退避档位
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffTier {
    /// 控制通道可达，仅媒体流异常
    Short,
    /// 设备完全离线
    Long,
}

/// 最近一次错误
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&SessionError> for ErrorRecord {
    fn from(error: &SessionError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

/// 各输出格式的在线客户端数
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientCounts {
    pub mjpeg: usize,
    pub flv: usize,
    pub hls: usize,
}

impl ClientCounts {
    pub fn total(&self) -> usize {
        self.mjpeg + self.flv + self.hls
    }
}

/// 会话状态快照
///
/// 不可变聚合，由监督器整体替换，外部观察者只读。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub state: SessionState,
    pub fps: f64,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub frames: u64,
    pub last_error: Option<ErrorRecord>,
    pub clients: ClientCounts,
    pub encoder: Option<String>,
    pub identity: Option<DeviceIdentity>,
    pub backoff: Option<BackoffTier>,
    pub quick_restarts: u32,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: SessionState::Stopped,
            fps: 0.0,
            width: None,
            height: None,
            frames: 0,
            last_error: None,
            clients: ClientCounts::default(),
            encoder: None,
            identity: None,
            backoff: None,
            quick_restarts: 0,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_clock_monotonic() {
        let mut clock = FrameClock::new();

        let a = clock.stamp_at(Bytes::from_static(b"a"), 1_000);
        let b = clock.stamp_at(Bytes::from_static(b"b"), 1_040);
        // 墙钟回拨
        let c = clock.stamp_at(Bytes::from_static(b"c"), 900);
        let d = clock.stamp_at(Bytes::from_static(b"d"), 1_040);

        let frames = [a, b, c, d];
        for pair in frames.windows(2) {
            assert!(pair[1].timestamp_ms >= pair[0].timestamp_ms);
            assert!(pair[1].sequence > pair[0].sequence);
        }
        assert_eq!(frames[2].timestamp_ms, 1_040);
    }

    #[test]
    fn test_lagging_frames_keep_their_receipt_time() {
        let mut clock = FrameClock::new();

        // 两个数据包先后到达，解码输出滞后一个包
        let first = clock.receipt_timestamp_at(1_000);
        let second = clock.receipt_timestamp_at(1_200);
        assert_eq!(clock.receipt_timestamp_at(1_100), 1_200);

        let a = clock.stamp_at(Bytes::from_static(b"a"), first);
        let b = clock.stamp_at(Bytes::from_static(b"b"), second);
        assert_eq!(a.timestamp_ms, 1_000);
        assert_eq!(b.timestamp_ms, 1_200);
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
            device_id: None,
        };
        let text = format!("{:?}", creds);
        assert!(!text.contains("secret"));
        assert!(text.contains("user"));
    }

    #[test]
    fn test_status_serialization() {
        let snapshot = StatusSnapshot::new("printer-1");
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["clients"]["mjpeg"], 0);
    }
}
