use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{now_millis, DeviceIdentity};

/// 视频控制主题前缀
pub const TOPIC_PREFIX: &str = "anycubic/anycubicCloud/v1";

/// 设备凭据文件路径（通过SSH读取）
pub const CREDENTIALS_PATH: &str = "/userdata/app/gk/config/device_account.json";

/// 视频控制动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VideoAction {
    #[serde(rename = "startCapture")]
    StartCapture,
    #[serde(rename = "stopCapture")]
    StopCapture,
    /// 通知设备端媒体服务由代理负责压缩输出
    #[serde(rename = "proxyTakeover")]
    ProxyTakeover,
}

/// 视频控制命令
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: VideoAction,
    pub msgid: String,
    pub timestamp: u64,
    pub data: Option<serde_json::Value>,
}

impl VideoCommand {
    /// 构造带新消息ID的命令
    pub fn new(action: VideoAction) -> Self {
        Self {
            kind: "video".to_string(),
            action,
            msgid: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// 尝试从入站消息负载解析视频命令
    ///
    /// 非视频命令或无法解析的负载返回None。
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let command: VideoCommand = serde_json::from_slice(payload).ok()?;
        if command.kind.eq_ignore_ascii_case("video") {
            Some(command)
        } else {
            None
        }
    }
}

/// 视频控制主题（按型号和设备ID寻址）
pub fn video_topic(identity: &DeviceIdentity) -> String {
    format!(
        "{}/web/printer/{}/{}/video",
        TOPIC_PREFIX, identity.model_code, identity.device_id
    )
}

/// 设备凭据文件内容
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAccount {
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "deviceId", alias = "device_id", alias = "cn")]
    pub device_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let command = VideoCommand::new(VideoAction::StartCapture);
        let json = serde_json::to_value(&command).unwrap();

        assert_eq!(json["type"], "video");
        assert_eq!(json["action"], "startCapture");
        assert!(json["data"].is_null());
        assert!(!command.msgid.is_empty());
    }

    #[test]
    fn test_parse_inbound_stop() {
        let payload = br#"{"type":"video","action":"stopCapture","msgid":"abc","timestamp":1,"data":null}"#;
        let command = VideoCommand::parse(payload).unwrap();
        assert_eq!(command.action, VideoAction::StopCapture);
        assert_eq!(command.msgid, "abc");

        assert!(VideoCommand::parse(b"not json").is_none());
        assert!(VideoCommand::parse(br#"{"type":"print","action":"startCapture","msgid":"x","timestamp":1,"data":null}"#).is_none());
    }

    #[test]
    fn test_video_topic() {
        let identity = DeviceIdentity {
            device_id: "ABC123".to_string(),
            model_code: "K1".to_string(),
        };
        assert_eq!(
            video_topic(&identity),
            "anycubic/anycubicCloud/v1/web/printer/K1/ABC123/video"
        );
    }

    #[test]
    fn test_device_account_aliases() {
        let account: DeviceAccount =
            serde_json::from_str(r#"{"username":"u","password":"p","cn":"X1"}"#).unwrap();
        assert_eq!(account.device_id.as_deref(), Some("X1"));
    }
}
