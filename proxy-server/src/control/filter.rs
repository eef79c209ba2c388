// 入站消息过滤
//
// 控制通道订阅了全部主题，所有入站消息先经过这里：
// 1. 从主题或负载中识别设备身份（首个匹配生效）
// 2. 区分自己发出的停止命令回显和外部停止命令

use common::{DeviceIdentity, VideoAction, VideoCommand};
use regex::Regex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

const IDENTITY_PATTERN: &str = r"(?i)anycubic/anycubicCloud/v1/[^/]+/(?:public/)?([^/]+)/([^/]+)/";

/// 设备身份识别器
pub struct IdentityDetector {
    pattern: Regex,
}

impl IdentityDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(IDENTITY_PATTERN)?,
        })
    }

    /// 先查主题，再查负载文本
    pub fn detect(&self, topic: &str, payload: &[u8]) -> Option<DeviceIdentity> {
        self.match_text(topic).or_else(|| {
            std::str::from_utf8(payload)
                .ok()
                .and_then(|text| self.match_text(text))
        })
    }

    fn match_text(&self, text: &str) -> Option<DeviceIdentity> {
        let captures = self.pattern.captures(text)?;
        Some(DeviceIdentity {
            model_code: captures.get(1)?.as_str().to_string(),
            device_id: captures.get(2)?.as_str().to_string(),
        })
    }
}

/// 过滤结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundVerdict {
    /// 与视频控制无关
    Ignored,
    /// 自己发出命令的回显
    SelfEcho { msgid: String },
    /// 其他客户端发出的停止命令
    ExternalStop { msgid: String },
}

/// 自发命令ID集合，带过期
#[derive(Debug)]
pub struct OutstandingCommands {
    expiry: Duration,
    ids: HashMap<String, Instant>,
}

impl OutstandingCommands {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            ids: HashMap::new(),
        }
    }

    pub fn record(&mut self, msgid: impl Into<String>, now: Instant) {
        self.ids.insert(msgid.into(), now + self.expiry);
    }

    pub fn prune(&mut self, now: Instant) {
        self.ids.retain(|_, deadline| *deadline > now);
    }

    pub fn contains(&self, msgid: &str) -> bool {
        self.ids.contains_key(msgid)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 对入站负载分类；每条入站消息都会先清理过期ID
    pub fn classify(&mut self, payload: &[u8], now: Instant) -> InboundVerdict {
        self.prune(now);

        let command = match VideoCommand::parse(payload) {
            Some(command) => command,
            None => return InboundVerdict::Ignored,
        };

        if self.contains(&command.msgid) {
            debug!("Ignoring echo of own command {}", command.msgid);
            return InboundVerdict::SelfEcho {
                msgid: command.msgid,
            };
        }

        match command.action {
            VideoAction::StopCapture => InboundVerdict::ExternalStop {
                msgid: command.msgid,
            },
            _ => InboundVerdict::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop_payload(msgid: &str) -> Vec<u8> {
        format!(
            r#"{{"type":"video","action":"stopCapture","msgid":"{}","timestamp":1,"data":null}}"#,
            msgid
        )
        .into_bytes()
    }

    #[test]
    fn test_identity_from_topic() {
        let detector = IdentityDetector::new().unwrap();
        let identity = detector
            .detect("anycubic/anycubicCloud/v1/printer/public/K1/ABC123/status", b"{}")
            .unwrap();
        assert_eq!(identity.model_code, "K1");
        assert_eq!(identity.device_id, "ABC123");

        let identity = detector
            .detect("ANYCUBIC/anycubiccloud/V1/web/K2/XYZ/video", b"")
            .unwrap();
        assert_eq!(identity.model_code, "K2");
        assert_eq!(identity.device_id, "XYZ");
    }

    #[test]
    fn test_identity_from_payload() {
        let detector = IdentityDetector::new().unwrap();
        let payload = br#"{"reply":"anycubic/anycubicCloud/v1/printer/public/K3/DEV9/info"}"#;
        let identity = detector.detect("some/other/topic", payload).unwrap();
        assert_eq!(identity.device_id, "DEV9");

        assert!(detector.detect("unrelated", b"nothing here").is_none());
    }

    #[test]
    fn test_self_echo_suppressed() {
        let mut outstanding = OutstandingCommands::new(Duration::from_secs(30));
        let now = Instant::now();
        outstanding.record("mine", now);

        assert_eq!(
            outstanding.classify(&stop_payload("mine"), now),
            InboundVerdict::SelfEcho {
                msgid: "mine".to_string()
            }
        );
        assert_eq!(
            outstanding.classify(&stop_payload("theirs"), now),
            InboundVerdict::ExternalStop {
                msgid: "theirs".to_string()
            }
        );
        assert_eq!(outstanding.classify(b"garbage", now), InboundVerdict::Ignored);
    }

    #[test]
    fn test_expired_ids_are_pruned() {
        let mut outstanding = OutstandingCommands::new(Duration::from_secs(30));
        let start = Instant::now();
        outstanding.record("old", start);

        let later = start + Duration::from_secs(31);
        // 过期后同一ID的停止命令视为外部命令
        assert!(matches!(
            outstanding.classify(&stop_payload("old"), later),
            InboundVerdict::ExternalStop { .. }
        ));
        assert!(outstanding.is_empty());
    }
}
