// 设备控制通道
//
// 维护到设备消息代理的长连接：识别设备身份，发送开始/停止采集命令，
// 并把外部停止命令和连接丢失作为事件上报给会话监督器。

mod filter;
mod mqtt;

pub use filter::{IdentityDetector, InboundVerdict, OutstandingCommands};
pub use mqtt::{MqttConnector, MqttControlChannel};

use async_trait::async_trait;
use common::{ControlChannelError, Credentials, DeviceIdentity};
use serde::Serialize;

use crate::config::DeviceConfig;

/// 控制通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Disconnected,
    Connecting,
    Subscribed,
    Detecting,
    Active,
}

/// 上报给监督器的控制事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// 其他客户端停止了设备端采集
    ExternalStopDetected { msgid: String },
    /// 传输层失败，通道已回到 Disconnected
    ChannelLost(ControlChannelError),
}

/// 控制通道
///
/// `next_event` 必须是取消安全的，监督器在 `select!` 中轮询它。
#[async_trait]
pub trait ControlChannel: Send {
    fn state(&self) -> ControlState;

    fn identity(&self) -> Option<&DeviceIdentity>;

    fn is_connected(&self) -> bool {
        self.state() == ControlState::Active
    }

    /// 建立连接、订阅并识别设备身份，成功后处于 Active
    async fn connect(&mut self) -> Result<DeviceIdentity, ControlChannelError>;

    /// 发送开始采集命令，返回消息ID
    async fn send_start(&mut self) -> Result<String, ControlChannelError>;

    async fn send_stop(&mut self) -> Result<String, ControlChannelError>;

    /// 通知设备端由代理负责压缩输出
    async fn announce_proxy(&mut self) -> Result<(), ControlChannelError>;

    async fn next_event(&mut self) -> Option<ControlEvent>;

    async fn close(&mut self);
}

/// 控制通道工厂
#[async_trait]
pub trait ControlConnector: Send + Sync {
    fn channel(&self, device: &DeviceConfig, credentials: &Credentials) -> Box<dyn ControlChannel>;

    /// 廉价的可达性探测，用于选择退避档位
    async fn probe(&self, device: &DeviceConfig) -> bool;
}
