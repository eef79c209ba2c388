// 打印机摄像头代理 - 错误类型定义
//
// 每个组件都向会话监督器上报带类型的错误，而不是吞掉失败。
// SessionError 汇总所有组件错误，用于状态快照中的 last_error。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 凭据获取错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// 设备不可达（TCP/SSH握手失败）
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// SSH认证失败
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// 凭据文件内容无法解析
    #[error("Malformed credential payload: {0}")]
    MalformedPayload(String),
}

/// 控制通道错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlChannelError {
    #[error("Control channel connect failed: {0}")]
    ConnectFailed(String),

    #[error("Subscribe timed out")]
    SubscribeTimeout,

    #[error("Device identity detection timed out")]
    DetectionTimeout,

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// 媒体流错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Stream connect refused: {0}")]
    ConnectRefused(String),

    #[error("Timed out waiting for codec parameter sets")]
    ParameterSetTimeout,

    #[error("Stream dropped mid-stream: {0}")]
    MidStreamDrop(String),

    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// 在超时时间内没有收到任何数据
    #[error("Stream stalled for {0} ms")]
    Stalled(u64),

    /// 容器格式错误
    #[error("Stream protocol error: {0}")]
    Protocol(String),
}

/// 编码错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Encoder init failure: {0}")]
    InitFailure(String),

    #[error("Per-frame encode failure: {0}")]
    PerFrameFailure(String),

    #[error("Encoder {0} is not functional")]
    NonFunctionalEncoder(String),
}

/// 封装错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Codec parameter sets missing")]
    MissingParameterSets,
}

/// 会话级错误（组件错误的汇总）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Control(#[from] ControlChannelError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// 错误分类（用于状态快照序列化）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Credential,
    Control,
    Stream,
    Encode,
    Mux,
    Configuration,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Credential(_) => ErrorKind::Credential,
            SessionError::Control(_) => ErrorKind::Control,
            SessionError::Stream(_) => ErrorKind::Stream,
            SessionError::Encode(_) => ErrorKind::Encode,
            SessionError::Mux(_) => ErrorKind::Mux,
            SessionError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// 是否为不可恢复错误（需要进入 Failed 状态）
    ///
    /// 凭据内容错误、认证失败和配置错误无法通过重连解决。
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            SessionError::Credential(CredentialError::AuthFailed(_))
                | SessionError::Credential(CredentialError::MalformedPayload(_))
                | SessionError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors: Vec<SessionError> = vec![
            CredentialError::Unreachable("10.0.0.2".to_string()).into(),
            ControlChannelError::DetectionTimeout.into(),
            StreamError::ParameterSetTimeout.into(),
            EncodeError::NonFunctionalEncoder("h264_v4l2m2m".to_string()).into(),
            MuxError::MissingParameterSets.into(),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_unrecoverable_classification() {
        let malformed: SessionError =
            CredentialError::MalformedPayload("expected value".to_string()).into();
        assert!(malformed.is_unrecoverable());
        assert_eq!(malformed.kind(), ErrorKind::Credential);

        let unreachable: SessionError = CredentialError::Unreachable("timeout".to_string()).into();
        assert!(!unreachable.is_unrecoverable());

        let stall: SessionError = StreamError::Stalled(10_000).into();
        assert!(!stall.is_unrecoverable());
        assert_eq!(stall.kind(), ErrorKind::Stream);
    }
}
