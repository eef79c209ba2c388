// 媒体流摄取
//
// 从设备拉取媒体流并切分为帧。FLV模式输出经过参数集门控的H.264访问单元，
// MJPEG模式输出JPEG图像。数据源被当作不透明的字节流处理。

mod flv;
mod framerate;
mod http;
mod multipart;

pub use flv::{FlvDemuxer, FlvEvent};
pub use framerate::FrameRateMeter;
pub use http::{fetch_capabilities, FlvFrameStream, HttpMediaConnector, HttpMediaSource, MjpegFrameStream};
pub use multipart::{boundary_from_content_type, MultipartParser};

use async_trait::async_trait;
use bytes::Bytes;
use common::{EncodedPacket, StreamError};
use std::sync::Arc;

use crate::config::DeviceConfig;

/// 摄取得到的帧
#[derive(Debug, Clone)]
pub enum IngestFrame {
    /// 设备直接输出的JPEG图像
    Jpeg(Bytes),
    /// 已通过参数集门控的H.264访问单元，时间戳为接收时刻
    H264(EncodedPacket),
}

/// 已打开的帧流
#[async_trait]
pub trait FrameStream: Send {
    /// 获取下一帧
    ///
    /// # 返回
    ///
    /// - `Ok(Some(frame))`: 成功获取一帧
    /// - `Ok(None)`: 源端正常结束
    /// - `Err(error)`: 连接中断或数据损坏
    ///
    /// # 注意
    ///
    /// 必须是取消安全的：在 `select!` 中被丢弃时不能丢失已读取的数据。
    async fn next_frame(&mut self) -> Result<Option<IngestFrame>, StreamError>;
}

/// 媒体数据源
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// 建立连接，返回帧流
    async fn open(&self) -> Result<Box<dyn FrameStream>, StreamError>;

    /// 数据源描述（用于日志）
    fn describe(&self) -> String;
}

/// 按设备配置创建媒体数据源
pub trait MediaConnector: Send + Sync {
    fn source(&self, device: &DeviceConfig) -> Arc<dyn MediaSource>;
}
