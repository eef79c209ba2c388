// 编码管线
//
// 始终产出JPEG帧；按设备配置可选地产出H.264访问单元（直通或转码）。

mod candidate;
mod ffmpeg;
mod pipeline;

pub use candidate::{
    verify_probe_output, EncoderBackend, EncoderCandidate, EncoderKind, EncoderSelector, EncoderSession,
};
pub use ffmpeg::{FfmpegDecoder, FfmpegDecoderFactory, FfmpegEncoderBackend};
pub use pipeline::{EncoderPipeline, H264Output, PipelineEvent, PipelineOutput, PipelineState, Produced};

use async_trait::async_trait;
use bytes::Bytes;
use common::{EncodedPacket, StreamError};
use std::sync::Arc;

use crate::config::EncoderConfig;

/// H.264 -> JPEG 解码器
#[async_trait]
pub trait FrameDecoder: Send {
    /// 提交一个访问单元
    async fn submit(&mut self, packet: &EncodedPacket) -> Result<(), StreamError>;

    /// 等待下一张解码出的图像（取消安全）
    ///
    /// 返回None表示解码器已经退出。
    async fn next_image(&mut self) -> Option<Result<Bytes, StreamError>>;
}

/// 解码器工厂（每次重建管线时创建新解码器）
pub trait DecoderFactory: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn FrameDecoder>, StreamError>;
}

/// 按配置的优先顺序构建ffmpeg编码候选
pub fn ffmpeg_backends(kinds: &[EncoderKind], config: &EncoderConfig) -> Vec<Arc<dyn EncoderBackend>> {
    kinds
        .iter()
        .map(|kind| Arc::new(FfmpegEncoderBackend::new(*kind, config.clone())) as Arc<dyn EncoderBackend>)
        .collect()
}
