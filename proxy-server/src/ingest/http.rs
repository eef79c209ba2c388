use async_trait::async_trait;
use bytes::Bytes;
use common::{now_millis, StreamError};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::flv::{FlvDemuxer, FlvEvent};
use super::multipart::{boundary_from_content_type, MultipartParser};
use super::{FrameStream, IngestFrame, MediaConnector, MediaSource};
use crate::codec::{JpegScanner, ParameterSetGate};
use crate::config::{DeviceConfig, StreamMode};

/// 原始字节流
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// 通过HTTP拉取设备媒体流
pub struct HttpMediaSource {
    client: reqwest::Client,
    url: String,
    mode: StreamMode,
    parameter_set_timeout: Duration,
}

impl HttpMediaSource {
    pub fn new(client: reqwest::Client, device: &DeviceConfig, parameter_set_timeout: Duration) -> Self {
        Self {
            client,
            url: device.stream_url(),
            mode: device.stream_mode,
            parameter_set_timeout,
        }
    }
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn open(&self) -> Result<Box<dyn FrameStream>, StreamError> {
        debug!("Opening media stream {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| StreamError::ConnectRefused(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::ConnectRefused(format!("HTTP {} from {}", status, self.url)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body: ByteStream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::MidStreamDrop(e.to_string())))
            .boxed();

        info!("✓ Media stream connected: {} ({})", self.url, content_type);

        Ok(match self.mode {
            StreamMode::Flv => Box::new(FlvFrameStream::new(body, self.parameter_set_timeout)),
            StreamMode::Mjpeg => Box::new(MjpegFrameStream::new(
                body,
                boundary_from_content_type(&content_type).as_deref(),
            )),
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// HTTP数据源工厂，所有会话共享一个连接池
#[derive(Clone)]
pub struct HttpMediaConnector {
    client: reqwest::Client,
    parameter_set_timeout: Duration,
}

impl HttpMediaConnector {
    pub fn new(client: reqwest::Client, parameter_set_timeout: Duration) -> Self {
        Self {
            client,
            parameter_set_timeout,
        }
    }
}

impl MediaConnector for HttpMediaConnector {
    fn source(&self, device: &DeviceConfig) -> Arc<dyn MediaSource> {
        Arc::new(HttpMediaSource::new(
            self.client.clone(),
            device,
            self.parameter_set_timeout,
        ))
    }
}

async fn next_chunk(body: &mut ByteStream) -> Result<Bytes, StreamError> {
    match body.next().await {
        Some(chunk) => chunk,
        None => Err(StreamError::MidStreamDrop("server closed the stream".to_string())),
    }
}

/// FLV帧流：解复用 + 参数集门控
pub struct FlvFrameStream {
    body: ByteStream,
    demuxer: FlvDemuxer,
    gate: ParameterSetGate,
    parameter_set_timeout: Duration,
    /// 门控关闭的起始时间
    waiting_since: Option<Instant>,
}

impl FlvFrameStream {
    pub fn new(body: ByteStream, parameter_set_timeout: Duration) -> Self {
        Self {
            body,
            demuxer: FlvDemuxer::new(),
            gate: ParameterSetGate::new(),
            parameter_set_timeout,
            waiting_since: Some(Instant::now()),
        }
    }

    fn drain_demuxer(&mut self) -> Result<Option<Option<IngestFrame>>, StreamError> {
        while let Some(event) = self.demuxer.next_event()? {
            match event {
                FlvEvent::SequenceHeader { sps, pps } => self.gate.observe(sps, pps),
                FlvEvent::AccessUnit { data, .. } => {
                    if let Some(packet) = self.gate.admit(data, now_millis()) {
                        self.waiting_since = None;
                        return Ok(Some(Some(IngestFrame::H264(packet))));
                    }
                }
                FlvEvent::EndOfSequence => return Ok(Some(None)),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl FrameStream for FlvFrameStream {
    async fn next_frame(&mut self) -> Result<Option<IngestFrame>, StreamError> {
        loop {
            if let Some(frame) = self.drain_demuxer()? {
                return Ok(frame);
            }

            if self.gate.is_open() {
                self.waiting_since = None;
            } else if self.waiting_since.is_none() {
                self.waiting_since = Some(Instant::now());
            }

            let chunk = match self.waiting_since {
                Some(since) => {
                    let deadline = since + self.parameter_set_timeout;
                    tokio::time::timeout_at(deadline, next_chunk(&mut self.body))
                        .await
                        .map_err(|_| StreamError::ParameterSetTimeout)??
                }
                None => next_chunk(&mut self.body).await?,
            };
            self.demuxer.push(&chunk);
        }
    }
}

enum PartSplitter {
    Multipart(MultipartParser),
    /// 没有声明边界时按JPEG标记切分
    Markers(JpegScanner),
}

/// MJPEG帧流
pub struct MjpegFrameStream {
    body: ByteStream,
    splitter: PartSplitter,
}

impl MjpegFrameStream {
    pub fn new(body: ByteStream, boundary: Option<&str>) -> Self {
        let splitter = match boundary {
            Some(boundary) => PartSplitter::Multipart(MultipartParser::new(boundary)),
            None => PartSplitter::Markers(JpegScanner::new()),
        };
        Self { body, splitter }
    }

    fn next_part(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            let part = match &mut self.splitter {
                PartSplitter::Multipart(parser) => parser.next_part()?,
                PartSplitter::Markers(scanner) => scanner.next_frame(),
            };
            match part {
                Some(part) if part.starts_with(&[0xFF, 0xD8]) => return Ok(Some(part)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl FrameStream for MjpegFrameStream {
    async fn next_frame(&mut self) -> Result<Option<IngestFrame>, StreamError> {
        loop {
            if let Some(jpeg) = self.next_part()? {
                return Ok(Some(IngestFrame::Jpeg(jpeg)));
            }
            let chunk = next_chunk(&mut self.body).await?;
            match &mut self.splitter {
                PartSplitter::Multipart(parser) => parser.push(&chunk),
                PartSplitter::Markers(scanner) => scanner.push(&chunk),
            }
        }
    }
}

/// 拉取设备能力描述（供外部预检使用，核心状态机不依赖）
pub async fn fetch_capabilities(
    client: &reqwest::Client,
    device: &DeviceConfig,
) -> Result<serde_json::Value, StreamError> {
    let url = device.capabilities_url();
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| StreamError::ConnectRefused(e.to_string()))?;

    if !response.status().is_success() {
        return Err(StreamError::ConnectRefused(format!(
            "HTTP {} from {}",
            response.status(),
            url
        )));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| StreamError::Protocol(e.to_string()))
}
