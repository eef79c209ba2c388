use bytes::Bytes;
use common::{EncodeError, EncodedPacket, FrameClock, MediaFrame, StreamError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::candidate::{EncoderBackend, EncoderSelector, EncoderSession};
use super::{DecoderFactory, FrameDecoder};
use crate::codec::jpeg_dimensions;
use crate::config::{DeviceConfig, StreamMode};
use crate::ingest::IngestFrame;

/// 解码队列中最多保留的时间戳
const MAX_DECODE_BACKLOG: usize = 64;

/// 单帧提交给解码器或编码器的时限
const SUBMIT_DEADLINE: Duration = Duration::from_secs(1);

/// H.264输出方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Output {
    /// 只输出JPEG
    Disabled,
    /// 直接转发摄像头的访问单元
    Passthrough,
    /// 用编码候选重新编码JPEG帧
    Transcode,
}

impl H264Output {
    pub fn for_device(device: &DeviceConfig) -> Self {
        if !device.h264_output {
            H264Output::Disabled
        } else if device.stream_mode == StreamMode::Flv && !device.transcode_h264 {
            H264Output::Passthrough
        } else {
            H264Output::Transcode
        }
    }
}

/// 管线上报给监督器的事件
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    EncoderSelected(String),
    /// 编码器回退（始终以警告上报）
    EncoderFallback {
        from: String,
        to: String,
        reason: EncodeError,
    },
    /// 没有任何可用编码器，H.264输出停止
    EncoderUnavailable(EncodeError),
    /// 图像尺寸变化
    Dimensions(u16, u16),
}

/// 解码器或编码器在两次提交之间异步产出的结果
#[derive(Debug)]
pub enum Produced {
    Image(Result<Bytes, StreamError>),
    Packet(Result<EncodedPacket, EncodeError>),
}

/// 一次处理的产出
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub frames: Vec<MediaFrame>,
    pub packets: Vec<EncodedPacket>,
    pub events: Vec<PipelineEvent>,
}

/// 跨重连保留的管线状态
///
/// 帧序号在整个会话内严格递增；选定的编码器在显式重新探测前保持不变。
pub struct PipelineState {
    clock: FrameClock,
    selector: EncoderSelector,
}

impl PipelineState {
    pub fn new(backends: Vec<Arc<dyn EncoderBackend>>) -> Self {
        Self {
            clock: FrameClock::new(),
            selector: EncoderSelector::new(backends),
        }
    }

    pub fn reprobe(&mut self) {
        self.selector.reprobe();
    }
}

/// 编码管线
pub struct EncoderPipeline {
    output: H264Output,
    clock: FrameClock,
    selector: EncoderSelector,
    decoder_factory: Arc<dyn DecoderFactory>,
    decoder: Option<Box<dyn FrameDecoder>>,
    /// 已提交给解码器、尚未产出图像的接收时间戳
    decode_pending: VecDeque<u64>,
    encoder: Option<Box<dyn EncoderSession>>,
    encoder_unavailable: bool,
    consecutive_failures: u32,
    failure_threshold: u32,
    rate_hint: f64,
    dimensions: Option<(u16, u16)>,
}

impl EncoderPipeline {
    pub fn new(
        output: H264Output,
        state: PipelineState,
        decoder_factory: Arc<dyn DecoderFactory>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            output,
            clock: state.clock,
            selector: state.selector,
            decoder_factory,
            decoder: None,
            decode_pending: VecDeque::new(),
            encoder: None,
            encoder_unavailable: false,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            rate_hint: 0.0,
            dimensions: None,
        }
    }

    /// 拆解管线，保留跨重连状态
    pub fn into_state(self) -> PipelineState {
        PipelineState {
            clock: self.clock,
            selector: self.selector,
        }
    }

    pub fn output_mode(&self) -> H264Output {
        self.output
    }

    /// 当前H.264来源
    pub fn active_encoder(&self) -> Option<String> {
        match self.output {
            H264Output::Disabled => None,
            H264Output::Passthrough => Some("passthrough".to_string()),
            H264Output::Transcode => self.selector.active_name(),
        }
    }

    pub fn set_rate_hint(&mut self, fps: f64) {
        self.rate_hint = fps;
    }

    /// 媒体流断开：丢弃解码器和编码进程，编码器选择保持不变
    pub fn reset_stream(&mut self) {
        if self.decoder.take().is_some() {
            debug!("Decoder released");
        }
        self.decode_pending.clear();
        self.encoder = None;
        self.consecutive_failures = 0;
    }

    /// 处理摄取得到的一帧
    pub async fn ingest(&mut self, frame: IngestFrame) -> Result<PipelineOutput, StreamError> {
        let mut out = PipelineOutput::default();
        match frame {
            IngestFrame::Jpeg(data) => {
                let frame = self.clock.stamp(data);
                self.handle_image(frame, &mut out).await;
            }
            IngestFrame::H264(mut packet) => {
                packet.timestamp_ms = self.clock.receipt_timestamp();
                self.submit_to_decoder(&packet).await?;
                if self.output == H264Output::Passthrough {
                    out.packets.push(packet);
                }
            }
        }
        Ok(out)
    }

    /// 等待解码器或编码器的下一个产出；两者都没有时永远挂起（取消安全）
    ///
    /// 解码出的图像优先，避免解码器输出积压。
    pub async fn next_produced(&mut self) -> Produced {
        let Self { decoder, encoder, .. } = self;
        tokio::select! {
            biased;
            image = next_image(decoder) => Produced::Image(image),
            packet = next_packet(encoder) => Produced::Packet(packet),
        }
    }

    /// 编码进程异步输出失败：丢弃会话，下一帧重新打开，失败计入回退阈值
    pub fn on_encoder_error(&mut self, error: EncodeError) {
        self.encoder = None;
        self.consecutive_failures += 1;
        warn!(
            "⚠️  Encoder output failed ({}/{}): {}",
            self.consecutive_failures, self.failure_threshold, error
        );
    }

    /// 处理解码出的图像
    pub async fn on_decoded(&mut self, image: Bytes) -> PipelineOutput {
        let mut out = PipelineOutput::default();
        let timestamp = match self.decode_pending.pop_front() {
            Some(ts) => ts,
            None => self.clock.receipt_timestamp(),
        };
        let frame = self.clock.stamp_at(image, timestamp);
        self.handle_image(frame, &mut out).await;
        out
    }

    async fn submit_to_decoder(&mut self, packet: &EncodedPacket) -> Result<(), StreamError> {
        if self.decoder.is_none() {
            // 解码器只能从关键帧开始
            if !packet.keyframe {
                return Ok(());
            }
            self.decoder = Some(self.decoder_factory.spawn()?);
        }

        if let Some(decoder) = self.decoder.as_mut() {
            tokio::time::timeout(SUBMIT_DEADLINE, decoder.submit(packet))
                .await
                .map_err(|_| StreamError::DecodeFailure("decoder stopped accepting input".to_string()))??;
            self.decode_pending.push_back(packet.timestamp_ms);
            if self.decode_pending.len() > MAX_DECODE_BACKLOG {
                self.decode_pending.pop_front();
            }
        }
        Ok(())
    }

    async fn handle_image(&mut self, frame: MediaFrame, out: &mut PipelineOutput) {
        if let Some(dims) = jpeg_dimensions(&frame.data) {
            if self.dimensions != Some(dims) {
                self.dimensions = Some(dims);
                out.events.push(PipelineEvent::Dimensions(dims.0, dims.1));
            }
        }

        if self.output == H264Output::Transcode {
            self.transcode(&frame, out).await;
        }
        out.frames.push(frame);
    }

    async fn transcode(&mut self, frame: &MediaFrame, out: &mut PipelineOutput) {
        if self.encoder.is_none() && !self.encoder_unavailable {
            let selected = self.selector.select(&frame.data).await;
            self.open_encoder(selected, &frame.data, out).await;
        }

        let Some(session) = self.encoder.as_mut() else {
            return;
        };

        let encoded = tokio::time::timeout(SUBMIT_DEADLINE, session.encode(frame))
            .await
            .unwrap_or_else(|_| Err(EncodeError::PerFrameFailure("encoder stopped accepting input".to_string())));
        match encoded {
            Ok(packets) => {
                self.consecutive_failures = 0;
                out.packets.extend(packets);
            }
            Err(e) => {
                self.consecutive_failures += 1;
                debug!("Encode failure {}/{}: {}", self.consecutive_failures, self.failure_threshold, e);
                if self.consecutive_failures >= self.failure_threshold {
                    self.consecutive_failures = 0;
                    self.encoder = None;
                    let from = self.selector.active_name().unwrap_or_default();
                    let next = self.selector.fall_back(&frame.data).await;
                    if let Ok(backend) = &next {
                        warn!("⚠️  Encoder fallback {} -> {}: {}", from, backend.name(), e);
                        out.events.push(PipelineEvent::EncoderFallback {
                            from,
                            to: backend.name().to_string(),
                            reason: e,
                        });
                    }
                    self.open_encoder(next, &frame.data, out).await;
                }
            }
        }
    }

    /// 打开选定的编码器；启动失败则继续回退
    async fn open_encoder(
        &mut self,
        mut selected: Result<Arc<dyn EncoderBackend>, EncodeError>,
        test_frame: &Bytes,
        out: &mut PipelineOutput,
    ) {
        loop {
            match selected {
                Ok(backend) => match backend.open(self.rate_hint).await {
                    Ok(session) => {
                        info!("✓ H.264 encoder active: {}", backend.name());
                        self.encoder = Some(session);
                        out.events
                            .push(PipelineEvent::EncoderSelected(backend.name().to_string()));
                        return;
                    }
                    Err(e) => {
                        selected = self.selector.fall_back(test_frame).await;
                        if let Ok(next) = &selected {
                            warn!("⚠️  Encoder fallback {} -> {}: {}", backend.name(), next.name(), e);
                            out.events.push(PipelineEvent::EncoderFallback {
                                from: backend.name().to_string(),
                                to: next.name().to_string(),
                                reason: e,
                            });
                        }
                    }
                },
                Err(e) => {
                    warn!("⚠️  H.264 output unavailable: {}", e);
                    self.encoder_unavailable = true;
                    out.events.push(PipelineEvent::EncoderUnavailable(e));
                    return;
                }
            }
        }
    }
}

async fn next_image(decoder: &mut Option<Box<dyn FrameDecoder>>) -> Result<Bytes, StreamError> {
    match decoder.as_mut() {
        Some(decoder) => match decoder.next_image().await {
            Some(result) => result,
            None => Err(StreamError::DecodeFailure("decoder exited".to_string())),
        },
        None => std::future::pending().await,
    }
}

async fn next_packet(encoder: &mut Option<Box<dyn EncoderSession>>) -> Result<EncodedPacket, EncodeError> {
    match encoder.as_mut() {
        Some(session) => session.next_packet().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::tests::access_unit;
    use crate::codec::jpeg::tests::tiny_jpeg;
    use crate::encoder::candidate::tests::ScriptedBackend;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// 每提交一个包就产出一张固定图像
    struct LoopbackDecoder {
        tx: mpsc::UnboundedSender<Result<Bytes, StreamError>>,
        rx: mpsc::UnboundedReceiver<Result<Bytes, StreamError>>,
    }

    #[async_trait]
    impl FrameDecoder for LoopbackDecoder {
        async fn submit(&mut self, _packet: &EncodedPacket) -> Result<(), StreamError> {
            let _ = self.tx.send(Ok(tiny_jpeg(1280, 720)));
            Ok(())
        }

        async fn next_image(&mut self) -> Option<Result<Bytes, StreamError>> {
            self.rx.recv().await
        }
    }

    struct LoopbackFactory;

    impl DecoderFactory for LoopbackFactory {
        fn spawn(&self) -> Result<Box<dyn FrameDecoder>, StreamError> {
            let (tx, rx) = mpsc::unbounded_channel();
            Ok(Box::new(LoopbackDecoder { tx, rx }))
        }
    }

    /// 每帧都编码失败的会话
    struct BrokenSession;

    #[async_trait]
    impl EncoderSession for BrokenSession {
        async fn encode(&mut self, _frame: &MediaFrame) -> Result<Vec<EncodedPacket>, EncodeError> {
            Err(EncodeError::PerFrameFailure("device busy".into()))
        }
    }

    struct FlakyBackend;

    #[async_trait]
    impl EncoderBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn probe(&self, _test_frame: &Bytes) -> Result<Bytes, EncodeError> {
            Ok(access_unit(true, true))
        }

        async fn open(&self, _rate_hint: f64) -> Result<Box<dyn EncoderSession>, EncodeError> {
            Ok(Box::new(BrokenSession))
        }
    }

    /// 永远不接收输入的解码器
    struct StuckDecoder;

    #[async_trait]
    impl FrameDecoder for StuckDecoder {
        async fn submit(&mut self, _packet: &EncodedPacket) -> Result<(), StreamError> {
            std::future::pending().await
        }

        async fn next_image(&mut self) -> Option<Result<Bytes, StreamError>> {
            std::future::pending().await
        }
    }

    struct StuckFactory;

    impl DecoderFactory for StuckFactory {
        fn spawn(&self) -> Result<Box<dyn FrameDecoder>, StreamError> {
            Ok(Box::new(StuckDecoder))
        }
    }

    /// 永远不接收输入的编码会话
    struct StuckSession;

    #[async_trait]
    impl EncoderSession for StuckSession {
        async fn encode(&mut self, _frame: &MediaFrame) -> Result<Vec<EncodedPacket>, EncodeError> {
            std::future::pending().await
        }
    }

    struct StuckBackend;

    #[async_trait]
    impl EncoderBackend for StuckBackend {
        fn name(&self) -> &str {
            "h264_v4l2m2m"
        }

        async fn probe(&self, _test_frame: &Bytes) -> Result<Bytes, EncodeError> {
            Ok(access_unit(true, true))
        }

        async fn open(&self, _rate_hint: f64) -> Result<Box<dyn EncoderSession>, EncodeError> {
            Ok(Box::new(StuckSession))
        }
    }

    /// 编码结果只通过 next_packet 异步送达的会话
    struct DeferredSession {
        ready: VecDeque<u64>,
    }

    #[async_trait]
    impl EncoderSession for DeferredSession {
        async fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedPacket>, EncodeError> {
            self.ready.push_back(frame.timestamp_ms);
            Ok(Vec::new())
        }

        async fn next_packet(&mut self) -> Result<EncodedPacket, EncodeError> {
            match self.ready.pop_front() {
                Some(timestamp_ms) => Ok(EncodedPacket {
                    data: access_unit(true, true),
                    timestamp_ms,
                    keyframe: true,
                    parameter_sets: None,
                    discontinuity: false,
                }),
                None => std::future::pending().await,
            }
        }
    }

    struct DeferredBackend;

    #[async_trait]
    impl EncoderBackend for DeferredBackend {
        fn name(&self) -> &str {
            "libx264"
        }

        async fn probe(&self, _test_frame: &Bytes) -> Result<Bytes, EncodeError> {
            Ok(access_unit(true, true))
        }

        async fn open(&self, _rate_hint: f64) -> Result<Box<dyn EncoderSession>, EncodeError> {
            Ok(Box::new(DeferredSession { ready: VecDeque::new() }))
        }
    }

    async fn decoded(pipeline: &mut EncoderPipeline) -> Bytes {
        match pipeline.next_produced().await {
            Produced::Image(image) => image.unwrap(),
            other => panic!("expected a decoded image, got {:?}", other),
        }
    }

    fn keyframe_packet() -> EncodedPacket {
        EncodedPacket {
            data: access_unit(true, true),
            timestamp_ms: 0,
            keyframe: true,
            parameter_sets: None,
            discontinuity: false,
        }
    }

    #[test]
    fn test_output_mode_for_device() {
        let mut device = DeviceConfig::new("p1", "10.0.0.2");
        assert_eq!(H264Output::for_device(&device), H264Output::Passthrough);
        device.transcode_h264 = true;
        assert_eq!(H264Output::for_device(&device), H264Output::Transcode);
        device.stream_mode = StreamMode::Mjpeg;
        device.transcode_h264 = false;
        assert_eq!(H264Output::for_device(&device), H264Output::Transcode);
        device.h264_output = false;
        assert_eq!(H264Output::for_device(&device), H264Output::Disabled);
    }

    #[tokio::test]
    async fn test_passthrough_shares_timestamps_with_decoded_frames() {
        let state = PipelineState::new(Vec::new());
        let mut pipeline = EncoderPipeline::new(H264Output::Passthrough, state, Arc::new(LoopbackFactory), 5);

        let out = pipeline.ingest(IngestFrame::H264(keyframe_packet())).await.unwrap();
        assert_eq!(out.packets.len(), 1);
        assert!(out.frames.is_empty());
        let packet_ts = out.packets[0].timestamp_ms;

        let image = decoded(&mut pipeline).await;
        let out = pipeline.on_decoded(image).await;
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].timestamp_ms, packet_ts);
        assert_eq!(out.events, vec![PipelineEvent::Dimensions(1280, 720)]);
        assert_eq!(pipeline.active_encoder().as_deref(), Some("passthrough"));
    }

    #[tokio::test]
    async fn test_sequence_continues_across_rebuild() {
        let state = PipelineState::new(Vec::new());
        let mut pipeline = EncoderPipeline::new(H264Output::Disabled, state, Arc::new(LoopbackFactory), 5);
        let first = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(64, 48))).await.unwrap();

        let state = pipeline.into_state();
        let mut pipeline = EncoderPipeline::new(H264Output::Disabled, state, Arc::new(LoopbackFactory), 5);
        let second = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(64, 48))).await.unwrap();

        assert!(second.frames[0].sequence > first.frames[0].sequence);
        assert!(second.frames[0].timestamp_ms >= first.frames[0].timestamp_ms);
        assert!(second.packets.is_empty());
    }

    #[tokio::test]
    async fn test_transcode_selects_encoder() {
        let backends: Vec<Arc<dyn EncoderBackend>> = vec![
            ScriptedBackend::new("h264_rkmpp", Ok(Bytes::new())),
            ScriptedBackend::new("libx264", Ok(access_unit(true, true))),
        ];
        let mut pipeline = EncoderPipeline::new(
            H264Output::Transcode,
            PipelineState::new(backends),
            Arc::new(LoopbackFactory),
            5,
        );

        let out = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.packets.len(), 1);
        assert!(out.events.contains(&PipelineEvent::EncoderSelected("libx264".to_string())));
        assert_eq!(pipeline.active_encoder().as_deref(), Some("libx264"));
    }

    #[tokio::test]
    async fn test_fallback_after_failure_threshold() {
        let backends: Vec<Arc<dyn EncoderBackend>> = vec![
            Arc::new(FlakyBackend),
            ScriptedBackend::new("libx264", Ok(access_unit(true, true))),
        ];
        let mut pipeline = EncoderPipeline::new(
            H264Output::Transcode,
            PipelineState::new(backends),
            Arc::new(LoopbackFactory),
            3,
        );

        let mut events = Vec::new();
        for _ in 0..3 {
            let out = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();
            // JPEG输出不受编码失败影响
            assert_eq!(out.frames.len(), 1);
            events.extend(out.events);
        }

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::EncoderFallback { from, to, .. } if from == "flaky" && to == "libx264"
        )));
        assert_eq!(pipeline.active_encoder().as_deref(), Some("libx264"));

        let out = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();
        assert_eq!(out.packets.len(), 1);
    }

    #[tokio::test]
    async fn test_no_functional_encoder_keeps_jpeg_flowing() {
        let backends: Vec<Arc<dyn EncoderBackend>> =
            vec![ScriptedBackend::new("h264_vaapi", Err(EncodeError::InitFailure("no device".into())))];
        let mut pipeline = EncoderPipeline::new(
            H264Output::Transcode,
            PipelineState::new(backends),
            Arc::new(LoopbackFactory),
            5,
        );

        let out = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();
        assert_eq!(out.frames.len(), 1);
        assert!(out.packets.is_empty());
        assert!(matches!(out.events.last(), Some(PipelineEvent::EncoderUnavailable(_))));

        let out = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();
        assert_eq!(out.frames.len(), 1);
        assert!(out.events.is_empty());
    }

    #[tokio::test]
    async fn test_decoded_frames_keep_source_receipt_time() {
        let state = PipelineState::new(Vec::new());
        let mut pipeline = EncoderPipeline::new(H264Output::Passthrough, state, Arc::new(LoopbackFactory), 5);

        let first = pipeline.ingest(IngestFrame::H264(keyframe_packet())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = pipeline.ingest(IngestFrame::H264(keyframe_packet())).await.unwrap();
        let first_ts = first.packets[0].timestamp_ms;
        let second_ts = second.packets[0].timestamp_ms;
        assert!(second_ts > first_ts);

        // 解码滞后：两个包都提交之后才取出第一张图像
        let image = decoded(&mut pipeline).await;
        let out = pipeline.on_decoded(image).await;
        assert_eq!(out.frames[0].timestamp_ms, first_ts);

        let image = decoded(&mut pipeline).await;
        let out = pipeline.on_decoded(image).await;
        assert_eq!(out.frames[0].timestamp_ms, second_ts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_decoder_fails_instead_of_blocking() {
        let state = PipelineState::new(Vec::new());
        let mut pipeline = EncoderPipeline::new(H264Output::Passthrough, state, Arc::new(StuckFactory), 5);

        let result = pipeline.ingest(IngestFrame::H264(keyframe_packet())).await;
        assert!(matches!(result, Err(StreamError::DecodeFailure(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_encoder_counts_toward_fallback() {
        let backends: Vec<Arc<dyn EncoderBackend>> = vec![
            Arc::new(StuckBackend),
            ScriptedBackend::new("libx264", Ok(access_unit(true, true))),
        ];
        let mut pipeline = EncoderPipeline::new(
            H264Output::Transcode,
            PipelineState::new(backends),
            Arc::new(LoopbackFactory),
            2,
        );

        let mut events = Vec::new();
        for _ in 0..2 {
            let out = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();
            assert_eq!(out.frames.len(), 1);
            events.extend(out.events);
        }

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::EncoderFallback { from, to, .. } if from == "h264_v4l2m2m" && to == "libx264"
        )));
        assert_eq!(pipeline.active_encoder().as_deref(), Some("libx264"));
    }

    #[tokio::test]
    async fn test_encoder_output_delivered_between_frames() {
        let backends: Vec<Arc<dyn EncoderBackend>> = vec![Arc::new(DeferredBackend)];
        let mut pipeline = EncoderPipeline::new(
            H264Output::Transcode,
            PipelineState::new(backends),
            Arc::new(LoopbackFactory),
            5,
        );

        let out = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();
        assert!(out.packets.is_empty());
        let frame_ts = out.frames[0].timestamp_ms;

        // 不需要等下一帧提交
        match pipeline.next_produced().await {
            Produced::Packet(Ok(packet)) => assert_eq!(packet.timestamp_ms, frame_ts),
            other => panic!("expected an encoded packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_encoder_output_error_reopens_session() {
        let backends: Vec<Arc<dyn EncoderBackend>> = vec![Arc::new(DeferredBackend)];
        let mut pipeline = EncoderPipeline::new(
            H264Output::Transcode,
            PipelineState::new(backends),
            Arc::new(LoopbackFactory),
            5,
        );
        pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();

        pipeline.on_encoder_error(EncodeError::PerFrameFailure("libx264 process exited".into()));
        let out = pipeline.ingest(IngestFrame::Jpeg(tiny_jpeg(640, 480))).await.unwrap();
        assert!(out.events.contains(&PipelineEvent::EncoderSelected("libx264".to_string())));
        assert_eq!(pipeline.active_encoder().as_deref(), Some("libx264"));
    }
}
