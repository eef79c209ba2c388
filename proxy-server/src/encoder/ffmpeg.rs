// ffmpeg进程封装
//
// 解码（H.264 -> MJPEG）和编码（MJPEG -> H.264）都通过ffmpeg子进程完成：
// 写入任务从有界通道取数据写入stdin，读取任务读取stdout并切分成帧。
// 提交方只做 try_send，子进程停止读取输入时提交立即失败。子进程设置 kill_on_drop，
// 后台任务挂在 AbortOnDrop 上，对象被丢弃时一并清理。

use async_trait::async_trait;
use bytes::Bytes;
use common::{EncodeError, EncodedPacket, MediaFrame, StreamError};
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::candidate::{EncoderBackend, EncoderKind, EncoderSession};
use super::{DecoderFactory, FrameDecoder};
use crate::codec::{AccessUnitSplitter, JpegScanner, ParameterSetGate};
use crate::config::EncoderConfig;
use crate::task::AbortOnDrop;

/// 编码器多少帧没有输出视为失效
const MAX_PENDING_FRAMES: usize = 30;

/// 解码器stdin前最多积压的访问单元
const DECODER_INPUT_DEPTH: usize = 32;

/// 编码器stdin前最多积压的JPEG帧
const ENCODER_INPUT_DEPTH: usize = 4;

struct SpawnedProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr_task: AbortOnDrop,
}

fn spawn_ffmpeg(ffmpeg: &Path, args: &[String], label: &str) -> std::io::Result<SpawnedProcess> {
    let mut command = Command::new(ffmpeg);
    command
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Starting FFmpeg ({}): {:?}", label, command);
    let mut child = command.spawn()?;

    let missing = |name: &str| std::io::Error::new(std::io::ErrorKind::Other, format!("FFmpeg {} not captured", name));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    // 错误日志监控
    let label = label.to_string();
    let stderr_task = AbortOnDrop::new(tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buffer = Vec::new();
        while let Ok(n) = reader.read_buf(&mut buffer).await {
            if n == 0 {
                break;
            }
            let output = String::from_utf8_lossy(&buffer);
            if !output.trim().is_empty() {
                warn!("FFmpeg stderr ({}): {}", label, output.trim());
            }
            buffer.clear();
        }
    }));

    Ok(SpawnedProcess {
        child,
        stdin,
        stdout,
        stderr_task,
    })
}

/// 启动stdin写入任务
fn spawn_writer(mut stdin: ChildStdin, depth: usize, label: &str) -> (mpsc::Sender<Bytes>, AbortOnDrop) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(depth);
    let label = label.to_string();
    let task = AbortOnDrop::new(tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            let write = async {
                stdin.write_all(&data).await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                debug!("FFmpeg stdin closed ({}): {}", label, e);
                break;
            }
        }
    }));
    (tx, task)
}

/// ffmpeg H.264 -> MJPEG 解码器
pub struct FfmpegDecoder {
    _child: Child,
    input: mpsc::Sender<Bytes>,
    images: mpsc::Receiver<Result<Bytes, StreamError>>,
    _writer: AbortOnDrop,
    _reader: AbortOnDrop,
    _stderr: AbortOnDrop,
}

impl FfmpegDecoder {
    pub fn spawn(config: &EncoderConfig) -> Result<Self, StreamError> {
        let args: Vec<String> = [
            "-fflags", "nobuffer",
            "-flags", "low_delay",
            "-probesize", "32",
            "-analyzeduration", "0",
            "-f", "h264",
            "-i", "pipe:0",
            "-an",
            "-vsync", "0",
            "-c:v", "mjpeg",
            "-q:v",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            config.jpeg_quality.to_string(),
            "-f".to_string(),
            "image2pipe".to_string(),
            "pipe:1".to_string(),
        ])
        .collect();

        let process = spawn_ffmpeg(&config.ffmpeg_path, &args, "decoder")
            .map_err(|e| StreamError::DecodeFailure(format!("Failed to start FFmpeg decoder: {}", e)))?;

        let (tx, rx) = mpsc::channel(8);
        let mut stdout = process.stdout;
        let reader = AbortOnDrop::new(tokio::spawn(async move {
            let mut scanner = JpegScanner::new();
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut buffer).await {
                    Ok(0) => {
                        let _ = tx
                            .send(Err(StreamError::DecodeFailure("decoder process exited".to_string())))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        scanner.push(&buffer[..n]);
                        while let Some(image) = scanner.next_frame() {
                            if tx.send(Ok(image)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(StreamError::DecodeFailure(e.to_string()))).await;
                        break;
                    }
                }
            }
        }));

        let (input, writer) = spawn_writer(process.stdin, DECODER_INPUT_DEPTH, "decoder");

        info!("✓ FFmpeg decoder started");
        Ok(Self {
            _child: process.child,
            input,
            images: rx,
            _writer: writer,
            _reader: reader,
            _stderr: process.stderr_task,
        })
    }
}

#[async_trait]
impl FrameDecoder for FfmpegDecoder {
    async fn submit(&mut self, packet: &EncodedPacket) -> Result<(), StreamError> {
        self.input.try_send(packet.data.clone()).map_err(|e| match e {
            TrySendError::Full(_) => StreamError::DecodeFailure("decoder is not consuming input".to_string()),
            TrySendError::Closed(_) => StreamError::DecodeFailure("decoder input closed".to_string()),
        })
    }

    async fn next_image(&mut self) -> Option<Result<Bytes, StreamError>> {
        self.images.recv().await
    }
}

/// ffmpeg解码器工厂
pub struct FfmpegDecoderFactory {
    config: EncoderConfig,
}

impl FfmpegDecoderFactory {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }
}

impl DecoderFactory for FfmpegDecoderFactory {
    fn spawn(&self) -> Result<Box<dyn FrameDecoder>, StreamError> {
        Ok(Box::new(FfmpegDecoder::spawn(&self.config)?))
    }
}

/// 基于ffmpeg的H.264编码候选
pub struct FfmpegEncoderBackend {
    kind: EncoderKind,
    config: EncoderConfig,
}

impl FfmpegEncoderBackend {
    pub fn new(kind: EncoderKind, config: EncoderConfig) -> Self {
        Self { kind, config }
    }

    fn args(&self, rate_hint: f64, single_frame: bool) -> Vec<String> {
        let framerate = if rate_hint.is_finite() && rate_hint >= 1.0 {
            format!("{:.2}", rate_hint)
        } else {
            "15".to_string()
        };

        let mut args: Vec<String> = self.kind.input_args();
        args.extend(
            ["-f", "mjpeg", "-framerate", framerate.as_str(), "-i", "pipe:0", "-an"]
                .iter()
                .map(|s| s.to_string()),
        );
        if single_frame {
            args.extend(["-frames:v".to_string(), "1".to_string()]);
        }
        args.extend(self.kind.output_args(&self.config));
        args.extend(
            ["-flush_packets", "1", "-f", "h264", "pipe:1"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

#[async_trait]
impl EncoderBackend for FfmpegEncoderBackend {
    fn name(&self) -> &str {
        self.kind.ffmpeg_name()
    }

    async fn probe(&self, test_frame: &Bytes) -> Result<Bytes, EncodeError> {
        let args = self.args(15.0, true);
        let mut process = spawn_ffmpeg(&self.config.ffmpeg_path, &args, self.name())
            .map_err(|e| EncodeError::InitFailure(format!("{}: {}", self.name(), e)))?;

        let frame = test_frame.clone();
        let mut stdin = process.stdin;
        let writer = tokio::spawn(async move {
            let _ = stdin.write_all(&frame).await;
            // 关闭stdin让编码器刷新输出
            drop(stdin);
        });

        let mut output = Vec::new();
        let read = tokio::time::timeout(self.config.probe_timeout, process.stdout.read_to_end(&mut output)).await;
        writer.abort();
        let _ = process.child.start_kill();

        match read {
            Ok(Ok(_)) => Ok(Bytes::from(output)),
            Ok(Err(e)) => Err(EncodeError::InitFailure(format!("{}: {}", self.name(), e))),
            Err(_) => Err(EncodeError::NonFunctionalEncoder(format!(
                "{} produced no output within {:?}",
                self.name(),
                self.config.probe_timeout
            ))),
        }
    }

    async fn open(&self, rate_hint: f64) -> Result<Box<dyn EncoderSession>, EncodeError> {
        let args = self.args(rate_hint, false);
        let process = spawn_ffmpeg(&self.config.ffmpeg_path, &args, self.name())
            .map_err(|e| EncodeError::InitFailure(format!("{}: {}", self.name(), e)))?;

        let (tx, rx) = mpsc::channel(64);
        let mut stdout = process.stdout;
        let reader = AbortOnDrop::new(tokio::spawn(async move {
            let mut splitter = AccessUnitSplitter::new();
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for unit in splitter.push(&buffer[..n]) {
                            if tx.send(unit).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }));

        let (input, writer) = spawn_writer(process.stdin, ENCODER_INPUT_DEPTH, self.name());

        info!("✓ Encoder {} started ({:.1} fps hint)", self.name(), rate_hint);
        Ok(Box::new(FfmpegEncoderSession {
            name: self.name().to_string(),
            _child: process.child,
            input,
            output: rx,
            pending: VecDeque::new(),
            gate: ParameterSetGate::new(),
            last_timestamp: 0,
            _writer: writer,
            _reader: reader,
            _stderr: process.stderr_task,
        }))
    }
}

/// 运行中的编码进程
struct FfmpegEncoderSession {
    name: String,
    _child: Child,
    input: mpsc::Sender<Bytes>,
    output: mpsc::Receiver<Bytes>,
    /// 待输出帧的接收时间戳（零前瞻编码器一进一出）
    pending: VecDeque<u64>,
    gate: ParameterSetGate,
    last_timestamp: u64,
    _writer: AbortOnDrop,
    _reader: AbortOnDrop,
    _stderr: AbortOnDrop,
}

impl FfmpegEncoderSession {
    /// 为编码器输出的访问单元配上对应输入帧的时间戳
    fn admit(&mut self, unit: Bytes) -> Option<EncodedPacket> {
        let timestamp = self.pending.pop_front().unwrap_or(self.last_timestamp);
        self.last_timestamp = timestamp;
        self.gate.admit(unit, timestamp)
    }

    fn exited(&self) -> EncodeError {
        EncodeError::PerFrameFailure(format!("{} process exited", self.name))
    }
}

#[async_trait]
impl EncoderSession for FfmpegEncoderSession {
    async fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedPacket>, EncodeError> {
        self.input.try_send(frame.data.clone()).map_err(|e| match e {
            TrySendError::Full(_) => {
                EncodeError::PerFrameFailure(format!("{} is not consuming input", self.name))
            }
            TrySendError::Closed(_) => self.exited(),
        })?;
        self.pending.push_back(frame.timestamp_ms);

        let mut packets = Vec::new();
        loop {
            match self.output.try_recv() {
                Ok(unit) => packets.extend(self.admit(unit)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(self.exited()),
            }
        }

        if self.pending.len() > MAX_PENDING_FRAMES {
            self.pending.clear();
            return Err(EncodeError::PerFrameFailure(format!(
                "{} stopped producing output",
                self.name
            )));
        }
        Ok(packets)
    }

    async fn next_packet(&mut self) -> Result<EncodedPacket, EncodeError> {
        loop {
            let unit = self.output.recv().await.ok_or_else(|| self.exited())?;
            if let Some(packet) = self.admit(unit) {
                return Ok(packet);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// 启动后从不读取stdin的ffmpeg替身
    fn unresponsive_ffmpeg(dir: &Path) -> EncoderConfig {
        let script = dir.join("ffmpeg");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 1000\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        EncoderConfig {
            ffmpeg_path: script,
            ..EncoderConfig::default()
        }
    }

    fn large_frame() -> MediaFrame {
        MediaFrame {
            data: Bytes::from(vec![0u8; 200 * 1024]),
            timestamp_ms: 0,
            sequence: 1,
        }
    }

    #[tokio::test]
    async fn test_unresponsive_encoder_fails_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FfmpegEncoderBackend::new(EncoderKind::Libx264, unresponsive_ffmpeg(dir.path()));
        let mut session = backend.open(15.0).await.unwrap();
        let frame = large_frame();

        let failure = tokio::time::timeout(Duration::from_secs(3), async {
            for _ in 0..32 {
                if let Err(e) = session.encode(&frame).await {
                    return Some(e);
                }
                tokio::task::yield_now().await;
            }
            None
        })
        .await
        .unwrap();

        assert!(matches!(failure, Some(EncodeError::PerFrameFailure(_))));
    }

    #[tokio::test]
    async fn test_unresponsive_decoder_rejects_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = FfmpegDecoder::spawn(&unresponsive_ffmpeg(dir.path())).unwrap();
        let packet = EncodedPacket {
            data: Bytes::from(vec![0u8; 200 * 1024]),
            timestamp_ms: 0,
            keyframe: true,
            parameter_sets: None,
            discontinuity: false,
        };

        let failure = tokio::time::timeout(Duration::from_secs(3), async {
            for _ in 0..64 {
                if let Err(e) = decoder.submit(&packet).await {
                    return Some(e);
                }
                tokio::task::yield_now().await;
            }
            None
        })
        .await
        .unwrap();

        assert!(matches!(failure, Some(StreamError::DecodeFailure(_))));
    }
}
