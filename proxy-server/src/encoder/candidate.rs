// H.264编码候选与选择
//
// 候选按固定优先顺序排列（硬件优先，libx264兜底）。每个候选必须用一帧真实
// 图像完成往返验证才会被标记为可用；会话内第一个可用的候选被冻结为当前编码器，
// 只有连续失败超过阈值时才回退到下一个。

use async_trait::async_trait;
use bytes::Bytes;
use common::{EncodeError, EncodedPacket, MediaFrame};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::codec::h264;
use crate::config::EncoderConfig;

/// 编码器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EncoderKind {
    Rkmpp,
    V4l2m2m,
    Vaapi,
    Qsv,
    Nvenc,
    Libx264,
}

impl EncoderKind {
    /// 默认优先顺序
    pub const ALL: [EncoderKind; 6] = [
        EncoderKind::Rkmpp,
        EncoderKind::V4l2m2m,
        EncoderKind::Vaapi,
        EncoderKind::Qsv,
        EncoderKind::Nvenc,
        EncoderKind::Libx264,
    ];

    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            EncoderKind::Rkmpp => "h264_rkmpp",
            EncoderKind::V4l2m2m => "h264_v4l2m2m",
            EncoderKind::Vaapi => "h264_vaapi",
            EncoderKind::Qsv => "h264_qsv",
            EncoderKind::Nvenc => "h264_nvenc",
            EncoderKind::Libx264 => "libx264",
        }
    }

    pub fn from_ffmpeg_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.ffmpeg_name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, EncoderKind::Libx264)
    }

    /// 输入前的全局参数（硬件设备初始化）
    pub fn input_args(&self) -> Vec<String> {
        match self {
            EncoderKind::Vaapi => vec!["-vaapi_device".to_string(), "/dev/dri/renderD128".to_string()],
            _ => Vec::new(),
        }
    }

    /// 编码参数：无B帧、零前瞻
    pub fn output_args(&self, config: &EncoderConfig) -> Vec<String> {
        let gop = config.gop.to_string();
        let bitrate = format!("{}k", config.bitrate_kbps);
        let args: Vec<&str> = match self {
            EncoderKind::Libx264 => vec![
                "-c:v", "libx264",
                "-preset", "veryfast",
                "-tune", "zerolatency",
                "-x264-params", "rc-lookahead=0:sync-lookahead=0:bframes=0:repeat-headers=1",
                "-crf", "23",
                "-maxrate", &bitrate,
                "-bufsize", &bitrate,
                "-pix_fmt", "yuv420p",
                "-g", &gop,
            ],
            EncoderKind::Rkmpp => vec![
                "-c:v", "h264_rkmpp",
                "-rc_mode", "CQP",
                "-qp_init", "24",
                "-pix_fmt", "nv12",
                "-bf", "0",
                "-g", &gop,
            ],
            EncoderKind::V4l2m2m => vec![
                "-c:v", "h264_v4l2m2m",
                "-pix_fmt", "yuv420p",
                "-b:v", &bitrate,
                "-bf", "0",
                "-g", &gop,
            ],
            EncoderKind::Vaapi => vec![
                "-vf", "format=nv12,hwupload",
                "-c:v", "h264_vaapi",
                "-qp", "24",
                "-bf", "0",
                "-g", &gop,
            ],
            EncoderKind::Qsv => vec![
                "-c:v", "h264_qsv",
                "-pix_fmt", "nv12",
                "-look_ahead", "0",
                "-async_depth", "1",
                "-global_quality", "24",
                "-bf", "0",
                "-g", &gop,
            ],
            EncoderKind::Nvenc => vec![
                "-c:v", "h264_nvenc",
                "-preset", "p1",
                "-tune", "ull",
                "-zerolatency", "1",
                "-rc-lookahead", "0",
                "-delay", "0",
                "-cq", "24",
                "-bf", "0",
                "-g", &gop,
            ],
        };
        args.into_iter().map(str::to_string).collect()
    }
}

/// 编码器后端：先探测，再使用
#[async_trait]
pub trait EncoderBackend: Send + Sync {
    fn name(&self) -> &str;

    /// 用一帧JPEG做往返测试，返回原始Annex-B输出
    async fn probe(&self, test_frame: &Bytes) -> Result<Bytes, EncodeError>;

    /// 启动持续编码会话
    async fn open(&self, rate_hint: f64) -> Result<Box<dyn EncoderSession>, EncodeError>;
}

/// 持续编码会话
#[async_trait]
pub trait EncoderSession: Send {
    /// 提交一帧，返回目前已产出的访问单元
    ///
    /// 不能因为编码进程不读输入而阻塞：输入积压时返回 `PerFrameFailure`。
    async fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedPacket>, EncodeError>;

    /// 等待编码进程在两次提交之间异步产出的访问单元（取消安全）
    ///
    /// 同步产出全部输出的会话保持默认实现，永远挂起。
    async fn next_packet(&mut self) -> Result<EncodedPacket, EncodeError> {
        std::future::pending().await
    }
}

/// 探测输出必须非空，且包含SPS、PPS和IDR
pub fn verify_probe_output(name: &str, output: &[u8]) -> Result<(), EncodeError> {
    if output.is_empty() {
        return Err(EncodeError::NonFunctionalEncoder(format!("{} produced empty output", name)));
    }
    let info = h264::inspect(output);
    let mut missing = Vec::new();
    if info.sps.is_none() {
        missing.push("SPS");
    }
    if info.pps.is_none() {
        missing.push("PPS");
    }
    if !info.keyframe {
        missing.push("IDR");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EncodeError::NonFunctionalEncoder(format!(
            "{} output lacks {}",
            name,
            missing.join("/")
        )))
    }
}

/// 候选及其验证结果
pub struct EncoderCandidate {
    backend: Arc<dyn EncoderBackend>,
    /// None表示尚未探测
    functional: Option<bool>,
}

impl EncoderCandidate {
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn functional(&self) -> Option<bool> {
        self.functional
    }
}

/// 编码器选择器（会话内至多一个活动候选）
pub struct EncoderSelector {
    candidates: Vec<EncoderCandidate>,
    active: Option<usize>,
}

impl EncoderSelector {
    pub fn new(backends: Vec<Arc<dyn EncoderBackend>>) -> Self {
        Self {
            candidates: backends
                .into_iter()
                .map(|backend| EncoderCandidate {
                    backend,
                    functional: None,
                })
                .collect(),
            active: None,
        }
    }

    pub fn candidates(&self) -> &[EncoderCandidate] {
        &self.candidates
    }

    pub fn active(&self) -> Option<Arc<dyn EncoderBackend>> {
        self.active.map(|i| self.candidates[i].backend.clone())
    }

    pub fn active_name(&self) -> Option<String> {
        self.active.map(|i| self.candidates[i].name().to_string())
    }

    /// 返回当前编码器；尚未选定时按顺序探测
    pub async fn select(&mut self, test_frame: &Bytes) -> Result<Arc<dyn EncoderBackend>, EncodeError> {
        if let Some(backend) = self.active() {
            return Ok(backend);
        }
        self.search_from(0, test_frame).await
    }

    /// 当前编码器失效，回退到下一个可用候选
    pub async fn fall_back(&mut self, test_frame: &Bytes) -> Result<Arc<dyn EncoderBackend>, EncodeError> {
        let start = match self.active.take() {
            Some(i) => {
                self.candidates[i].functional = Some(false);
                i + 1
            }
            None => 0,
        };
        self.search_from(start, test_frame).await
    }

    /// 清除所有探测结果，下次使用时重新探测
    pub fn reprobe(&mut self) {
        for candidate in &mut self.candidates {
            candidate.functional = None;
        }
        self.active = None;
    }

    async fn search_from(
        &mut self,
        start: usize,
        test_frame: &Bytes,
    ) -> Result<Arc<dyn EncoderBackend>, EncodeError> {
        for index in start..self.candidates.len() {
            let candidate = &mut self.candidates[index];
            if candidate.functional.is_none() {
                let verdict = match candidate.backend.probe(test_frame).await {
                    Ok(output) => verify_probe_output(candidate.backend.name(), &output),
                    Err(e) => Err(e),
                };
                match verdict {
                    Ok(()) => {
                        info!("✓ Encoder {} verified", candidate.name());
                        candidate.functional = Some(true);
                    }
                    Err(e) => {
                        warn!("⚠️  Encoder {} rejected: {}", candidate.name(), e);
                        candidate.functional = Some(false);
                    }
                }
            }

            if candidate.functional == Some(true) {
                self.active = Some(index);
                return Ok(candidate.backend.clone());
            }
        }

        Err(EncodeError::NonFunctionalEncoder(
            "no functional H.264 encoder available".to_string(),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::h264::tests::access_unit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 测试用编码器：按预设结果响应探测
    pub struct ScriptedBackend {
        pub name: String,
        pub probe_output: Result<Bytes, EncodeError>,
        pub probes: AtomicUsize,
    }

    impl ScriptedBackend {
        pub fn new(name: &str, probe_output: Result<Bytes, EncodeError>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                probe_output,
                probes: AtomicUsize::new(0),
            })
        }
    }

    pub struct EchoSession;

    #[async_trait]
    impl EncoderSession for EchoSession {
        async fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedPacket>, EncodeError> {
            Ok(vec![EncodedPacket {
                data: access_unit(true, true),
                timestamp_ms: frame.timestamp_ms,
                keyframe: true,
                parameter_sets: None,
                discontinuity: false,
            }])
        }
    }

    #[async_trait]
    impl EncoderBackend for ScriptedBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn probe(&self, _test_frame: &Bytes) -> Result<Bytes, EncodeError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.probe_output.clone()
        }

        async fn open(&self, _rate_hint: f64) -> Result<Box<dyn EncoderSession>, EncodeError> {
            Ok(Box::new(EchoSession))
        }
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EncoderKind::ALL {
            assert_eq!(EncoderKind::from_ffmpeg_name(kind.ffmpeg_name()), Some(kind));
        }
        assert!(EncoderKind::from_ffmpeg_name("mpeg4").is_none());
        assert!(!EncoderKind::Libx264.is_hardware());
    }

    #[test]
    fn test_verify_probe_output() {
        assert!(verify_probe_output("x", &[]).is_err());
        // 只有P帧
        assert!(verify_probe_output("x", &access_unit(false, false)).is_err());
        // 缺少参数集的IDR
        assert!(verify_probe_output("x", &access_unit(true, false)).is_err());
        assert!(verify_probe_output("x", &access_unit(true, true)).is_ok());
    }

    #[tokio::test]
    async fn test_empty_or_undecodable_output_never_selected() {
        let empty = ScriptedBackend::new("empty", Ok(Bytes::new()));
        let garbage = ScriptedBackend::new("garbage", Ok(Bytes::from_static(b"\x00\x00\x01\x09\xf0")));
        let broken = ScriptedBackend::new("broken", Err(EncodeError::InitFailure("no device".into())));
        let good = ScriptedBackend::new("good", Ok(access_unit(true, true)));

        let mut selector = EncoderSelector::new(vec![
            empty.clone(),
            garbage.clone(),
            broken.clone(),
            good.clone(),
        ]);
        let frame = Bytes::from_static(b"jpeg");

        let chosen = selector.select(&frame).await.unwrap();
        assert_eq!(chosen.name(), "good");
        assert_eq!(selector.active_name().as_deref(), Some("good"));

        // 冻结：再次选择不会重新探测
        selector.select(&frame).await.unwrap();
        assert_eq!(good.probes.load(Ordering::SeqCst), 1);
        assert_eq!(empty.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fall_back_to_next_functional() {
        let first = ScriptedBackend::new("first", Ok(access_unit(true, true)));
        let second = ScriptedBackend::new("second", Ok(access_unit(true, true)));
        let mut selector = EncoderSelector::new(vec![first.clone(), second.clone()]);
        let frame = Bytes::from_static(b"jpeg");

        assert_eq!(selector.select(&frame).await.unwrap().name(), "first");
        assert_eq!(selector.fall_back(&frame).await.unwrap().name(), "second");
        // 最后一个也失效时没有可用编码器
        assert!(matches!(
            selector.fall_back(&frame).await,
            Err(EncodeError::NonFunctionalEncoder(_))
        ));
        assert!(selector.active_name().is_none());
        assert_eq!(selector.candidates()[0].functional(), Some(false));
    }
}
