// LL-HLS分段器（每个会话共享一个）
//
// 样本时长由下一个样本的解码时间决定，因此始终保留一个样本。
// 分段只在关键帧处切分，部分分段按 part_duration 切分，关键帧总是开启新的部分分段。

use bytes::{Bytes, BytesMut};
use common::{EncodedPacket, MuxError};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

use super::fmp4::{Fmp4Sample, Fmp4Writer, TIMESCALE};
use crate::codec::h264::annex_b_to_avcc;
use crate::config::HlsConfig;

/// 相邻样本间隔超过此值视为时间跳变
const MAX_SAMPLE_GAP_TICKS: u64 = 10 * TIMESCALE as u64;
/// 没有参考时的默认样本时长（约30fps）
const DEFAULT_SAMPLE_TICKS: u32 = TIMESCALE / 30;
/// LL-HLS播放列表中列出部分分段的已完成分段数
const PARTS_IN_RECENT_SEGMENTS: usize = 3;

/// 播放列表类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    /// LL-HLS（含部分分段和阻塞刷新）
    LowLatency,
    /// 只含完整分段
    Legacy,
}

#[derive(Debug, Clone)]
struct Part {
    data: Bytes,
    duration: f64,
    independent: bool,
}

#[derive(Debug, Clone)]
struct Segment {
    msn: u64,
    generation: u32,
    duration: f64,
    discontinuity: bool,
    parts: Vec<Part>,
    data: Bytes,
}

#[derive(Debug)]
struct OpenSegment {
    msn: u64,
    generation: u32,
    discontinuity: bool,
    parts: Vec<Part>,
    pending: Vec<Fmp4Sample>,
    pending_start: u64,
    pending_ticks: u64,
    total_ticks: u64,
}

#[derive(Debug)]
struct HeldSample {
    data: Bytes,
    dts: u64,
    keyframe: bool,
}

/// fMP4 LL-HLS 分段器
#[derive(Debug)]
pub struct HlsSegmenter {
    segment_ticks: u64,
    part_ticks: u64,
    part_target: f64,
    window_size: usize,
    writer: Option<Fmp4Writer>,
    generation: u32,
    init_segments: BTreeMap<u32, Bytes>,
    segments: VecDeque<Segment>,
    open: Option<OpenSegment>,
    held: Option<HeldSample>,
    next_msn: u64,
    fragment_sequence: u32,
    base_ms: Option<u64>,
    last_sample_ticks: u32,
    discontinuity_pending: bool,
    discontinuity_sequence: u64,
    max_segment_duration: f64,
}

fn ticks_of(duration: Duration) -> u64 {
    (duration.as_secs_f64() * TIMESCALE as f64).round() as u64
}

impl HlsSegmenter {
    pub fn new(config: &HlsConfig) -> Self {
        Self {
            segment_ticks: ticks_of(config.segment_duration).max(1),
            part_ticks: ticks_of(config.part_duration).max(1),
            part_target: config.part_duration.as_secs_f64(),
            window_size: config.window_size.max(1),
            writer: None,
            generation: 0,
            init_segments: BTreeMap::new(),
            segments: VecDeque::new(),
            open: None,
            held: None,
            next_msn: 0,
            fragment_sequence: 1,
            base_ms: None,
            last_sample_ticks: DEFAULT_SAMPLE_TICKS,
            discontinuity_pending: false,
            discontinuity_sequence: 0,
            max_segment_duration: config.segment_duration.as_secs_f64(),
        }
    }

    /// 写入一个访问单元
    ///
    /// # 返回
    ///
    /// 播放列表或可下载资源是否有变化（用于唤醒阻塞请求）
    pub fn push(&mut self, packet: &EncodedPacket) -> Result<bool, MuxError> {
        let mut changed = false;

        if let Some(params) = &packet.parameter_sets {
            let is_new = self
                .writer
                .as_ref()
                .map_or(true, |writer| writer.parameter_sets() != params);
            if is_new {
                let writer = Fmp4Writer::new(params.clone())?;
                let init = writer.init_segment()?;
                if self.writer.is_some() {
                    self.flush_held();
                    self.close_segment();
                    self.discontinuity_pending = true;
                }
                self.generation += 1;
                self.init_segments.insert(self.generation, init);
                let (width, height) = writer.dimensions();
                info!("✓ HLS init segment generation {} ({}x{})", self.generation, width, height);
                self.writer = Some(writer);
                changed = true;
            }
        } else if packet.discontinuity && self.writer.is_some() {
            self.mark_discontinuity();
            changed = true;
        }

        if self.writer.is_none() {
            return Ok(changed);
        }

        let data = annex_b_to_avcc(&packet.data);
        if data.is_empty() {
            return Err(MuxError::MalformedPacket("access unit without slice data".to_string()));
        }
        let base = *self.base_ms.get_or_insert(packet.timestamp_ms);
        let sample = HeldSample {
            data,
            dts: packet.timestamp_ms.saturating_sub(base) * (TIMESCALE as u64 / 1000),
            keyframe: packet.keyframe,
        };

        if let Some(previous) = self.held.take() {
            let gap = sample.dts.saturating_sub(previous.dts);
            let duration = if gap == 0 || gap > MAX_SAMPLE_GAP_TICKS {
                self.last_sample_ticks
            } else {
                self.last_sample_ticks = gap as u32;
                gap as u32
            };
            changed |= self.commit(previous, duration);
        }
        self.held = Some(sample);
        Ok(changed)
    }

    /// 媒体流中断：结束当前分段，下一个分段带不连续标记
    pub fn mark_discontinuity(&mut self) {
        self.flush_held();
        self.close_segment();
        self.discontinuity_pending = self.generation > 0;
    }

    fn flush_held(&mut self) {
        if let Some(held) = self.held.take() {
            let duration = self.last_sample_ticks;
            self.commit(held, duration);
        }
    }

    fn commit(&mut self, sample: HeldSample, duration: u32) -> bool {
        let mut changed = false;

        if sample.keyframe {
            let segment_full = self
                .open
                .as_ref()
                .is_some_and(|open| open.total_ticks >= self.segment_ticks);
            if segment_full {
                changed |= self.close_segment();
            } else {
                // 关键帧开启新的部分分段
                changed |= self.close_part();
            }
        }

        if self.open.is_none() {
            if !sample.keyframe {
                return changed;
            }
            self.open = Some(OpenSegment {
                msn: self.next_msn,
                generation: self.generation,
                discontinuity: std::mem::take(&mut self.discontinuity_pending),
                parts: Vec::new(),
                pending: Vec::new(),
                pending_start: sample.dts,
                pending_ticks: 0,
                total_ticks: 0,
            });
            self.next_msn += 1;
        }

        let part_ticks = self.part_ticks;
        let Some(open) = self.open.as_mut() else {
            return changed;
        };
        if open.pending.is_empty() {
            open.pending_start = sample.dts;
        }
        open.pending.push(Fmp4Sample {
            data: sample.data,
            duration,
            keyframe: sample.keyframe,
        });
        open.pending_ticks += duration as u64;
        open.total_ticks += duration as u64;

        if open.pending_ticks >= part_ticks {
            changed |= self.close_part();
        }
        changed
    }

    fn close_part(&mut self) -> bool {
        let (Some(writer), Some(open)) = (self.writer.as_ref(), self.open.as_mut()) else {
            return false;
        };
        if open.pending.is_empty() {
            return false;
        }
        let samples = std::mem::take(&mut open.pending);
        let data = writer.fragment(self.fragment_sequence, open.pending_start, &samples);
        self.fragment_sequence = self.fragment_sequence.wrapping_add(1);
        open.parts.push(Part {
            data,
            duration: open.pending_ticks as f64 / TIMESCALE as f64,
            independent: samples[0].keyframe,
        });
        open.pending_ticks = 0;
        true
    }

    fn close_segment(&mut self) -> bool {
        self.close_part();
        let Some(open) = self.open.take() else {
            return false;
        };
        if open.parts.is_empty() {
            return false;
        }

        let mut data = BytesMut::with_capacity(open.parts.iter().map(|p| p.data.len()).sum());
        for part in &open.parts {
            data.extend_from_slice(&part.data);
        }
        let duration = open.total_ticks as f64 / TIMESCALE as f64;
        self.max_segment_duration = self.max_segment_duration.max(duration);
        debug!("HLS segment {} closed ({:.3}s, {} parts)", open.msn, duration, open.parts.len());

        self.segments.push_back(Segment {
            msn: open.msn,
            generation: open.generation,
            duration,
            discontinuity: open.discontinuity,
            parts: open.parts,
            data: data.freeze(),
        });

        while self.segments.len() > self.window_size {
            if let Some(removed) = self.segments.pop_front() {
                if removed.discontinuity {
                    self.discontinuity_sequence += 1;
                }
            }
        }

        // 只保留窗口内引用的初始化分段
        let oldest_generation = self
            .segments
            .front()
            .map_or(self.generation, |segment| segment.generation);
        self.init_segments.retain(|generation, _| *generation >= oldest_generation);
        true
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn init_segment(&self, generation: u32) -> Option<Bytes> {
        self.init_segments.get(&generation).cloned()
    }

    pub fn segment(&self, msn: u64) -> Option<Bytes> {
        self.segments
            .iter()
            .find(|segment| segment.msn == msn)
            .map(|segment| segment.data.clone())
    }

    pub fn part(&self, msn: u64, index: usize) -> Option<Bytes> {
        if let Some(open) = self.open.as_ref().filter(|open| open.msn == msn) {
            return open.parts.get(index).map(|part| part.data.clone());
        }
        self.segments
            .iter()
            .find(|segment| segment.msn == msn)
            .and_then(|segment| segment.parts.get(index))
            .map(|part| part.data.clone())
    }

    /// 该部分分段是否为下一个将要产生的（预加载提示指向的资源）
    pub fn is_upcoming_part(&self, msn: u64, index: usize) -> bool {
        match &self.open {
            Some(open) => open.msn == msn && index == open.parts.len(),
            None => msn == self.next_msn && index == 0,
        }
    }

    /// 阻塞刷新条件：指定的分段（或部分分段）是否已经可用
    pub fn is_ready(&self, msn: u64, part: Option<usize>) -> bool {
        if self.segments.back().is_some_and(|last| msn <= last.msn) {
            return true;
        }
        match (&self.open, part) {
            (Some(open), Some(index)) if open.msn == msn => index < open.parts.len(),
            _ => false,
        }
    }

    /// 生成播放列表；还没有可播放内容时返回None
    pub fn playlist(&self, kind: PlaylistKind) -> Option<String> {
        let open = self.open.as_ref().filter(|open| !open.parts.is_empty());
        let has_content = match kind {
            PlaylistKind::LowLatency => !self.segments.is_empty() || open.is_some(),
            PlaylistKind::Legacy => !self.segments.is_empty(),
        };
        if !has_content {
            return None;
        }

        let first_msn = self
            .segments
            .front()
            .map(|segment| segment.msn)
            .or_else(|| open.map(|open| open.msn))
            .unwrap_or(0);
        let target_duration = self.max_segment_duration.ceil().max(1.0) as u64;

        let mut out = String::new();
        let _ = writeln!(out, "#EXTM3U");
        match kind {
            PlaylistKind::LowLatency => {
                let _ = writeln!(out, "#EXT-X-VERSION:9");
                let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target_duration);
                let _ = writeln!(out, "#EXT-X-PART-INF:PART-TARGET={:.3}", self.part_target);
                let _ = writeln!(
                    out,
                    "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={:.3}",
                    self.part_target * 3.0
                );
            }
            PlaylistKind::Legacy => {
                let _ = writeln!(out, "#EXT-X-VERSION:7");
                let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target_duration);
            }
        }
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", first_msn);
        let _ = writeln!(out, "#EXT-X-DISCONTINUITY-SEQUENCE:{}", self.discontinuity_sequence);

        let mut current_map = None;
        let mut write_header = |out: &mut String, discontinuity: bool, generation: u32| {
            if discontinuity {
                let _ = writeln!(out, "#EXT-X-DISCONTINUITY");
            }
            if current_map != Some(generation) {
                let _ = writeln!(out, "#EXT-X-MAP:URI=\"init-{}.mp4\"", generation);
                current_map = Some(generation);
            }
        };

        let parts_from = self.segments.len().saturating_sub(PARTS_IN_RECENT_SEGMENTS);
        for (index, segment) in self.segments.iter().enumerate() {
            write_header(&mut out, segment.discontinuity, segment.generation);
            if kind == PlaylistKind::LowLatency && index >= parts_from {
                for (i, part) in segment.parts.iter().enumerate() {
                    write_part(&mut out, segment.msn, i, part);
                }
            }
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration);
            let _ = writeln!(out, "seg-{}.m4s", segment.msn);
        }

        if kind == PlaylistKind::LowLatency {
            match open {
                Some(open) => {
                    write_header(&mut out, open.discontinuity, open.generation);
                    for (i, part) in open.parts.iter().enumerate() {
                        write_part(&mut out, open.msn, i, part);
                    }
                    let _ = writeln!(
                        out,
                        "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part-{}-{}.m4s\"",
                        open.msn,
                        open.parts.len()
                    );
                }
                None => {
                    let next = self.open.as_ref().map_or(self.next_msn, |open| open.msn);
                    let _ = writeln!(out, "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part-{}-0.m4s\"", next);
                }
            }
        }

        Some(out)
    }
}

fn write_part(out: &mut String, msn: u64, index: usize, part: &Part) {
    let _ = write!(out, "#EXT-X-PART:DURATION={:.3},URI=\"part-{}-{}.m4s\"", part.duration, msn, index);
    if part.independent {
        let _ = write!(out, ",INDEPENDENT=YES");
    }
    let _ = writeln!(out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::tests::{access_unit, PPS, SPS_720P};
    use common::ParameterSets;

    fn config(window_size: usize) -> HlsConfig {
        HlsConfig {
            segment_duration: Duration::from_secs(2),
            part_duration: Duration::from_millis(500),
            window_size,
        }
    }

    fn params(sps: &[u8]) -> ParameterSets {
        ParameterSets {
            sps: Bytes::copy_from_slice(sps),
            pps: Bytes::from_static(&PPS),
        }
    }

    /// 10fps，每秒一个关键帧
    fn feed(segmenter: &mut HlsSegmenter, frames: std::ops::Range<u64>, sps: &[u8]) {
        for i in frames {
            let keyframe = i % 10 == 0;
            let packet = EncodedPacket {
                data: access_unit(keyframe, false),
                timestamp_ms: 1_000_000 + i * 100,
                keyframe,
                parameter_sets: keyframe.then(|| params(sps)),
                discontinuity: false,
            };
            segmenter.push(&packet).unwrap();
        }
    }

    #[test]
    fn test_nothing_before_parameter_sets() {
        let mut segmenter = HlsSegmenter::new(&config(6));
        for i in 0..30 {
            let packet = EncodedPacket {
                data: access_unit(i % 10 == 0, false),
                timestamp_ms: i * 100,
                keyframe: i % 10 == 0,
                parameter_sets: None,
                discontinuity: false,
            };
            assert!(!segmenter.push(&packet).unwrap());
        }
        assert!(segmenter.playlist(PlaylistKind::LowLatency).is_none());
        assert!(segmenter.playlist(PlaylistKind::Legacy).is_none());
        assert!(segmenter.init_segment(1).is_none());
    }

    #[test]
    fn test_segments_cut_on_keyframes() {
        let mut segmenter = HlsSegmenter::new(&config(6));
        feed(&mut segmenter, 0..61, &SPS_720P);

        let legacy = segmenter.playlist(PlaylistKind::Legacy).unwrap();
        assert!(legacy.contains("#EXT-X-VERSION:7"));
        assert!(legacy.contains("#EXTINF:2.000,\nseg-0.m4s"));
        assert!(legacy.contains("seg-1.m4s"));
        assert!(!legacy.contains("seg-2.m4s"));
        assert!(!legacy.contains("#EXT-X-PART:"));

        let segment = segmenter.segment(0).unwrap();
        assert_eq!(&segment[4..8], b"moof");
        assert!(segmenter.init_segment(1).is_some());
    }

    #[test]
    fn test_low_latency_playlist() {
        let mut segmenter = HlsSegmenter::new(&config(6));
        feed(&mut segmenter, 0..61, &SPS_720P);

        let playlist = segmenter.playlist(PlaylistKind::LowLatency).unwrap();
        assert!(playlist.contains("#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES"));
        assert!(playlist.contains("#EXT-X-PART-INF:PART-TARGET=0.500"));
        assert!(playlist.contains("#EXT-X-MAP:URI=\"init-1.mp4\""));
        assert!(playlist.contains("#EXT-X-PART:DURATION=0.500,URI=\"part-2-0.m4s\",INDEPENDENT=YES"));
        assert!(playlist.contains("URI=\"part-2-3.m4s\""));
        assert!(playlist.contains("#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part-2-4.m4s\""));

        assert!(segmenter.part(2, 3).is_some());
        assert!(segmenter.part(2, 4).is_none());
        assert!(segmenter.is_upcoming_part(2, 4));
        assert!(segmenter.is_ready(1, None));
        assert!(segmenter.is_ready(2, Some(3)));
        assert!(!segmenter.is_ready(2, Some(4)));
        assert!(!segmenter.is_ready(2, None));
    }

    #[test]
    fn test_window_rolls() {
        let mut segmenter = HlsSegmenter::new(&config(2));
        feed(&mut segmenter, 0..121, &SPS_720P);

        let legacy = segmenter.playlist(PlaylistKind::Legacy).unwrap();
        assert!(legacy.contains("#EXT-X-MEDIA-SEQUENCE:3"));
        assert!(!legacy.contains("seg-2.m4s"));
        assert!(segmenter.segment(0).is_none());
        assert!(segmenter.segment(4).is_some());
    }

    #[test]
    fn test_parameter_change_starts_new_generation() {
        let mut segmenter = HlsSegmenter::new(&config(6));
        feed(&mut segmenter, 0..25, &SPS_720P);

        // 不同的SPS（level变化）
        let mut other_sps = SPS_720P;
        other_sps[3] = 0x28;
        feed(&mut segmenter, 30..61, &other_sps);

        assert_eq!(segmenter.generation(), 2);
        assert!(segmenter.init_segment(2).is_some());
        let playlist = segmenter.playlist(PlaylistKind::LowLatency).unwrap();
        assert!(playlist.contains("#EXT-X-DISCONTINUITY\n#EXT-X-MAP:URI=\"init-2.mp4\""));
    }
}
