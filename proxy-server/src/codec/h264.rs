// H.264码流工具
//
// Annex-B 拆分、访问单元切分、参数集门控和 SPS 分辨率解析。
// 摄取、编码和封装三个阶段共用这些工具。

use bytes::{BufMut, Bytes, BytesMut};
use common::{EncodedPacket, ParameterSets};

/// NAL单元类型
pub mod nal_type {
    pub const SLICE: u8 = 1;
    pub const IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// 取NAL单元类型
pub fn nal_unit_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1f).unwrap_or(0)
}

fn is_vcl(kind: u8) -> bool {
    (nal_type::SLICE..=nal_type::IDR).contains(&kind)
}

/// 查找所有3字节起始码之后的偏移
fn start_code_offsets(data: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            offsets.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    offsets
}

/// 将Annex-B数据拆分为NAL单元（不含起始码）
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let offsets = start_code_offsets(data);
    let mut units = Vec::with_capacity(offsets.len());

    for (n, &start) in offsets.iter().enumerate() {
        let mut end = match offsets.get(n + 1) {
            Some(next) => next - 3,
            None => data.len(),
        };
        // 4字节起始码的前导零属于下一个单元
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            units.push(&data[start..end]);
        }
    }
    units
}

/// 用4字节起始码拼接NAL单元
pub fn to_annex_b<'a>(nals: impl IntoIterator<Item = &'a [u8]>) -> Bytes {
    let mut out = BytesMut::new();
    for nal in nals {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
    out.freeze()
}

/// Annex-B转换为4字节长度前缀格式（AVCC），去掉参数集和AUD
pub fn annex_b_to_avcc(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len());
    for nal in split_nal_units(data) {
        match nal_unit_type(nal) {
            nal_type::SPS | nal_type::PPS | nal_type::AUD => continue,
            _ => {
                out.put_u32(nal.len() as u32);
                out.extend_from_slice(nal);
            }
        }
    }
    out.freeze()
}

/// 访问单元概要
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessUnitInfo {
    pub keyframe: bool,
    pub has_vcl: bool,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

/// 检查访问单元中的NAL类型
pub fn inspect(data: &[u8]) -> AccessUnitInfo {
    let mut info = AccessUnitInfo::default();
    for nal in split_nal_units(data) {
        let kind = nal_unit_type(nal);
        match kind {
            nal_type::SPS => info.sps = Some(Bytes::copy_from_slice(nal)),
            nal_type::PPS => info.pps = Some(Bytes::copy_from_slice(nal)),
            nal_type::IDR => info.keyframe = true,
            _ => {}
        }
        if is_vcl(kind) {
            info.has_vcl = true;
        }
    }
    info
}

/// 从访问单元中提取参数集（需SPS与PPS同时存在）
pub fn parameter_sets_of(data: &[u8]) -> Option<ParameterSets> {
    let info = inspect(data);
    match (info.sps, info.pps) {
        (Some(sps), Some(pps)) => Some(ParameterSets { sps, pps }),
        _ => None,
    }
}

/// 流式访问单元切分器
///
/// 编码器stdout是连续的Annex-B字节流，一个访问单元在下一幅图像的
/// 第一个NAL（AUD/SPS/PPS/SEI 或 first_mb_in_slice==0 的slice）出现时结束。
#[derive(Debug, Default)]
pub struct AccessUnitSplitter {
    pending: BytesMut,
    current: Vec<Bytes>,
    current_has_vcl: bool,
}

impl AccessUnitSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加字节，返回已完整的访问单元
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);

        let offsets = start_code_offsets(&self.pending);
        if offsets.len() < 2 {
            return Vec::new();
        }

        // 最后一个NAL可能尚未完整，保留在缓冲区
        let last_start = offsets[offsets.len() - 1] - 3;
        let complete = self.pending.split_to(last_start).freeze();

        let mut finished = Vec::new();
        for nal in split_nal_units(&complete) {
            if let Some(unit) = self.accept(Bytes::copy_from_slice(nal)) {
                finished.push(unit);
            }
        }
        finished
    }

    /// 流结束时取出剩余的访问单元
    pub fn flush(&mut self) -> Option<Bytes> {
        let rest = std::mem::take(&mut self.pending);
        let mut last = None;
        for nal in split_nal_units(&rest) {
            if let Some(unit) = self.accept(Bytes::copy_from_slice(nal)) {
                last = Some(unit);
            }
        }
        if self.current_has_vcl {
            last = Some(self.finish_current());
        }
        last
    }

    fn accept(&mut self, nal: Bytes) -> Option<Bytes> {
        let kind = nal_unit_type(&nal);
        let starts_picture = match kind {
            nal_type::AUD | nal_type::SPS | nal_type::PPS | nal_type::SEI => true,
            k if is_vcl(k) => nal.get(1).map(|b| b & 0x80 != 0).unwrap_or(false),
            _ => false,
        };

        let finished = if starts_picture && self.current_has_vcl {
            Some(self.finish_current())
        } else {
            None
        };

        if is_vcl(kind) {
            self.current_has_vcl = true;
        }
        self.current.push(nal);
        finished
    }

    fn finish_current(&mut self) -> Bytes {
        let nals = std::mem::take(&mut self.current);
        self.current_has_vcl = false;
        to_annex_b(nals.iter().map(|n| n.as_ref()))
    }
}

/// 参数集门控
///
/// 在观察到SPS和PPS并收到第一个IDR之前不放行任何数据，
/// 防止无法解码的前导帧进入下游。参数集变化时重新布防，
/// 下一个放行的包带不连续标记。
#[derive(Debug, Default)]
pub struct ParameterSetGate {
    params: Option<ParameterSets>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    open: bool,
    pending_discontinuity: bool,
}

impl ParameterSetGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn parameter_sets(&self) -> Option<&ParameterSets> {
        self.params.as_ref()
    }

    /// 记录带外参数集（如FLV的AVC序列头）
    pub fn observe(&mut self, sps: Option<Bytes>, pps: Option<Bytes>) {
        if let Some(sps) = sps {
            self.sps = Some(sps);
        }
        if let Some(pps) = pps {
            self.pps = Some(pps);
        }

        if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
            let next = ParameterSets {
                sps: sps.clone(),
                pps: pps.clone(),
            };
            match &self.params {
                Some(current) if *current == next => {}
                Some(_) => {
                    // 结构性不连续：等待新的IDR
                    self.params = Some(next);
                    self.open = false;
                    self.pending_discontinuity = true;
                }
                None => self.params = Some(next),
            }
        }
    }

    /// 放行或扣留一个访问单元
    pub fn admit(&mut self, access_unit: Bytes, timestamp_ms: u64) -> Option<EncodedPacket> {
        let info = inspect(&access_unit);
        self.observe(info.sps.clone(), info.pps.clone());

        if !info.has_vcl {
            return None;
        }

        let params = self.params.clone()?;
        if !self.open {
            if !info.keyframe {
                return None;
            }
            self.open = true;
        }

        // 关键帧总是内联携带参数集
        let data = if info.keyframe && (info.sps.is_none() || info.pps.is_none()) {
            let mut out = BytesMut::with_capacity(access_unit.len() + params.sps.len() + params.pps.len() + 8);
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(&params.sps);
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(&params.pps);
            out.extend_from_slice(&access_unit);
            out.freeze()
        } else {
            access_unit
        };

        Some(EncodedPacket {
            data,
            timestamp_ms,
            keyframe: info.keyframe,
            parameter_sets: info.keyframe.then_some(params),
            discontinuity: std::mem::take(&mut self.pending_discontinuity),
        })
    }
}

/// RBSP比特读取器（已去除防竞争字节）
struct BitReader {
    data: Vec<u8>,
    pos: usize,
}

impl BitReader {
    fn new(nal_payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(nal_payload.len());
        let mut zeros = 0;
        for &b in nal_payload {
            if zeros >= 2 && b == 3 {
                zeros = 0;
                continue;
            }
            zeros = if b == 0 { zeros + 1 } else { 0 };
            data.push(b);
        }
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn read_bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Some((1u32 << leading_zeros) - 1 + suffix)
    }

    fn read_se(&mut self) -> Option<i32> {
        let value = self.read_ue()?;
        Some(if value % 2 == 1 {
            ((value + 1) / 2) as i32
        } else {
            -((value / 2) as i32)
        })
    }
}

fn skip_scaling_list(reader: &mut BitReader, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = reader.read_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

/// 从SPS解析图像宽高
pub fn sps_dimensions(sps: &[u8]) -> Option<(u32, u32)> {
    if nal_unit_type(sps) != nal_type::SPS || sps.len() < 4 {
        return None;
    }
    let mut r = BitReader::new(&sps[1..]);

    let profile_idc = r.read_bits(8)?;
    r.read_bits(8)?; // constraint flags
    r.read_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_bit()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            let lists = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..lists {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?;
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?;
        r.read_se()?;
        r.read_se()?;
        let cycle = r.read_ue()?;
        for _ in 0..cycle {
            r.read_se()?;
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag
    let width_mbs = r.read_ue()? + 1;
    let height_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag

    let (mut left, mut right, mut top, mut bottom) = (0, 0, 0, 0);
    if r.read_bit()? == 1 {
        left = r.read_ue()?;
        right = r.read_ue()?;
        top = r.read_ue()?;
        bottom = r.read_ue()?;
    }

    let width = width_mbs * 16;
    let height = (2 - frame_mbs_only) * height_map_units * 16;
    let (crop_x, crop_y) = match chroma_format_idc {
        0 => (1, 2 - frame_mbs_only),
        1 => (2, 2 * (2 - frame_mbs_only)),
        2 => (2, 2 - frame_mbs_only),
        _ => (1, 2 - frame_mbs_only),
    };

    let crop_w = (left + right) * crop_x;
    let crop_h = (top + bottom) * crop_y;
    if crop_w >= width || crop_h >= height {
        return None;
    }
    Some((width - crop_w, height - crop_h))
}
