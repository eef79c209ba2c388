// FLV封装器（每个客户端一个实例）

use bytes::{BufMut, Bytes, BytesMut};
use common::{EncodedPacket, MuxError, ParameterSets};
use tracing::debug;

use super::avc_decoder_configuration;
use crate::codec::h264::{annex_b_to_avcc, sps_dimensions};

const TAG_VIDEO: u8 = 9;
const TAG_SCRIPT: u8 = 18;
const CODEC_AVC: u8 = 7;

/// FLV封装器
///
/// 在获得SPS和PPS之前不输出任何字节；随后依次输出文件头、onMetaData、
/// AVC序列头，并从第一个关键帧开始输出NALU标签。时间戳相对第一个输出的标签。
#[derive(Debug, Default)]
pub struct FlvMuxer {
    params: Option<ParameterSets>,
    header_written: bool,
    sequence_header_due: bool,
    /// 等待关键帧（初始或重新同步）
    waiting_keyframe: bool,
    base_timestamp: Option<u64>,
}

impl FlvMuxer {
    pub fn new() -> Self {
        Self {
            waiting_keyframe: true,
            ..Self::default()
        }
    }

    /// 封装一个访问单元
    ///
    /// # 返回
    ///
    /// - `Ok(Some(bytes))`: 可直接写给客户端的FLV数据
    /// - `Ok(None)`: 仍在等待参数集或关键帧
    pub fn write_packet(&mut self, packet: &EncodedPacket) -> Result<Option<Bytes>, MuxError> {
        if let Some(params) = &packet.parameter_sets {
            if self.params.as_ref() != Some(params) {
                if self.params.is_some() {
                    debug!("FLV parameter sets changed, re-sending sequence header");
                }
                self.params = Some(params.clone());
                self.sequence_header_due = true;
            }
        }

        let Some(params) = self.params.clone() else {
            return Ok(None);
        };
        if self.waiting_keyframe {
            if !packet.keyframe {
                return Ok(None);
            }
            self.waiting_keyframe = false;
        }

        let payload = annex_b_to_avcc(&packet.data);
        if payload.is_empty() {
            return Err(MuxError::MalformedPacket("access unit without slice data".to_string()));
        }

        let base = *self.base_timestamp.get_or_insert(packet.timestamp_ms);
        // FLV时间戳只有32位，约49.7天后饱和而不是回绕
        let timestamp = u32::try_from(packet.timestamp_ms.saturating_sub(base)).unwrap_or(u32::MAX);

        let mut out = BytesMut::new();
        if !self.header_written {
            write_file_header(&mut out);
            write_tag(&mut out, TAG_SCRIPT, 0, &metadata(&params));
            self.header_written = true;
        }
        if self.sequence_header_due {
            let record = avc_decoder_configuration(&params)?;
            let mut body = BytesMut::with_capacity(record.len() + 5);
            body.put_u8(0x10 | CODEC_AVC);
            body.put_u8(0); // AVC sequence header
            body.put_u24_be(0);
            body.extend_from_slice(&record);
            write_tag(&mut out, TAG_VIDEO, timestamp, &body);
            self.sequence_header_due = false;
        }

        let mut body = BytesMut::with_capacity(payload.len() + 5);
        let frame_type = if packet.keyframe { 0x10 } else { 0x20 };
        body.put_u8(frame_type | CODEC_AVC);
        body.put_u8(1); // AVC NALU
        body.put_u24_be(0); // composition time
        body.extend_from_slice(&payload);
        write_tag(&mut out, TAG_VIDEO, timestamp, &body);

        Ok(Some(out.freeze()))
    }

    /// 队列溢出后重新同步：从下一个关键帧开始，并重发序列头
    pub fn resync(&mut self) {
        self.waiting_keyframe = true;
        self.sequence_header_due = true;
    }
}

trait PutU24 {
    fn put_u24_be(&mut self, value: u32);
}

impl PutU24 for BytesMut {
    fn put_u24_be(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes()[1..]);
    }
}

fn write_file_header(out: &mut BytesMut) {
    out.extend_from_slice(b"FLV");
    out.put_u8(1);
    out.put_u8(0x01); // 仅视频
    out.put_u32(9);
    out.put_u32(0); // PreviousTagSize0
}

fn write_tag(out: &mut BytesMut, tag_type: u8, timestamp: u32, body: &[u8]) {
    out.put_u8(tag_type);
    out.put_u24_be(body.len() as u32);
    out.put_u24_be(timestamp & 0x00FF_FFFF);
    out.put_u8((timestamp >> 24) as u8);
    out.put_u24_be(0); // stream id
    out.extend_from_slice(body);
    out.put_u32(body.len() as u32 + 11);
}

/// AMF0 onMetaData
fn metadata(params: &ParameterSets) -> Bytes {
    let mut entries: Vec<(&str, f64)> = vec![("videocodecid", CODEC_AVC as f64)];
    if let Some((width, height)) = sps_dimensions(&params.sps) {
        entries.push(("width", width as f64));
        entries.push(("height", height as f64));
    }

    let mut out = BytesMut::new();
    put_amf_string(&mut out, "onMetaData");
    out.put_u8(0x08); // ECMA array
    out.put_u32(entries.len() as u32);
    for (key, value) in entries {
        out.put_u16(key.len() as u16);
        out.extend_from_slice(key.as_bytes());
        out.put_u8(0x00); // number
        out.put_f64(value);
    }
    out.extend_from_slice(&[0x00, 0x00, 0x09]);
    out.freeze()
}

fn put_amf_string(out: &mut BytesMut, value: &str) {
    out.put_u8(0x02);
    out.put_u16(value.len() as u16);
    out.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::tests::{access_unit, PPS, SPS_720P};
    use crate::ingest::{FlvDemuxer, FlvEvent};

    fn params() -> ParameterSets {
        ParameterSets {
            sps: Bytes::from_static(&SPS_720P),
            pps: Bytes::from_static(&PPS),
        }
    }

    fn packet(keyframe: bool, timestamp_ms: u64, with_params: bool) -> EncodedPacket {
        EncodedPacket {
            data: access_unit(keyframe, keyframe),
            timestamp_ms,
            keyframe,
            parameter_sets: with_params.then(params),
            discontinuity: false,
        }
    }

    #[test]
    fn test_nothing_before_parameter_sets() {
        let mut muxer = FlvMuxer::new();
        assert!(muxer.write_packet(&packet(false, 0, false)).unwrap().is_none());
        assert!(muxer.write_packet(&packet(true, 40, false)).unwrap().is_none());

        let first = muxer.write_packet(&packet(true, 80, true)).unwrap().unwrap();
        assert_eq!(&first[..3], b"FLV");
    }

    #[test]
    fn test_output_demuxes_back() {
        let mut muxer = FlvMuxer::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&muxer.write_packet(&packet(true, 1_000, true)).unwrap().unwrap());
        stream.extend_from_slice(&muxer.write_packet(&packet(false, 1_040, false)).unwrap().unwrap());

        let mut demuxer = FlvDemuxer::new();
        demuxer.push(&stream);

        match demuxer.next_event().unwrap() {
            Some(FlvEvent::SequenceHeader { sps, pps }) => {
                assert_eq!(sps.as_deref(), Some(&SPS_720P[..]));
                assert_eq!(pps.as_deref(), Some(&PPS[..]));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match demuxer.next_event().unwrap() {
            Some(FlvEvent::AccessUnit { keyframe, dts_ms, .. }) => {
                assert!(keyframe);
                assert_eq!(dts_ms, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match demuxer.next_event().unwrap() {
            Some(FlvEvent::AccessUnit { keyframe, dts_ms, .. }) => {
                assert!(!keyframe);
                assert_eq!(dts_ms, 40);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_resync_waits_for_keyframe_and_resends_sequence_header() {
        let mut muxer = FlvMuxer::new();
        muxer.write_packet(&packet(true, 0, true)).unwrap();
        muxer.resync();

        assert!(muxer.write_packet(&packet(false, 40, false)).unwrap().is_none());
        let resumed = muxer.write_packet(&packet(true, 80, true)).unwrap().unwrap();
        // 序列头（AVCPacketType 0）紧跟在标签头之后
        assert_eq!(resumed[0], TAG_VIDEO);
        assert_eq!(resumed[11], 0x17);
        assert_eq!(resumed[12], 0);
        assert_ne!(&resumed[..3], b"FLV");
    }

    #[test]
    fn test_timestamp_saturates_past_32_bits() {
        let mut muxer = FlvMuxer::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&muxer.write_packet(&packet(true, 0, true)).unwrap().unwrap());
        let late = u64::from(u32::MAX) + 5_000;
        stream.extend_from_slice(&muxer.write_packet(&packet(false, late, false)).unwrap().unwrap());

        let mut demuxer = FlvDemuxer::new();
        demuxer.push(&stream);
        let mut last_dts = None;
        while let Some(event) = demuxer.next_event().unwrap() {
            if let FlvEvent::AccessUnit { dts_ms, .. } = event {
                last_dts = Some(dts_ms);
            }
        }
        assert_eq!(last_dts, Some(u32::MAX));
    }
}
