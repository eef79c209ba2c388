// FLV增量解复用
//
// 只关心视频标签：AVC序列头提供SPS/PPS，NALU标签中的长度前缀单元
// 被转换为Annex-B访问单元。音频和脚本标签直接跳过。

use bytes::{Buf, Bytes, BytesMut};
use common::StreamError;

use crate::codec::h264;

const FLV_HEADER_SIZE: usize = 9;
const TAG_HEADER_SIZE: usize = 11;
const MAX_TAG_SIZE: usize = 8 * 1024 * 1024;

const TAG_TYPE_VIDEO: u8 = 9;
const CODEC_AVC: u8 = 7;

/// 解复用事件
#[derive(Debug, Clone, PartialEq)]
pub enum FlvEvent {
    SequenceHeader { sps: Option<Bytes>, pps: Option<Bytes> },
    AccessUnit { data: Bytes, keyframe: bool, dts_ms: u32 },
    EndOfSequence,
}

#[derive(Debug)]
pub struct FlvDemuxer {
    buf: BytesMut,
    header_done: bool,
    nalu_length_size: usize,
}

impl FlvDemuxer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            header_done: false,
            nalu_length_size: 4,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 取下一个事件；数据不足时返回 `Ok(None)`
    pub fn next_event(&mut self) -> Result<Option<FlvEvent>, StreamError> {
        if !self.header_done {
            if self.buf.len() < FLV_HEADER_SIZE {
                return Ok(None);
            }
            if &self.buf[..3] != b"FLV" {
                return Err(StreamError::Protocol("missing FLV signature".to_string()));
            }
            let data_offset = u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) as usize;
            // 头部之后紧跟 PreviousTagSize0
            let skip = data_offset.max(FLV_HEADER_SIZE) + 4;
            if self.buf.len() < skip {
                return Ok(None);
            }
            self.buf.advance(skip);
            self.header_done = true;
        }

        loop {
            if self.buf.len() < TAG_HEADER_SIZE {
                return Ok(None);
            }
            let tag_type = self.buf[0] & 0x1f;
            let data_size = u32::from_be_bytes([0, self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if data_size > MAX_TAG_SIZE {
                return Err(StreamError::Protocol(format!("FLV tag too large: {}", data_size)));
            }
            let total = TAG_HEADER_SIZE + data_size + 4;
            if self.buf.len() < total {
                return Ok(None);
            }

            let timestamp = u32::from_be_bytes([self.buf[7], self.buf[4], self.buf[5], self.buf[6]]);
            let mut tag = self.buf.split_to(total);
            tag.advance(TAG_HEADER_SIZE);
            tag.truncate(data_size);

            if tag_type != TAG_TYPE_VIDEO {
                continue;
            }
            if let Some(event) = self.parse_video(tag.freeze(), timestamp)? {
                return Ok(Some(event));
            }
        }
    }

    fn parse_video(&mut self, tag: Bytes, timestamp: u32) -> Result<Option<FlvEvent>, StreamError> {
        if tag.len() < 5 {
            return Ok(None);
        }
        let frame_type = tag[0] >> 4;
        let codec = tag[0] & 0x0f;
        if codec != CODEC_AVC {
            return Err(StreamError::Protocol(format!("unsupported FLV video codec {}", codec)));
        }

        let payload = tag.slice(5..);
        match tag[1] {
            0 => self.parse_sequence_header(&payload).map(Some),
            1 => {
                let data = self.length_prefixed_to_annex_b(&payload)?;
                if data.is_empty() {
                    return Ok(None);
                }
                let keyframe = frame_type == 1 || h264::inspect(&data).keyframe;
                Ok(Some(FlvEvent::AccessUnit {
                    data,
                    keyframe,
                    dts_ms: timestamp,
                }))
            }
            2 => Ok(Some(FlvEvent::EndOfSequence)),
            other => Err(StreamError::Protocol(format!("unknown AVC packet type {}", other))),
        }
    }

    fn parse_sequence_header(&mut self, record: &[u8]) -> Result<FlvEvent, StreamError> {
        let malformed = || StreamError::Protocol("truncated AVC decoder configuration".to_string());
        if record.len() < 6 {
            return Err(malformed());
        }
        self.nalu_length_size = (record[4] & 0x03) as usize + 1;

        let mut pos = 5;
        let read_sets = |count: usize, pos: &mut usize| -> Result<Option<Bytes>, StreamError> {
            let mut first = None;
            for _ in 0..count {
                if *pos + 2 > record.len() {
                    return Err(malformed());
                }
                let len = u16::from_be_bytes([record[*pos], record[*pos + 1]]) as usize;
                *pos += 2;
                if *pos + len > record.len() {
                    return Err(malformed());
                }
                if first.is_none() {
                    first = Some(Bytes::copy_from_slice(&record[*pos..*pos + len]));
                }
                *pos += len;
            }
            Ok(first)
        };

        let sps_count = (record[pos] & 0x1f) as usize;
        pos += 1;
        let sps = read_sets(sps_count, &mut pos)?;

        if pos >= record.len() {
            return Err(malformed());
        }
        let pps_count = record[pos] as usize;
        pos += 1;
        let pps = read_sets(pps_count, &mut pos)?;

        Ok(FlvEvent::SequenceHeader { sps, pps })
    }

    fn length_prefixed_to_annex_b(&self, payload: &[u8]) -> Result<Bytes, StreamError> {
        let size = self.nalu_length_size;
        let mut nals = Vec::new();
        let mut pos = 0;
        while pos + size <= payload.len() {
            let mut len = 0usize;
            for b in &payload[pos..pos + size] {
                len = (len << 8) | *b as usize;
            }
            pos += size;
            if pos + len > payload.len() {
                return Err(StreamError::Protocol("NALU length exceeds tag".to_string()));
            }
            if len > 0 {
                nals.push(&payload[pos..pos + len]);
            }
            pos += len;
        }
        Ok(h264::to_annex_b(nals))
    }
}

impl Default for FlvDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::tests::{PPS, SPS_720P};

    fn tag(tag_type: u8, timestamp: u32, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag_type];
        out.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        out.extend_from_slice(&timestamp.to_be_bytes()[1..]);
        out.push((timestamp >> 24) as u8);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(body);
        out.extend_from_slice(&((body.len() + TAG_HEADER_SIZE) as u32).to_be_bytes());
        out
    }

    fn stream() -> Vec<u8> {
        let mut data = b"FLV\x01\x01\x00\x00\x00\x09\x00\x00\x00\x00".to_vec();

        // AVC序列头
        let mut record = vec![0x17, 0x00, 0, 0, 0, 0x01, 0x42, 0xC0, 0x1F, 0xFF, 0xE1];
        record.extend_from_slice(&(SPS_720P.len() as u16).to_be_bytes());
        record.extend_from_slice(&SPS_720P);
        record.push(1);
        record.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&PPS);
        data.extend(tag(TAG_TYPE_VIDEO, 0, &record));

        // 音频标签应被跳过
        data.extend(tag(8, 0, &[0xAF, 0x01, 0x00]));

        let idr = [0x65, 0x88, 0x84];
        let mut body = vec![0x17, 0x01, 0, 0, 0];
        body.extend_from_slice(&(idr.len() as u32).to_be_bytes());
        body.extend_from_slice(&idr);
        data.extend(tag(TAG_TYPE_VIDEO, 40, &body));
        data
    }

    #[test]
    fn test_demux_sequence_header_and_access_unit() {
        let mut demuxer = FlvDemuxer::new();
        let mut events = Vec::new();
        for chunk in stream().chunks(6) {
            demuxer.push(chunk);
            while let Some(event) = demuxer.next_event().unwrap() {
                events.push(event);
            }
        }

        assert_eq!(events.len(), 2);
        match &events[0] {
            FlvEvent::SequenceHeader { sps, pps } => {
                assert_eq!(sps.as_deref(), Some(&SPS_720P[..]));
                assert_eq!(pps.as_deref(), Some(&PPS[..]));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            FlvEvent::AccessUnit { data, keyframe, dts_ms } => {
                assert!(*keyframe);
                assert_eq!(*dts_ms, 40);
                assert_eq!(&data[..], &[0, 0, 0, 1, 0x65, 0x88, 0x84]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_rejects_non_flv() {
        let mut demuxer = FlvDemuxer::new();
        demuxer.push(b"HTTP/1.1 200 OK\r\n");
        assert!(matches!(demuxer.next_event(), Err(StreamError::Protocol(_))));
    }
}
