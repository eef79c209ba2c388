// 容器封装
//
// FLV（每个客户端一个封装器）和 fMP4/LL-HLS（每个会话共享一个分段器）。
// 两者都在拿到SPS和PPS之前不输出任何数据。

mod flv;
mod fmp4;
mod hls;

pub use flv::FlvMuxer;
pub use fmp4::{Fmp4Sample, Fmp4Writer};
pub use hls::{HlsSegmenter, PlaylistKind};

use bytes::{BufMut, Bytes, BytesMut};
use common::{MuxError, ParameterSets};

/// AVCDecoderConfigurationRecord（FLV序列头和avcC共用）
pub fn avc_decoder_configuration(params: &ParameterSets) -> Result<Bytes, MuxError> {
    let sps = &params.sps;
    let pps = &params.pps;
    if sps.len() < 4 || pps.is_empty() {
        return Err(MuxError::MissingParameterSets);
    }
    if sps.len() > u16::MAX as usize || pps.len() > u16::MAX as usize {
        return Err(MuxError::MalformedPacket("parameter set too large".to_string()));
    }

    let mut record = BytesMut::with_capacity(11 + sps.len() + pps.len());
    record.put_u8(1); // configurationVersion
    record.put_u8(sps[1]); // AVCProfileIndication
    record.put_u8(sps[2]); // profile_compatibility
    record.put_u8(sps[3]); // AVCLevelIndication
    record.put_u8(0xFF); // 4字节NALU长度
    record.put_u8(0xE1); // 1个SPS
    record.put_u16(sps.len() as u16);
    record.extend_from_slice(sps);
    record.put_u8(1); // 1个PPS
    record.put_u16(pps.len() as u16);
    record.extend_from_slice(pps);
    Ok(record.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::tests::{PPS, SPS_720P};

    #[test]
    fn test_decoder_configuration_record() {
        let params = ParameterSets {
            sps: Bytes::from_static(&SPS_720P),
            pps: Bytes::from_static(&PPS),
        };
        let record = avc_decoder_configuration(&params).unwrap();
        assert_eq!(record[0], 1);
        assert_eq!(record[1], 0x42);
        assert_eq!(record[5], 0xE1);
        assert_eq!(&record[8..8 + SPS_720P.len()], &SPS_720P);
        assert_eq!(record.len(), 11 + SPS_720P.len() + PPS.len());

        let empty = ParameterSets {
            sps: Bytes::new(),
            pps: Bytes::new(),
        };
        assert_eq!(avc_decoder_configuration(&empty), Err(MuxError::MissingParameterSets));
    }
}
