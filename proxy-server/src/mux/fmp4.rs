// fMP4写入器
//
// 生成带真实avcC的初始化分段，以及 moof+mdat 片段。
// 时间刻度固定为90kHz。

use bytes::{BufMut, Bytes, BytesMut};
use common::{MuxError, ParameterSets};

use super::avc_decoder_configuration;
use crate::codec::h264::sps_dimensions;

/// 90kHz时间刻度
pub const TIMESCALE: u32 = 90_000;

/// BytesMut 扩展：24位和48位整数
trait PutUintExt {
    fn put_u24(&mut self, value: u32);
    fn put_u48(&mut self, value: u64);
}

impl PutUintExt for BytesMut {
    fn put_u24(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes()[1..]);
    }

    fn put_u48(&mut self, value: u64) {
        self.put_slice(&value.to_be_bytes()[2..]);
    }
}

/// Box类型（四字符码）
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
enum BoxType {
    Ftyp = 0x66747970,
    Moov = 0x6d6f6f76,
    Moof = 0x6d6f6f66,
    Mdat = 0x6d646174,
    Mvhd = 0x6d766864,
    Trak = 0x7472616b,
    Tkhd = 0x746b6864,
    Mdia = 0x6d646961,
    Mdhd = 0x6d646864,
    Hdlr = 0x68646c72,
    Minf = 0x6d696e66,
    Vmhd = 0x766d6864,
    Dinf = 0x64696e66,
    Dref = 0x64726566,
    Url = 0x75726c20,
    Stbl = 0x7374626c,
    Stsd = 0x73747364,
    Stts = 0x73747473,
    Stsc = 0x73747363,
    Stsz = 0x7374737a,
    Stco = 0x7374636f,
    Mvex = 0x6d766578,
    Trex = 0x74726578,
    Mfhd = 0x6d666864,
    Traf = 0x74726166,
    Tfhd = 0x74666864,
    Tfdt = 0x74666474,
    Trun = 0x7472756e,
    Avc1 = 0x61766331,
    AvcC = 0x61766343,
}

fn write_box(buffer: &mut BytesMut, box_type: BoxType, payload: &[u8]) {
    buffer.put_u32(8 + payload.len() as u32);
    buffer.put_u32(box_type as u32);
    buffer.extend_from_slice(payload);
}

/// 全盒子头（version + flags）
fn full_box_header(version: u8, flags: u32) -> BytesMut {
    let mut data = BytesMut::new();
    data.put_u8(version);
    data.put_u24(flags);
    data
}

fn put_unity_matrix(data: &mut BytesMut) {
    for value in [0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
        data.put_u32(value);
    }
}

/// 片段中的一个样本
#[derive(Debug, Clone)]
pub struct Fmp4Sample {
    /// AVCC格式（4字节长度前缀）
    pub data: Bytes,
    /// 90kHz刻度下的时长
    pub duration: u32,
    pub keyframe: bool,
}

/// 单轨H.264 fMP4写入器
#[derive(Debug, Clone)]
pub struct Fmp4Writer {
    params: ParameterSets,
    width: u16,
    height: u16,
}

impl Fmp4Writer {
    pub fn new(params: ParameterSets) -> Result<Self, MuxError> {
        if params.sps.is_empty() || params.pps.is_empty() {
            return Err(MuxError::MissingParameterSets);
        }
        let (width, height) = sps_dimensions(&params.sps)
            .ok_or_else(|| MuxError::MalformedPacket("unparseable SPS".to_string()))?;
        Ok(Self {
            params,
            width: width.min(u16::MAX as u32) as u16,
            height: height.min(u16::MAX as u32) as u16,
        })
    }

    pub fn parameter_sets(&self) -> &ParameterSets {
        &self.params
    }

    pub fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    /// 初始化分段（ftyp + moov）
    pub fn init_segment(&self) -> Result<Bytes, MuxError> {
        let mut buffer = BytesMut::new();

        let mut ftyp = BytesMut::new();
        ftyp.extend_from_slice(b"iso5");
        ftyp.put_u32(512);
        for brand in [b"iso5", b"iso6", b"mp41", b"avc1"] {
            ftyp.extend_from_slice(brand);
        }
        write_box(&mut buffer, BoxType::Ftyp, &ftyp);

        let mut moov = BytesMut::new();
        self.write_mvhd(&mut moov);
        self.write_trak(&mut moov)?;
        self.write_mvex(&mut moov);
        write_box(&mut buffer, BoxType::Moov, &moov);

        Ok(buffer.freeze())
    }

    fn write_mvhd(&self, buffer: &mut BytesMut) {
        let mut data = full_box_header(0, 0);
        data.put_u32(0); // creation_time
        data.put_u32(0); // modification_time
        data.put_u32(TIMESCALE);
        data.put_u32(0); // duration
        data.put_u32(0x00010000); // rate
        data.put_u16(0x0100); // volume
        data.put_u16(0);
        data.put_u64(0);
        put_unity_matrix(&mut data);
        for _ in 0..6 {
            data.put_u32(0);
        }
        data.put_u32(2); // next_track_ID
        write_box(buffer, BoxType::Mvhd, &data);
    }

    fn write_trak(&self, buffer: &mut BytesMut) -> Result<(), MuxError> {
        let mut trak = BytesMut::new();

        let mut tkhd = full_box_header(0, 0x000003);
        tkhd.put_u32(0);
        tkhd.put_u32(0);
        tkhd.put_u32(1); // track_ID
        tkhd.put_u32(0);
        tkhd.put_u32(0); // duration
        tkhd.put_u64(0);
        tkhd.put_u16(0); // layer
        tkhd.put_u16(0); // alternate_group
        tkhd.put_u16(0); // volume
        tkhd.put_u16(0);
        put_unity_matrix(&mut tkhd);
        tkhd.put_u32((self.width as u32) << 16);
        tkhd.put_u32((self.height as u32) << 16);
        write_box(&mut trak, BoxType::Tkhd, &tkhd);

        let mut mdia = BytesMut::new();

        let mut mdhd = full_box_header(0, 0);
        mdhd.put_u32(0);
        mdhd.put_u32(0);
        mdhd.put_u32(TIMESCALE);
        mdhd.put_u32(0);
        mdhd.put_u16(0x55c4); // und
        mdhd.put_u16(0);
        write_box(&mut mdia, BoxType::Mdhd, &mdhd);

        let mut hdlr = full_box_header(0, 0);
        hdlr.put_u32(0);
        hdlr.extend_from_slice(b"vide");
        hdlr.put_u32(0);
        hdlr.put_u32(0);
        hdlr.put_u32(0);
        hdlr.extend_from_slice(b"PrinterCam\0");
        write_box(&mut mdia, BoxType::Hdlr, &hdlr);

        let mut minf = BytesMut::new();
        let mut vmhd = full_box_header(0, 1);
        vmhd.put_u16(0);
        vmhd.put_u16(0);
        vmhd.put_u16(0);
        vmhd.put_u16(0);
        write_box(&mut minf, BoxType::Vmhd, &vmhd);

        let mut dref = full_box_header(0, 0);
        dref.put_u32(1);
        write_box(&mut dref, BoxType::Url, &full_box_header(0, 1));
        let mut dinf = BytesMut::new();
        write_box(&mut dinf, BoxType::Dref, &dref);
        write_box(&mut minf, BoxType::Dinf, &dinf);

        self.write_stbl(&mut minf)?;
        write_box(&mut mdia, BoxType::Minf, &minf);
        write_box(&mut trak, BoxType::Mdia, &mdia);

        write_box(buffer, BoxType::Trak, &trak);
        Ok(())
    }

    fn write_stbl(&self, buffer: &mut BytesMut) -> Result<(), MuxError> {
        let mut stbl = BytesMut::new();

        let mut stsd = full_box_header(0, 0);
        stsd.put_u32(1);

        let mut avc1 = BytesMut::new();
        avc1.put_u48(0);
        avc1.put_u16(1); // data_reference_index
        avc1.put_u16(0);
        avc1.put_u16(0);
        avc1.put_u32(0);
        avc1.put_u32(0);
        avc1.put_u32(0);
        avc1.put_u16(self.width);
        avc1.put_u16(self.height);
        avc1.put_u32(0x00480000);
        avc1.put_u32(0x00480000);
        avc1.put_u32(0);
        avc1.put_u16(1); // frame_count
        avc1.put_slice(&[0u8; 32]); // compressorname
        avc1.put_u16(0x0018);
        avc1.put_i16(-1);
        write_box(&mut avc1, BoxType::AvcC, &avc_decoder_configuration(&self.params)?);
        write_box(&mut stsd, BoxType::Avc1, &avc1);
        write_box(&mut stbl, BoxType::Stsd, &stsd);

        // 片段化文件的样本表为空
        for box_type in [BoxType::Stts, BoxType::Stsc, BoxType::Stco] {
            let mut empty = full_box_header(0, 0);
            empty.put_u32(0);
            write_box(&mut stbl, box_type, &empty);
        }
        let mut stsz = full_box_header(0, 0);
        stsz.put_u32(0);
        stsz.put_u32(0);
        write_box(&mut stbl, BoxType::Stsz, &stsz);

        write_box(buffer, BoxType::Stbl, &stbl);
        Ok(())
    }

    fn write_mvex(&self, buffer: &mut BytesMut) {
        let mut trex = full_box_header(0, 0);
        trex.put_u32(1); // track_ID
        trex.put_u32(1); // default_sample_description_index
        trex.put_u32(0);
        trex.put_u32(0);
        trex.put_u32(0);
        let mut mvex = BytesMut::new();
        write_box(&mut mvex, BoxType::Trex, &trex);
        write_box(buffer, BoxType::Mvex, &mvex);
    }

    /// 媒体片段（moof + mdat）
    ///
    /// `base_decode_time` 为第一个样本的解码时间（90kHz）。
    pub fn fragment(&self, sequence: u32, base_decode_time: u64, samples: &[Fmp4Sample]) -> Bytes {
        // moof = 8 + mfhd(16) + traf(8 + tfhd(16) + tfdt(20) + trun(20 + 12n))
        let trun_size = 20 + 12 * samples.len();
        let moof_size = 8 + 16 + 8 + 16 + 20 + trun_size;
        let mdat_size = 8 + samples.iter().map(|s| s.data.len()).sum::<usize>();

        let mut buffer = BytesMut::with_capacity(moof_size + mdat_size);
        let mut moof = BytesMut::with_capacity(moof_size);

        let mut mfhd = full_box_header(0, 0);
        mfhd.put_u32(sequence);
        write_box(&mut moof, BoxType::Mfhd, &mfhd);

        let mut traf = BytesMut::new();
        let mut tfhd = full_box_header(0, 0x020000); // default-base-is-moof
        tfhd.put_u32(1);
        write_box(&mut traf, BoxType::Tfhd, &tfhd);

        let mut tfdt = full_box_header(1, 0);
        tfdt.put_u64(base_decode_time);
        write_box(&mut traf, BoxType::Tfdt, &tfdt);

        // data-offset | sample-duration | sample-size | sample-flags
        let mut trun = full_box_header(0, 0x000701);
        trun.put_u32(samples.len() as u32);
        trun.put_i32((moof_size + 8) as i32);
        for sample in samples {
            trun.put_u32(sample.duration);
            trun.put_u32(sample.data.len() as u32);
            trun.put_u32(if sample.keyframe { 0x02000000 } else { 0x01010000 });
        }
        write_box(&mut traf, BoxType::Trun, &trun);
        write_box(&mut moof, BoxType::Traf, &traf);

        write_box(&mut buffer, BoxType::Moof, &moof);

        buffer.put_u32(mdat_size as u32);
        buffer.put_u32(BoxType::Mdat as u32);
        for sample in samples {
            buffer.extend_from_slice(&sample.data);
        }
        buffer.freeze()
    }
}
