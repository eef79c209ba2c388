// JPEG帧工具：按SOI/EOI切分连续字节流，并从SOF段读取分辨率

use bytes::{Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// 单帧最大长度，超出视为流已损坏
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn find_marker(data: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if data.len() < from + 2 {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

/// 连续JPEG字节流切分器（ffmpeg mjpeg输出或无边界的MJPEG流）
#[derive(Debug, Default)]
pub struct JpegScanner {
    buf: BytesMut,
}

impl JpegScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 取出下一个完整的JPEG帧
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let start = match find_marker(&self.buf, &SOI, 0) {
                Some(start) => start,
                None => {
                    // 保留最后一个字节，可能是半个SOI
                    let keep = self.buf.len().min(1);
                    let drop = self.buf.len() - keep;
                    let _ = self.buf.split_to(drop);
                    return None;
                }
            };
            if start > 0 {
                let _ = self.buf.split_to(start);
            }

            match find_marker(&self.buf, &EOI, 2) {
                Some(end) => return Some(self.buf.split_to(end + 2).freeze()),
                None if self.buf.len() > MAX_FRAME_SIZE => {
                    // 丢弃损坏的帧头，继续寻找下一个SOI
                    let _ = self.buf.split_to(2);
                    continue;
                }
                None => return None,
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// 从JPEG的SOF段读取宽高
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() < 4 || data[..2] != SOI {
        return None;
    }

    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        // 填充字节
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;

        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if pos + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]);
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]);
            return Some((width, height));
        }
        if marker == 0xDA {
            // 扫描数据开始仍未见SOF
            return None;
        }
        pos += 2 + length;
    }
    None
}
