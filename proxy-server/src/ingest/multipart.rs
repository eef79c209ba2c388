// multipart/x-mixed-replace 增量解析
//
// 优先使用每个分片的 Content-Length；没有时扫描下一个边界。

use bytes::{Buf, Bytes, BytesMut};
use common::StreamError;

const MAX_BUFFERED: usize = 16 * 1024 * 1024;
const HEADER_END: &[u8] = b"\r\n\r\n";

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// 从 Content-Type 中取出边界
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        let value = value.strip_prefix("--").unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Debug)]
pub struct MultipartParser {
    delimiter: Vec<u8>,
    buf: BytesMut,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            delimiter: format!("--{}", boundary).into_bytes(),
            buf: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 取下一个完整分片的正文
    pub fn next_part(&mut self) -> Result<Option<Bytes>, StreamError> {
        let start = match find(&self.buf, &self.delimiter, 0) {
            Some(start) => start,
            None => return self.check_overflow(),
        };
        let headers_start = start + self.delimiter.len();
        let headers_end = match find(&self.buf, HEADER_END, headers_start) {
            Some(end) => end,
            None => return self.check_overflow(),
        };
        let body_start = headers_end + HEADER_END.len();

        let headers = String::from_utf8_lossy(&self.buf[headers_start..headers_end]);
        let content_length = headers.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        });

        let body = match content_length {
            Some(len) => {
                if self.buf.len() < body_start + len {
                    return self.check_overflow();
                }
                self.buf.advance(body_start);
                self.buf.split_to(len).freeze()
            }
            None => {
                let next = match find(&self.buf, &self.delimiter, body_start) {
                    Some(next) => next,
                    None => return self.check_overflow(),
                };
                self.buf.advance(body_start);
                let mut body = self.buf.split_to(next - body_start);
                // 去掉边界前的CRLF
                while body.last().map_or(false, |b| *b == b'\n' || *b == b'\r') {
                    body.truncate(body.len() - 1);
                }
                body.freeze()
            }
        };

        Ok(Some(body))
    }

    fn check_overflow(&self) -> Result<Option<Bytes>, StreamError> {
        if self.buf.len() > MAX_BUFFERED {
            return Err(StreamError::Protocol(
                "multipart part exceeds buffer limit".to_string(),
            ));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"--myboundary\"").as_deref(),
            Some("myboundary")
        );
        assert!(boundary_from_content_type("image/jpeg").is_none());
    }

    #[test]
    fn test_parts_with_and_without_length() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nAAAA\r\n");
        stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\nBBBBBB\r\n");
        stream.extend_from_slice(b"--frame\r\nContent-Length: 2\r\n\r\nCC\r\n");

        let mut parser = MultipartParser::new("frame");
        let mut parts = Vec::new();
        for chunk in stream.chunks(3) {
            parser.push(chunk);
            while let Some(part) = parser.next_part().unwrap() {
                parts.push(part);
            }
        }

        assert_eq!(parts, vec![
            Bytes::from_static(b"AAAA"),
            Bytes::from_static(b"BBBBBB"),
            Bytes::from_static(b"CC"),
        ]);
    }
}
