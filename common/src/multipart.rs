//! `multipart/x-mixed-replace` framing for MJPEG streams.
//!
//! Wire format of one part:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```

use bytes::{Buf, Bytes, BytesMut};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const BOUNDARY_LINE: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Frame one JPEG image as a multipart body chunk.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    buf.extend_from_slice(PART_HEADER);
    buf.extend_from_slice(jpeg);
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// One decoded part: its headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Part {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Parse state for the multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting body bytes until the next boundary.
    CollectingBody,
}

/// Incremental parser for an MJPEG multipart body.
///
/// Feed it chunks as they arrive; parts are returned once the boundary that
/// terminates them has been seen, so the final part of a stream is only
/// emitted when the next boundary arrives.
#[derive(Debug)]
pub struct MultipartParser {
    buffer: BytesMut,
    state: ParseState,
    headers: Vec<(String, String)>,
    /// Offset into `buffer` already scanned for the next boundary.
    scan_from: usize,
}

impl Default for MultipartParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            headers: Vec::new(),
            scan_from: 0,
        }
    }

    /// Append a chunk and return every part it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Part> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY_LINE) {
                        self.buffer.advance(pos + BOUNDARY_LINE.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks.
                        if self.buffer.len() > BOUNDARY_LINE.len() {
                            let excess = self.buffer.len() - BOUNDARY_LINE.len();
                            self.buffer.advance(excess);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if self.buffer.starts_with(b"\r\n") {
                        // A part with no headers at all.
                        self.buffer.advance(2);
                        self.headers.clear();
                        self.scan_from = 0;
                        self.state = ParseState::CollectingBody;
                    } else if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let raw = self.buffer.split_to(pos + HEADER_END.len());
                        self.headers = parse_headers(&raw[..pos]);
                        self.scan_from = 0;
                        self.state = ParseState::CollectingBody;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingBody => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], BOUNDARY_LINE)
                    else {
                        self.scan_from = self.buffer.len().saturating_sub(BOUNDARY_LINE.len());
                        break;
                    };
                    let body_end = self.scan_from + pos;
                    // Strip the CRLF that precedes the boundary.
                    let end = if self.buffer[..body_end].ends_with(b"\r\n") {
                        body_end - 2
                    } else {
                        body_end
                    };
                    let body = self.buffer[..end].to_vec();
                    self.buffer.advance(body_end + BOUNDARY_LINE.len());

                    if !body.is_empty() {
                        parts.push(Part {
                            headers: std::mem::take(&mut self.headers),
                            body,
                        });
                    }
                    // Already past the boundary.
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        parts
    }
}

fn parse_headers(raw: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(raw)
        .split("\r\n")
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_A: &[u8] = &[0xFF, 0xD8, 0x01, 0x02, 0x03, 0xFF, 0xD9];
    const JPEG_B: &[u8] = &[0xFF, 0xD8, 0x0A, 0x0B, 0xFF, 0xD9];

    fn stream_of(parts: &[&[u8]]) -> Vec<u8> {
        parts.iter().flat_map(|p| encode_part(p).to_vec()).collect()
    }

    #[test]
    fn encoded_part_layout() {
        let part = encode_part(JPEG_A);
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(b"\xFF\xD9\r\n"));
        assert_eq!(part.len(), PART_HEADER.len() + JPEG_A.len() + 2);
    }

    #[test]
    fn part_is_emitted_when_next_boundary_arrives() {
        let mut parser = MultipartParser::new();
        assert!(parser.push(&encode_part(JPEG_A)).is_empty());

        let parts = parser.push(&encode_part(JPEG_B));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].body, JPEG_A);
        assert_eq!(parts[0].header("content-type"), Some("image/jpeg"));
    }

    #[test]
    fn byte_by_byte_feed_recovers_all_parts() {
        let mut bytes = stream_of(&[JPEG_A, JPEG_B, JPEG_A]);
        bytes.extend_from_slice(BOUNDARY_LINE);

        let mut parser = MultipartParser::new();
        let mut parts = Vec::new();
        for byte in bytes {
            parts.extend(parser.push(&[byte]));
        }
        let bodies: Vec<_> = parts.iter().map(|p| p.body.as_slice()).collect();
        assert_eq!(bodies, vec![JPEG_A, JPEG_B, JPEG_A]);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut bytes = b"HTTP preamble that is not part of any frame".to_vec();
        bytes.extend(stream_of(&[JPEG_B]));
        bytes.extend_from_slice(BOUNDARY_LINE);

        let parts = MultipartParser::new().push(&bytes);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].body, JPEG_B);
    }

    #[test]
    fn extra_headers_are_kept() {
        let mut bytes = b"--frame\r\nContent-Type: image/jpeg\r\nX-Sequence: 9\r\n\r\n".to_vec();
        bytes.extend_from_slice(JPEG_A);
        bytes.extend_from_slice(b"\r\n--frame\r\n");

        let parts = MultipartParser::new().push(&bytes);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].header("X-Sequence"), Some("9"));
        assert_eq!(parts[0].body, JPEG_A);
    }
}
