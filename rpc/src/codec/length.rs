//! `Content-Length` framing for JSON payloads.
//!
//! The language server and the debug adapter both speak
//! `Content-Length: N\r\n\r\n{json}` over stdout. Pipe reads land on
//! arbitrary boundaries, so [`LengthPrefixedDecoder`] keeps every byte it
//! has not yet consumed and yields a frame only once all `N` payload bytes
//! are present. `N` counts encoded bytes, never characters.
//!
//! A header block without a usable length leaves the stream position
//! unknown. The decoder then skips ahead to the next `Content-Length` name
//! before looking for another header.

use serde::Serialize;
use serde_json::Value;

use crate::error::FrameError;

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &[u8] = b"Content-Length";

/// Incremental decoder for `Content-Length` framed JSON.
///
/// Consumed bytes are dropped from the front of the accumulator, so nothing
/// that has already been yielded can be decoded twice.
#[derive(Debug, Default)]
pub struct LengthPrefixedDecoder {
    buffer: Vec<u8>,
    resyncing: bool,
}

impl LengthPrefixedDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk as received from the pipe.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// Returns `None` when more bytes are needed. A non-fatal `Err` means the
    /// offending bytes were consumed and decoding can continue; see
    /// [`FrameError::is_fatal`].
    pub fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        if self.resyncing && !self.skip_to_next_header() {
            return None;
        }

        let Some(header_end) = find_subsequence(&self.buffer, HEADER_TERMINATOR) else {
            if self.buffer.len() > MAX_FRAME_BYTES {
                let buffered = self.buffer.len();
                self.buffer.clear();
                return Some(Err(FrameError::UnterminatedHeader {
                    buffered,
                    max: MAX_FRAME_BYTES,
                }));
            }
            return None;
        };
        let header_len = header_end + HEADER_TERMINATOR.len();

        let content_length = match parse_content_length(&self.buffer[..header_end]) {
            Ok(len) => len,
            Err(err) => {
                self.buffer.drain(..header_len);
                self.resyncing = true;
                return Some(Err(err));
            }
        };

        if content_length > MAX_FRAME_BYTES {
            self.buffer.clear();
            return Some(Err(FrameError::Oversized {
                declared: content_length,
                max: MAX_FRAME_BYTES,
            }));
        }

        let frame_len = header_len + content_length;
        if self.buffer.len() < frame_len {
            return None;
        }

        let parsed = serde_json::from_slice(&self.buffer[header_len..frame_len])
            .map_err(FrameError::Json);
        self.buffer.drain(..frame_len);
        Some(parsed)
    }

    /// Drop bytes up to the next `Content-Length` name.
    ///
    /// Returns `false` when none is buffered yet; a tail that could be the
    /// start of the name is kept for the next chunk.
    fn skip_to_next_header(&mut self) -> bool {
        if let Some(start) = find_header_name(&self.buffer) {
            self.buffer.drain(..start);
            self.resyncing = false;
            return true;
        }
        let keep = CONTENT_LENGTH.len() - 1;
        let cut = self.buffer.len().saturating_sub(keep);
        self.buffer.drain(..cut);
        false
    }

    /// Append `chunk` and drain every frame it completes.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Value, FrameError>> {
        self.extend(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Bytes received but not yet consumed into a frame.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.resyncing = false;
    }
}

/// Serialize `msg` and prepend its `Content-Length` header.
pub fn encode_frame<T: Serialize + ?Sized>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(msg)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_header_name(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(CONTENT_LENGTH.len())
        .position(|window| window.eq_ignore_ascii_case(CONTENT_LENGTH))
}

/// Scan a header block for `Content-Length`.
///
/// Lines end at `\n` with any `\r` trimmed, so a stray line the tool
/// printed ahead of the header does not hide it. The name is matched
/// case-insensitively; other headers (e.g. `Content-Type`) are ignored.
fn parse_content_length(block: &[u8]) -> Result<usize, FrameError> {
    let text = String::from_utf8_lossy(block);
    let mut content_length = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let value = value.trim();
            let len = value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
            content_length = Some(len);
        }
    }

    content_length.ok_or(FrameError::MissingContentLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &str) -> Vec<u8> {
        let mut bytes = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        bytes.extend_from_slice(body.as_bytes());
        bytes
    }

    fn ok_frames(results: Vec<Result<Value, FrameError>>) -> Vec<Value> {
        results.into_iter().map(Result::unwrap).collect()
    }

    #[test]
    fn test_single_frame() {
        let mut decoder = LengthPrefixedDecoder::new();
        let frames = ok_frames(decoder.decode(&frame(r#"{"jsonrpc":"2.0","id":1}"#)));
        assert_eq!(frames, vec![serde_json::json!({"jsonrpc": "2.0", "id": 1})]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_every_split_point_yields_same_frame() {
        let body = r#"{"jsonrpc":"2.0","method":"window/logMessage","params":{"message":"مرحبا بالعالم"}}"#;
        let bytes = frame(body);
        let expected: Value = serde_json::from_str(body).unwrap();

        for split in 0..=bytes.len() {
            let mut decoder = LengthPrefixedDecoder::new();
            let mut frames = ok_frames(decoder.decode(&bytes[..split]));
            frames.extend(ok_frames(decoder.decode(&bytes[split..])));
            assert_eq!(frames, vec![expected.clone()], "split at byte {split}");
            assert_eq!(decoder.buffered_len(), 0);
        }
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let bytes = frame(r#"{"k":"ترقيم"}"#);
        let mut decoder = LengthPrefixedDecoder::new();
        let mut frames = Vec::new();
        for byte in &bytes {
            frames.extend(ok_frames(decoder.decode(std::slice::from_ref(byte))));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["k"], "ترقيم");
    }

    #[test]
    fn test_declared_length_is_exact_byte_count() {
        // `{"jsonrpc":"2"}` is exactly 15 bytes; the trailing bytes belong to
        // the next frame and must stay buffered.
        let mut bytes = b"Content-Length: 15\r\n\r\n{\"jsonrpc\":\"2\"}".to_vec();
        bytes.extend_from_slice(b"Content-Len");

        let mut decoder = LengthPrefixedDecoder::new();
        let frames = ok_frames(decoder.decode(&bytes));
        let direct: Value = serde_json::from_slice(b"{\"jsonrpc\":\"2\"}").unwrap();
        assert_eq!(frames, vec![direct]);
        assert_eq!(decoder.buffered_len(), "Content-Len".len());
    }

    #[test]
    fn test_multibyte_payload_uses_byte_length() {
        // Each Arabic letter is two bytes; a character count would under-read.
        let body = r#"{"text":"خطأ في السطر"}"#;
        assert!(body.len() > body.chars().count());
        let mut bytes = frame(body);
        bytes.extend(frame(r#"{"id":2}"#));

        let mut decoder = LengthPrefixedDecoder::new();
        let frames = ok_frames(decoder.decode(&bytes));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["text"], "خطأ في السطر");
        assert_eq!(frames[1]["id"], 2);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut bytes = frame(r#"{"id":1}"#);
        bytes.extend(frame(r#"{"id":2}"#));
        bytes.extend(frame(r#"{"id":3}"#));

        let mut decoder = LengthPrefixedDecoder::new();
        let ids: Vec<_> = ok_frames(decoder.decode(&bytes))
            .iter()
            .map(|f| f["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_malformed_body_does_not_desync_next_frame() {
        let mut bytes = frame("not valid json!!!");
        bytes.extend(frame(r#"{"id":7}"#));

        let mut decoder = LengthPrefixedDecoder::new();
        let results = decoder.decode(&bytes);
        assert_eq!(results.len(), 2);
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
        assert!(!err.is_fatal());
        assert_eq!(results[1].as_ref().unwrap()["id"], 7);
    }

    #[test]
    fn test_missing_content_length_drops_header_block() {
        let mut bytes = b"Content-Type: application/json\r\n\r\n".to_vec();
        bytes.extend(frame(r#"{"id":1}"#));

        let mut decoder = LengthPrefixedDecoder::new();
        let results = decoder.decode(&bytes);
        assert!(matches!(results[0], Err(FrameError::MissingContentLength)));
        assert_eq!(results[1].as_ref().unwrap()["id"], 1);
    }

    #[test]
    fn test_bad_header_with_body_does_not_lose_later_frames() {
        let mut bytes = b"Content-Length: 8x\r\n\r\n{\"id\":0}".to_vec();
        for id in 1..=3 {
            bytes.extend(frame(&format!(r#"{{"id":{id}}}"#)));
        }

        let mut decoder = LengthPrefixedDecoder::new();
        let results = decoder.decode(&bytes);
        assert_eq!(results.len(), 4);
        assert!(matches!(&results[0], Err(FrameError::InvalidContentLength(v)) if v == "8x"));
        let ids: Vec<_> = results[1..]
            .iter()
            .map(|r| r.as_ref().unwrap()["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_skipping_after_bad_header_spans_chunks() {
        let mut decoder = LengthPrefixedDecoder::new();
        let results = decoder.decode(b"Content-Length: -1\r\n\r\n{\"partial\":");
        assert!(matches!(results[..], [Err(FrameError::InvalidContentLength(_))]));

        // The rest of the orphaned body, then a frame whose name is split.
        assert!(decoder.decode(b"\"body\"}\nContent-Le").is_empty());
        let frames = ok_frames(decoder.decode(&frame(r#"{"id":9}"#)["Content-Le".len()..]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], 9);
    }

    #[test]
    fn test_stray_line_before_header() {
        let mut bytes = b"warning: something\n".to_vec();
        for id in 1..=3 {
            bytes.extend(frame(&format!(r#"{{"id":{id}}}"#)));
        }

        let mut decoder = LengthPrefixedDecoder::new();
        let ids: Vec<_> = ok_frames(decoder.decode(&bytes))
            .iter()
            .map(|f| f["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_unterminated_header_is_bounded() {
        let mut decoder = LengthPrefixedDecoder::new();
        let noise = vec![b'x'; MAX_FRAME_BYTES];
        assert!(decoder.decode(&noise).is_empty());

        let results = decoder.decode(b"x");
        match &results[..] {
            [Err(err @ FrameError::UnterminatedHeader { buffered, .. })] => {
                assert!(err.is_fatal());
                assert_eq!(*buffered, MAX_FRAME_BYTES + 1);
            }
            other => panic!("expected UnterminatedHeader, got {other:?}"),
        }
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_invalid_content_length_value() {
        let mut decoder = LengthPrefixedDecoder::new();
        let results = decoder.decode(b"Content-Length: not_a_number\r\n\r\n");
        match &results[..] {
            [Err(FrameError::InvalidContentLength(value))] => assert_eq!(value, "not_a_number"),
            other => panic!("expected InvalidContentLength, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut decoder = LengthPrefixedDecoder::new();
        let results = decoder.decode(header.as_bytes());
        assert!(results[0].as_ref().unwrap_err().is_fatal());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_case_insensitive_content_length_and_extra_headers() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let bytes = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len(),
        );

        let mut decoder = LengthPrefixedDecoder::new();
        let frames = ok_frames(decoder.decode(bytes.as_bytes()));
        assert_eq!(frames[0]["id"], 1);
    }

    #[test]
    fn test_incomplete_body_waits() {
        let mut decoder = LengthPrefixedDecoder::new();
        assert!(decoder.decode(b"Content-Length: 100\r\n\r\nhello").is_empty());
        assert_eq!(decoder.buffered_len(), "Content-Length: 100\r\n\r\nhello".len());
    }

    #[test]
    fn test_clear_discards_partial_frame() {
        let mut decoder = LengthPrefixedDecoder::new();
        decoder.extend(b"Content-Length: 10\r\n\r\n{\"a\"");
        decoder.clear();
        assert_eq!(decoder.buffered_len(), 0);
        let frames = ok_frames(decoder.decode(&frame(r#"{"id":1}"#)));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_encode_content_length_is_byte_count() {
        let msg = serde_json::json!({"k": "é"});
        let encoded = encode_frame(&msg).unwrap();
        let body = serde_json::to_string(&msg).unwrap();
        let output = String::from_utf8(encoded.clone()).unwrap();
        assert!(output.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));

        let mut decoder = LengthPrefixedDecoder::new();
        assert_eq!(ok_frames(decoder.decode(&encoded)), vec![msg]);
    }
}
