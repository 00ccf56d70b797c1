//! Newline framing for worker output streams.
//!
//! Worker stdout/stderr arrive in arbitrary chunks. A record can be split
//! across any number of reads, and one read can carry several records, so the
//! framer keeps the unterminated tail between calls and only emits records
//! once their newline has been seen.

use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Splits a byte stream into newline-terminated text records.
///
/// Used directly through [`LineFramer::feed`] or as a `Decoder` under
/// `FramedRead`, in which case the pending tail lives in the `FramedRead`
/// buffer instead of `self.pending`.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: BytesMut,
    /// Bytes of the source buffer already scanned for a newline.
    next_index: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every record it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut pending = std::mem::take(&mut self.pending);
        let mut records = Vec::new();
        while let Some(record) = self.next_record(&mut pending) {
            records.push(record);
        }
        self.pending = pending;
        records
    }

    /// Flush the unterminated tail as a final record (end of stream).
    pub fn finish(&mut self) -> Option<String> {
        let mut pending = std::mem::take(&mut self.pending);
        self.next_index = 0;
        let tail = decode_record(&pending.split());
        (!tail.trim().is_empty()).then_some(tail)
    }

    /// Size of the retained unterminated tail.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn next_record(&mut self, src: &mut BytesMut) -> Option<String> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = src.split_to(end);
                    src.advance(1);
                    let record = decode_record(&line);
                    if record.trim().is_empty() {
                        continue;
                    }
                    return Some(record);
                }
                None => {
                    self.next_index = src.len();
                    return None;
                }
            }
        }
    }
}

fn decode_record(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for LineFramer {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.next_record(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(record) = self.next_record(src) {
            return Ok(Some(record));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let tail = decode_record(&src.split());
        if tail.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(tail))
        }
    }
}
