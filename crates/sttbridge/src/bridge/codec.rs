//! Framed codec for worker communication.
//!
//! Uses LineFramer for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (child pipes, sockets, in-memory duplex).

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::framer::LineFramer;
use super::protocol::{Command, InboundMessage};

/// One framed record from the worker's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(InboundMessage),
    /// Record that is not a protocol message (startup banners, shutdown text,
    /// stray prints). Never a codec error, so one bad line cannot end the stream.
    Malformed { line: String, error: String },
}

/// Codec that frames records by newline and serializes with JSON.
///
/// Wraps LineFramer and adds serde_json (de)serialization.
#[derive(Debug, Default)]
pub struct MessageCodec {
    inner: LineFramer,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous framing for callers that do their own reads.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.inner.feed(chunk).into_iter().map(parse_record).collect()
    }
}

/// Decode one complete record.
pub fn parse_record(line: String) -> Frame {
    match serde_json::from_str::<InboundMessage>(&line) {
        Ok(msg) => Frame::Message(msg),
        Err(e) => Frame::Malformed {
            line,
            error: e.to_string(),
        },
    }
}

/// Serialize a command as one newline-terminated record.
pub fn encode_command(command: &Command) -> io::Result<Vec<u8>> {
    let mut json =
        serde_json::to_vec(command).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    json.push(b'\n');
    Ok(json)
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(parse_record))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode_eof(src)?.map(parse_record))
    }
}

impl Encoder<Command> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let record = encode_command(&item)?;
        tracing::trace!(command = item.name(), record_bytes = record.len(), "Encoding command");
        dst.reserve(record.len());
        dst.put_slice(&record);
        Ok(())
    }
}
