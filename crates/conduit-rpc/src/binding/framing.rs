// crates/conduit-rpc/src/binding/framing.rs
//
// Frame codec for the duplex bindings.
//
// Two framings are supported:
//   lines             one UTF-8 JSON document per `\n`-terminated line
//   length_delimited  4-byte big-endian length prefix, then the payload
//
// Both decode to `Bytes` so the bindings never care which one is in use.

use std::io;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LinesCodec, LinesCodecError};

/// Default cap on a single inbound frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Wire framing selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Lines,
    LengthDelimited,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framing::Lines => write!(f, "lines"),
            Framing::LengthDelimited => write!(f, "length_delimited"),
        }
    }
}

/// Codec over either framing.
#[derive(Debug, Clone)]
pub enum FrameCodec {
    Lines(LinesCodec),
    LengthDelimited(LengthDelimitedCodec),
}

impl FrameCodec {
    pub fn new(framing: Framing, max_frame_length: usize) -> Self {
        match framing {
            Framing::Lines => FrameCodec::Lines(LinesCodec::new_with_max_length(max_frame_length)),
            Framing::LengthDelimited => FrameCodec::LengthDelimited(
                LengthDelimitedCodec::builder()
                    .max_frame_length(max_frame_length)
                    .new_codec(),
            ),
        }
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "frame exceeds max length")
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        match self {
            FrameCodec::Lines(codec) => codec
                .decode(src)
                .map(|line| line.map(Bytes::from))
                .map_err(lines_error),
            FrameCodec::LengthDelimited(codec) => {
                codec.decode(src).map(|frame| frame.map(BytesMut::freeze))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        match self {
            FrameCodec::Lines(codec) => codec
                .decode_eof(src)
                .map(|line| line.map(Bytes::from))
                .map_err(lines_error),
            FrameCodec::LengthDelimited(codec) => {
                codec.decode_eof(src).map(|frame| frame.map(BytesMut::freeze))
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        match self {
            FrameCodec::Lines(codec) => {
                let text = std::str::from_utf8(&item)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                codec.encode(text, dst).map_err(lines_error)
            }
            FrameCodec::LengthDelimited(codec) => codec.encode(item, dst),
        }
    }
}
