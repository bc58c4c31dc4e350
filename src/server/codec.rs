/// Line codec: frames a TCP byte stream into protocol messages.
///
/// Splits on `\n` (a preceding `\r` is tolerated), decodes each line as one
/// JSON [`Message`], and serializes outgoing messages as a single line.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Maximum line length (excluding the terminator).
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Codec error. Everything except `Io` is the peer's fault and gets a reply.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error("line is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames JSON messages on newline boundaries.
#[derive(Debug, Default)]
pub struct StreamCodec {
    /// Bytes already scanned for a terminator; avoids rescanning partial lines.
    scanned: usize,
}

impl Decoder for StreamCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset);

            let Some(pos) = newline else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                self.scanned = src.len();
                return Ok(None);
            };

            self.scanned = 0;
            if pos > MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong);
            }

            let line_bytes = src.split_to(pos);
            src.advance(1); // skip \n

            let line = std::str::from_utf8(&line_bytes)?;

            // Blank keep-alive lines carry no message.
            if line.trim().is_empty() {
                continue;
            }

            return Ok(Some(Message::parse(line)?));
        }
    }
}

impl Encoder<Message> for StreamCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire()?;
        dst.reserve(wire.len() + 1);
        dst.put_slice(wire.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
