use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::message::{Message, Request};

/// Longest accepted request line
const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum JsonCodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line error: {0}")]
    Lines(#[from] LinesCodecError),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Newline-delimited JSON codec
///
/// Lines that are not valid requests are decoded as `Err` items so the connection survives them.
pub struct JsonCodec {
    lines: LinesCodec,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonCodec {
    type Item = serde_json::Result<Request>;
    type Error = JsonCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(serde_json::from_str(&line))),
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Message> for JsonCodec {
    type Error = JsonCodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = serde_json::to_string(&item)?;
        Ok(self.lines.encode(encoded, dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::json::message::Response;

    #[test]
    fn test_decode() {
        let mut codec = JsonCodec::new();
        let mut src = BytesMut::from(
            &b"{\"type\":\"rq\",\"id\":3,\"method\":\"getState\"}\n\nnot json\n{\"type\""[..],
        );

        let request = codec.decode(&mut src).unwrap().unwrap().unwrap();
        assert_eq!(request.id, 3);
        assert_eq!(request.method, "getState");
        assert!(request.data.is_null());

        assert!(codec.decode(&mut src).unwrap().unwrap().is_err());
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_encode() {
        let mut codec = JsonCodec::new();
        let mut dst = BytesMut::new();

        codec
            .encode(Message::Response(Response::error(4, "Bad request")), &mut dst)
            .unwrap();

        assert_eq!(
            &dst[..],
            &b"{\"type\":\"rp\",\"id\":4,\"error\":\"Bad request\"}\n"[..]
        );
    }
}
