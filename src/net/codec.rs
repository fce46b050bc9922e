//! Unsigned-varint length-delimited protobuf framing.

use prost::Message as _;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::pb::Message;
use crate::error::Error;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 << 20;

const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct DelimitedCodec {
    max_size: usize,
}

impl DelimitedCodec {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for DelimitedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Parse a varint prefix; `None` until enough bytes have arrived.
fn read_uvarint(src: &[u8]) -> Result<Option<(u64, usize)>, Error> {
    let mut value = 0u64;
    for (i, b) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(Error::StreamReset("length prefix overflows".into()));
    }
    Ok(None)
}

impl Decoder for DelimitedCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        let Some((len, header)) = read_uvarint(src)? else {
            return Ok(None);
        };
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > self.max_size {
            return Err(Error::StreamReset(format!("message of {} bytes exceeds {}", len, self.max_size)));
        }
        if src.len() < header + len {
            src.reserve(header + len - src.len());
            return Ok(None);
        }
        src.advance(header);
        let frame = src.split_to(len);
        Message::decode(frame.freeze())
            .map(Some)
            .map_err(|e| Error::StreamReset(format!("undecodable message: {}", e)))
    }
}

impl Encoder<Message> for DelimitedCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Error> {
        let len = item.encoded_len();
        if len > self.max_size {
            return Err(Error::StreamReset(format!("message of {} bytes exceeds {}", len, self.max_size)));
        }
        dst.reserve(len + MAX_VARINT_LEN);
        item.encode_length_delimited(dst)
            .map_err(|e| Error::StreamReset(format!("encode failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::pb::MessageType;

    fn msg(payload_len: usize) -> Message {
        Message::new(MessageType::Chat, vec![0xab; payload_len])
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = DelimitedCodec::default();
        let mut full = BytesMut::new();
        codec.encode(msg(300), &mut full).unwrap();
        // two-byte varint for a 300+ byte body
        assert!(full[0] & 0x80 != 0);

        let mut partial = BytesMut::from(&full[..1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        assert_eq!(codec.decode(&mut full).unwrap(), Some(msg(300)));
        assert!(full.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = DelimitedCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(msg(1), &mut buf).unwrap();
        codec.encode(msg(2), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg(2)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = DelimitedCodec::new(16);
        let mut buf = BytesMut::new();
        assert!(matches!(codec.encode(msg(64), &mut buf), Err(Error::StreamReset(_))));

        // announce 1000 bytes
        let mut buf = BytesMut::from(&[0xe8, 0x07][..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::StreamReset(_))));
    }

    #[test]
    fn garbage_prefix_is_an_error() {
        let mut codec = DelimitedCodec::default();
        let mut buf = BytesMut::from(&[0xff; 12][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
