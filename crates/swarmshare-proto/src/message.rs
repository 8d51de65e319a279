use bytes::{BufMut, Bytes, BytesMut};
use std::io;

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Message type tags. On the wire each tag is a single ASCII digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Choke = b'0',
    Unchoke = b'1',
    Interested = b'2',
    NotInterested = b'3',
    Have = b'4',
    Bitfield = b'5',
    Request = b'6',
    Piece = b'7',
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            b'0' => Self::Choke,
            b'1' => Self::Unchoke,
            b'2' => Self::Interested,
            b'3' => Self::NotInterested,
            b'4' => Self::Have,
            b'5' => Self::Bitfield,
            b'6' => Self::Request,
            b'7' => Self::Piece,
            _ => return None,
        };
        Some(kind)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A raw length-prefixed frame: one type byte followed by an opaque payload.
///
/// The tag is kept as a plain byte so frames with unknown types survive
/// decoding and can be skipped by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Encode as `length (u32 BE) | tag | payload`, where length covers tag and payload.
    pub fn encode(&self) -> BytesMut {
        let len = 1 + self.payload.len();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + len);
        buf.put_u32(len as u32);
        buf.put_u8(self.tag);
        buf.put_slice(&self.payload);
        buf
    }

    /// Decode a frame body (everything after the length prefix).
    /// `length` is the value read from the prefix.
    pub fn decode_body(length: u32, body: &[u8]) -> Result<Self, io::Error> {
        if length == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "zero-length frame"));
        }
        if body.len() != length as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body is {} bytes, prefix says {}", body.len(), length),
            ));
        }
        Ok(Self {
            tag: body[0],
            payload: Bytes::copy_from_slice(&body[1..]),
        })
    }

    /// Decode a frame from the front of `buf`.
    /// Returns (frame, bytes_consumed) or None if more data needed
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, io::Error> {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let total_len = LENGTH_PREFIX_LEN + length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }
        let frame = Self::decode_body(length, &buf[LENGTH_PREFIX_LEN..total_len])?;
        Ok(Some((frame, total_len)))
    }
}

/// Peer wire protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Stop serving requests from the receiver
    Choke,
    /// Allow the receiver to request pieces
    Unchoke,
    /// Sender wants a piece the receiver holds
    Interested,
    /// Sender wants nothing the receiver holds
    NotInterested,
    /// Sender has acquired a piece
    Have(u32),
    /// Sender's full availability vector, packed MSB-first
    Bitfield(Bytes),
    /// Ask for a whole piece
    Request(u32),
    /// A whole piece
    Piece { index: u32, data: Bytes },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Choke => MessageKind::Choke,
            Message::Unchoke => MessageKind::Unchoke,
            Message::Interested => MessageKind::Interested,
            Message::NotInterested => MessageKind::NotInterested,
            Message::Have(_) => MessageKind::Have,
            Message::Bitfield(_) => MessageKind::Bitfield,
            Message::Request(_) => MessageKind::Request,
            Message::Piece { .. } => MessageKind::Piece,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let tag = self.kind().tag();
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                Frame::new(tag, Bytes::new())
            }
            Message::Have(index) | Message::Request(index) => {
                Frame::new(tag, Bytes::copy_from_slice(&encode_index(*index)))
            }
            Message::Bitfield(bits) => Frame::new(tag, bits.clone()),
            Message::Piece { index, data } => {
                let mut payload = BytesMut::with_capacity(4 + data.len());
                payload.put_slice(&encode_index(*index));
                payload.put_slice(data);
                Frame::new(tag, payload.freeze())
            }
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> BytesMut {
        self.to_frame().encode()
    }

    /// Interpret a frame. Unknown tags yield `Ok(None)`; known tags with a
    /// malformed payload are an `InvalidData` error.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, io::Error> {
        let Some(kind) = MessageKind::from_tag(frame.tag) else {
            return Ok(None);
        };
        let payload = &frame.payload;
        let message = match kind {
            MessageKind::Choke => Message::Choke,
            MessageKind::Unchoke => Message::Unchoke,
            MessageKind::Interested => Message::Interested,
            MessageKind::NotInterested => Message::NotInterested,
            MessageKind::Have => {
                if payload.len() != 4 {
                    return Err(invalid("have payload must be 4 bytes"));
                }
                Message::Have(decode_index(payload)?)
            }
            MessageKind::Bitfield => Message::Bitfield(payload.clone()),
            MessageKind::Request => {
                if payload.len() != 4 {
                    return Err(invalid("request payload must be 4 bytes"));
                }
                Message::Request(decode_index(payload)?)
            }
            MessageKind::Piece => {
                if payload.len() < 4 {
                    return Err(invalid("piece message too short"));
                }
                let index = decode_index(payload)?;
                Message::Piece {
                    index,
                    data: payload.slice(4..),
                }
            }
        };
        Ok(Some(message))
    }
}

// Piece indices travel as signed 32-bit integers.
fn encode_index(index: u32) -> [u8; 4] {
    (index as i32).to_be_bytes()
}

fn decode_index(payload: &[u8]) -> Result<u32, io::Error> {
    let raw = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    u32::try_from(raw).map_err(|_| invalid("negative piece index"))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let encoded = msg.encode();
        let (frame, consumed) = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        Message::from_frame(&frame).unwrap().unwrap()
    }

    #[test]
    fn test_simple_messages_use_ascii_tags() {
        let cases = [
            (Message::Choke, b'0'),
            (Message::Unchoke, b'1'),
            (Message::Interested, b'2'),
            (Message::NotInterested, b'3'),
        ];
        for (msg, tag) in cases {
            let encoded = msg.encode();
            assert_eq!(&encoded[..], &[0, 0, 0, 1, tag]);
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_have_layout() {
        let encoded = Message::Have(258).encode();
        assert_eq!(&encoded[..], &[0, 0, 0, 5, b'4', 0, 0, 1, 2]);
        assert_eq!(roundtrip(Message::Have(258)), Message::Have(258));
    }

    #[test]
    fn test_request_and_piece_roundtrip() {
        assert_eq!(roundtrip(Message::Request(9)), Message::Request(9));

        let msg = Message::Piece {
            index: 3,
            data: Bytes::from(vec![7u8; 100]),
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 4 + 1 + 4 + 100);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_empty_piece_payload() {
        let msg = Message::Piece {
            index: 0,
            data: Bytes::new(),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_frame_roundtrip_for_arbitrary_payload() {
        for tag in b'0'..=b'7' {
            let frame = Frame::new(tag, vec![tag, 0xff, 0x00, 0x10]);
            let encoded = frame.encode();
            let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
            assert_eq!(length, 5);
            let decoded = Frame::decode_body(length, &encoded[4..]).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_partial_frame() {
        let encoded = Message::Have(123).encode();
        assert!(Frame::decode(&encoded[..3]).unwrap().is_none());
        assert!(Frame::decode(&encoded[..8]).unwrap().is_none());
        assert!(Frame::decode(&encoded).unwrap().is_some());
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let frame = Frame::new(b'9', vec![1, 2, 3]);
        assert_eq!(Message::from_frame(&frame).unwrap(), None);
    }

    #[test]
    fn test_malformed_payloads() {
        let short_have = Frame::new(b'4', vec![0, 1]);
        assert!(Message::from_frame(&short_have).is_err());

        let negative = Frame::new(b'6', (-1i32).to_be_bytes().to_vec());
        assert!(Message::from_frame(&negative).is_err());

        let short_piece = Frame::new(b'7', vec![0, 0]);
        assert!(Message::from_frame(&short_piece).is_err());

        assert!(Frame::decode_body(0, &[]).is_err());
        assert!(Frame::decode_body(4, &[b'0']).is_err());
    }
}
