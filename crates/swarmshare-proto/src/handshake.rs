use bytes::BytesMut;
use thiserror::Error;

use crate::peer_id::{PeerId, PEER_ID_LEN};

pub const HANDSHAKE_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";
pub const ZERO_PADDING_LEN: usize = 10;
pub const HANDSHAKE_LEN: usize = HANDSHAKE_HEADER.len() + ZERO_PADDING_LEN + PEER_ID_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
	pub peer_id: PeerId,
}

impl Handshake {
	pub fn new(peer_id: PeerId) -> Self {
		Self { peer_id }
	}

	pub fn encode(&self) -> BytesMut {
		let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
		buf.extend_from_slice(HANDSHAKE_HEADER);
		buf.extend_from_slice(&[0u8; ZERO_PADDING_LEN]);
		buf.extend_from_slice(&self.peer_id.to_wire());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
		if bytes.len() != HANDSHAKE_LEN {
			return Err(HandshakeError::Length(bytes.len()));
		}
		let (header, rest) = bytes.split_at(HANDSHAKE_HEADER.len());
		if header != HANDSHAKE_HEADER {
			return Err(HandshakeError::Header);
		}
		let id_bytes = &rest[ZERO_PADDING_LEN..];
		let peer_id = PeerId::from_wire(id_bytes).ok_or(HandshakeError::PeerId)?;
		Ok(Self { peer_id })
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
	#[error("invalid handshake length: {0}")]
	Length(usize),
	#[error("invalid handshake header")]
	Header,
	#[error("invalid peer id in handshake")]
	PeerId,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_decode_roundtrip() {
		let hs = Handshake::new(PeerId::new("1002"));
		let buf = hs.encode();
		assert_eq!(buf.len(), HANDSHAKE_LEN);
		assert_eq!(&buf[..18], b"P2PFILESHARINGPROJ");
		assert!(buf[18..28].iter().all(|&b| b == 0));
		assert_eq!(&buf[28..], b"1002");
		let decoded = Handshake::decode(&buf).expect("decode");
		assert_eq!(decoded, hs);
	}

	#[test]
	fn rejects_wrong_length() {
		let buf = Handshake::new(PeerId::new("1002")).encode();
		assert_eq!(Handshake::decode(&buf[..31]), Err(HandshakeError::Length(31)));
	}

	#[test]
	fn rejects_foreign_header() {
		let mut buf = Handshake::new(PeerId::new("1002")).encode();
		buf[0] = b'X';
		assert_eq!(Handshake::decode(&buf), Err(HandshakeError::Header));
	}
}
