pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod peer_id;

pub use bitfield::Bitfield;
pub use handshake::{
	Handshake,
	HandshakeError,
	HANDSHAKE_HEADER,
	HANDSHAKE_LEN,
	ZERO_PADDING_LEN,
};
pub use message::{Frame, Message, MessageKind, LENGTH_PREFIX_LEN};
pub use peer_id::{PeerId, PEER_ID_LEN};
