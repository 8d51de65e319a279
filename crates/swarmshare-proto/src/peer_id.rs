use std::fmt;
use std::str::FromStr;

/// Number of bytes a peer id occupies on the wire.
pub const PEER_ID_LEN: usize = 4;

/// Identifier of a swarm member, stable for the lifetime of its process.
///
/// Ids are short ASCII strings (`"1001"`). On the wire they take exactly
/// [`PEER_ID_LEN`] bytes, zero-padded or truncated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed-width wire form of the id.
    pub fn to_wire(&self) -> [u8; PEER_ID_LEN] {
        let mut out = [0u8; PEER_ID_LEN];
        let raw = self.0.as_bytes();
        let len = raw.len().min(PEER_ID_LEN);
        out[..len].copy_from_slice(&raw[..len]);
        out
    }

    /// Parse the wire form, dropping zero padding. Returns `None` for ids
    /// that are empty or not valid UTF-8.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        if end == 0 {
            return None;
        }
        std::str::from_utf8(&bytes[..end]).ok().map(Self::new)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl FromStr for PeerId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_zero_padded() {
        let id = PeerId::new("7");
        assert_eq!(id.to_wire(), [b'7', 0, 0, 0]);
        assert_eq!(PeerId::from_wire(&id.to_wire()), Some(id));
    }

    #[test]
    fn long_ids_are_truncated() {
        let id = PeerId::new("100123");
        assert_eq!(&id.to_wire(), b"1001");
    }

    #[test]
    fn empty_wire_id_is_rejected() {
        assert_eq!(PeerId::from_wire(&[0, 0, 0, 0]), None);
        assert_eq!(PeerId::from_wire(&[0xff, 0xfe, 0, 0]), None);
    }
}
