use bytes::Bytes;

/// Availability vector: bit `i` is set iff the owner holds piece `i`.
///
/// Bits are packed MSB-first, bit `i` living at byte `i / 8`, position
/// `7 - i % 8`. Spare bits in the last byte are always kept clear so two
/// vectors can be compared byte by byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece present.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Unpacks a wire payload. Missing trailing bytes read as zero, bits past
    /// `piece_count` are dropped.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let expected = piece_count.div_ceil(8);
        let mut bits = vec![0u8; expected];
        let n = bytes.len().min(expected);
        bits[..n].copy_from_slice(&bytes[..n]);
        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets bit `index`. Returns false when the index is out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        true
    }

    /// Number of pieces present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Pieces `theirs` holds that `self` lacks, ascending.
    pub fn wanted_from<'a>(&'a self, theirs: &'a Bitfield) -> impl Iterator<Item = usize> + 'a {
        (0..self.piece_count.min(theirs.piece_count)).filter(move |&i| theirs.has(i) && !self.has(i))
    }

    /// True iff `theirs` holds at least one piece `self` lacks.
    pub fn is_interested_in(&self, theirs: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(theirs.bits.iter())
            .any(|(ours, other)| other & !ours != 0)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
