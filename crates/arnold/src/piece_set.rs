//! Wrapper types around Bitvec.
use std::fmt;

use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Fixed-length set of piece indices.
///
/// Every owner keeps its own copy: the local catalog, the pieces a remote
/// peer announced, the pieces still missing. Sets are cloned when handed
/// over, never shared.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PieceSet(Bitfield);

impl PieceSet {
    /// An empty set over `len` pieces.
    pub fn new(len: usize) -> Self {
        Self(Bitfield::repeat(false, len))
    }

    /// A set over `len` pieces with every piece present.
    pub fn full(len: usize) -> Self {
        Self(Bitfield::repeat(true, len))
    }

    /// Rebuild a set from the raw bytes of a catalog, in MSB0 order.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bits = Bitfield::from_slice(bytes);
        bits.resize(len, false);
        Self(bits)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.0.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }

    pub fn as_bitfield(&self) -> &Bitfield {
        &self.0
    }

    /// Number of pieces this set ranges over.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set has no room for any piece.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pieces out of range are never present.
    pub fn get(&self, piece: usize) -> bool {
        self.0.get(piece).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, piece: usize) {
        if piece < self.len() {
            self.0.set(piece, true);
        }
    }

    pub fn clear(&mut self, piece: usize) {
        if piece < self.len() {
            self.0.set(piece, false);
        }
    }

    pub fn cardinality(&self) -> usize {
        self.0.count_ones()
    }

    /// True when no piece is present.
    pub fn none(&self) -> bool {
        self.0.not_any()
    }

    /// True when every piece is present.
    pub fn is_complete(&self) -> bool {
        !self.is_empty() && self.0.all()
    }

    pub fn and(&mut self, other: &PieceSet) {
        for i in 0..self.len() {
            if !other.get(i) {
                self.0.set(i, false);
            }
        }
    }

    pub fn or(&mut self, other: &PieceSet) {
        for i in other.iter() {
            self.set(i);
        }
    }

    /// Remove from `self` every piece present in `other`.
    pub fn and_not(&mut self, other: &PieceSet) {
        for i in other.iter() {
            self.clear(i);
        }
    }

    pub fn complement(&self) -> PieceSet {
        let mut res = PieceSet::new(self.len());
        for i in 0..self.len() {
            if !self.get(i) {
                res.0.set(i, true);
            }
        }
        res
    }

    pub fn intersects(&self, other: &PieceSet) -> bool {
        self.iter().any(|i| other.get(i))
    }

    /// Present pieces in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }
}

/// Compact listing of runs, such as `{0-3,5}`.
impl fmt::Display for PieceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let mut first = true;
        let mut pieces = self.iter().peekable();
        while let Some(start) = pieces.next() {
            let mut end = start;
            while pieces.peek() == Some(&(end + 1)) {
                end += 1;
                pieces.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        f.write_str("}")
    }
}

impl fmt::Debug for PieceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceSet({}/{} {})", self.cardinality(), self.len(), self)
    }
}

impl From<Bitfield> for PieceSet {
    fn from(value: Bitfield) -> Self {
        Self(value)
    }
}
