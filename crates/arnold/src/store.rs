//! Where the pieces of the shared file live.
use std::fmt::Debug;

use bytes::Bytes;
use sha1_smol::{Digest, Sha1};
use tracing::{debug, trace};

use crate::{error::Error, piece_set::PieceSet, wire::Chunk};

/// The pieces an engine owns, and the only place they are verified.
pub trait Store: Debug + Send {
    fn piece_count(&self) -> usize;

    /// Bytes in `piece`, only the last piece may be shorter.
    fn piece_size(&self, piece: usize) -> usize;

    fn is_valid_piece(&self, piece: usize) -> bool;

    fn known_pieces(&self) -> PieceSet;

    fn is_complete(&self) -> bool;

    fn read_chunk(&self, chunk: &Chunk) -> Result<Bytes, Error>;

    /// Verify `data` against the digest of `piece` and keep it if it
    /// matches. Returns whether it matched.
    fn store_piece(&mut self, piece: usize, data: Bytes) -> Result<bool, Error>;

    fn close(&mut self) -> Result<(), Error>;
}

/// A store of synthetic content, for simulations and tests.
///
/// Every byte of piece `i` is `i % 256`, so any node can compute the
/// reference digests without having the file.
#[derive(Debug)]
pub struct MemoryStore {
    file_size: usize,
    piece_size: usize,
    pieces: Vec<Option<Bytes>>,
    digests: Vec<Digest>,
    known: PieceSet,
}

impl MemoryStore {
    fn empty(file_size: usize, piece_size: usize) -> Self {
        let piece_size = piece_size.max(1);
        let count = file_size.div_ceil(piece_size);
        let mut store = Self {
            file_size,
            piece_size,
            pieces: vec![None; count],
            digests: Vec::with_capacity(count),
            known: PieceSet::new(count),
        };
        store.digests = (0..count)
            .map(|p| Sha1::from(store.content(p)).digest())
            .collect();
        store
    }

    /// A store that owns nothing yet.
    pub fn leecher(file_size: usize, piece_size: usize) -> Self {
        Self::empty(file_size, piece_size)
    }

    /// A store that owns the whole file.
    pub fn seeder(file_size: usize, piece_size: usize) -> Self {
        let mut store = Self::empty(file_size, piece_size);
        for p in 0..store.piece_count() {
            store.set_valid(p);
        }
        store
    }

    /// The content every node agrees on for `piece`.
    pub fn content(&self, piece: usize) -> Vec<u8> {
        vec![(piece % 256) as u8; self.piece_size(piece)]
    }

    pub fn digest(&self, piece: usize) -> Option<Digest> {
        self.digests.get(piece).copied()
    }

    /// Own `piece` without downloading it.
    pub fn set_valid(&mut self, piece: usize) {
        if piece >= self.piece_count() {
            return;
        }
        self.pieces[piece] = Some(Bytes::from(self.content(piece)));
        self.known.set(piece);
    }
}

impl Store for MemoryStore {
    fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    fn piece_size(&self, piece: usize) -> usize {
        let begin = piece * self.piece_size;
        self.file_size.saturating_sub(begin).min(self.piece_size)
    }

    fn is_valid_piece(&self, piece: usize) -> bool {
        self.known.get(piece)
    }

    fn known_pieces(&self) -> PieceSet {
        self.known.clone()
    }

    fn is_complete(&self) -> bool {
        self.known.is_complete()
    }

    fn read_chunk(&self, chunk: &Chunk) -> Result<Bytes, Error> {
        let data = self
            .pieces
            .get(chunk.piece)
            .ok_or(Error::PieceOutOfRange(chunk.piece))?
            .as_ref()
            .ok_or(Error::PieceNotValid(chunk.piece))?;
        if chunk.end() > data.len() {
            return Err(Error::ChunkOutOfBounds(*chunk));
        }
        trace!("read {chunk}");
        Ok(data.slice(chunk.offset..chunk.end()))
    }

    fn store_piece(&mut self, piece: usize, data: Bytes) -> Result<bool, Error> {
        if piece >= self.piece_count() {
            return Err(Error::PieceOutOfRange(piece));
        }
        let expected = self.piece_size(piece);
        if data.len() != expected {
            return Err(Error::PieceSizeMismatch {
                piece,
                expected,
                got: data.len(),
            });
        }
        if Sha1::from(&data).digest() != self.digests[piece] {
            debug!("piece {piece} failed verification");
            return Ok(false);
        }
        self.pieces[piece] = Some(data);
        self.known.set(piece);
        Ok(true)
    }

    fn close(&mut self) -> Result<(), Error> {
        debug!(
            "closing store with {}/{} pieces",
            self.known.cardinality(),
            self.piece_count()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_piece_is_shorter() {
        let store = MemoryStore::leecher(100, 32);
        assert_eq!(store.piece_count(), 4);
        assert_eq!(store.piece_size(0), 32);
        assert_eq!(store.piece_size(3), 4);
        assert!(store.known_pieces().none());
    }

    #[test]
    fn only_matching_pieces_are_stored() {
        let mut store = MemoryStore::leecher(64, 32);
        let mut bad = store.content(1);
        bad[0] ^= 0xff;

        assert!(!store.store_piece(1, Bytes::from(bad)).unwrap());
        assert!(!store.is_valid_piece(1));
        assert!(matches!(
            store.read_chunk(&Chunk::new(1, 0, 8)),
            Err(Error::PieceNotValid(1))
        ));

        assert!(store.store_piece(1, Bytes::from(store.content(1))).unwrap());
        assert!(store.is_valid_piece(1));
        assert!(!store.is_complete());

        assert!(matches!(
            store.store_piece(0, Bytes::from_static(&[0; 3])),
            Err(Error::PieceSizeMismatch { piece: 0, expected: 32, got: 3 })
        ));
        assert!(matches!(
            store.store_piece(2, Bytes::new()),
            Err(Error::PieceOutOfRange(2))
        ));
    }

    #[test]
    fn seeder_serves_chunks() {
        let store = MemoryStore::seeder(300, 256);
        assert!(store.is_complete());
        let chunk = store.read_chunk(&Chunk::new(1, 4, 40)).unwrap();
        assert_eq!(&chunk[..], &[1; 40][..]);
        assert!(matches!(
            store.read_chunk(&Chunk::new(1, 40, 8)),
            Err(Error::ChunkOutOfBounds(_))
        ));
        assert_eq!(
            store.digest(0),
            Some(Sha1::from(vec![0u8; 256]).digest())
        );
    }
}
