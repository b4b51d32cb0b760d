//! Reassembly of the pieces we are downloading.
use std::fmt;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::{error::Error, peer::PeerId, wire::Chunk};

/// One piece download from one peer: the chunk requests in flight and the
/// bytes received so far.
#[derive(Debug)]
pub struct IncompletePiece {
    pub peer: PeerId,
    pub piece: usize,
    buf: BytesMut,
    chunk_size: usize,
    /// Offset of the first chunk not requested yet.
    next_offset: usize,
    requested: Vec<Chunk>,
    /// Chunks that came back malformed, asked for again before new ones.
    retry: Vec<Chunk>,
    /// Per chunk index, whether its bytes arrived.
    received: Vec<bool>,
    missing_chunks: usize,
}

impl IncompletePiece {
    pub fn new(peer: PeerId, piece: usize, size: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = size.div_ceil(chunk_size);
        Self {
            peer,
            piece,
            buf: BytesMut::zeroed(size),
            chunk_size,
            next_offset: 0,
            requested: Vec::new(),
            retry: Vec::new(),
            received: vec![false; chunks],
            missing_chunks: chunks,
        }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn requested(&self) -> &[Chunk] {
        &self.requested
    }

    pub fn is_complete(&self) -> bool {
        self.missing_chunks == 0
    }

    /// The next chunk to ask for, if we may have `cap` requests in flight.
    fn next_request(&mut self, cap: usize) -> Option<Chunk> {
        if self.requested.len() >= cap {
            return None;
        }
        if let Some(chunk) = self.retry.pop() {
            self.requested.push(chunk);
            return Some(chunk);
        }
        if self.next_offset >= self.size() {
            return None;
        }
        let len = self.chunk_size.min(self.size() - self.next_offset);
        let chunk = Chunk::new(self.piece, self.next_offset, len);
        self.next_offset += len;
        self.requested.push(chunk);
        Some(chunk)
    }

    /// Copy the bytes of `chunk` into place. Only chunks we asked for, and
    /// each of them once, are accepted. A chunk of the wrong length is no
    /// longer in flight and will be asked for again.
    pub fn add(&mut self, chunk: Chunk, data: &[u8]) -> Result<(), Error> {
        let Some(ix) = self.requested.iter().position(|c| *c == chunk) else {
            let index = chunk.offset / self.chunk_size;
            let seen = chunk.offset % self.chunk_size == 0
                && self.received.get(index).copied().unwrap_or(false);
            return Err(if seen {
                Error::DuplicateChunk(self.peer, chunk)
            } else {
                Error::UnsolicitedChunk(self.peer, chunk)
            });
        };
        self.requested.swap_remove(ix);
        if data.len() != chunk.len {
            self.retry.push(chunk);
            return Err(Error::ChunkOutOfBounds(chunk));
        }
        self.buf[chunk.offset..chunk.end()].copy_from_slice(data);
        self.received[chunk.offset / self.chunk_size] = true;
        self.missing_chunks -= 1;
        Ok(())
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl fmt::Display for IncompletePiece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "piece {} from {}: {}/{} chunks, {} in flight",
            self.piece,
            self.peer,
            self.received.len() - self.missing_chunks,
            self.received.len(),
            self.requested.len()
        )
    }
}

/// Every piece download in progress.
#[derive(Debug, Default)]
pub struct Assembly {
    pieces: Vec<IncompletePiece>,
    chunk_size: usize,
}

impl Assembly {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            pieces: Vec::new(),
            chunk_size,
        }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IncompletePiece> {
        self.pieces.iter()
    }

    fn position(&self, peer: &PeerId, piece: usize) -> Option<usize> {
        self.pieces
            .iter()
            .position(|p| p.peer == *peer && p.piece == piece)
    }

    pub fn contains(&self, peer: &PeerId, piece: usize) -> bool {
        self.position(peer, piece).is_some()
    }

    pub fn start(&mut self, peer: PeerId, piece: usize, size: usize) {
        if self.contains(&peer, piece) {
            trace!("already downloading piece {piece} from {peer}");
            return;
        }
        self.pieces
            .push(IncompletePiece::new(peer, piece, size, self.chunk_size));
    }

    /// Stop downloading `piece` from `peer`. Returns the chunk requests
    /// that are still in flight, so they can be canceled.
    pub fn cancel(&mut self, peer: &PeerId, piece: usize) -> Vec<Chunk> {
        match self.position(peer, piece) {
            Some(ix) => self.pieces.swap_remove(ix).requested,
            None => Vec::new(),
        }
    }

    /// Drop every download from `peer`, returns the pieces they were for.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<usize> {
        let mut pieces = Vec::new();
        self.pieces.retain(|p| {
            if p.peer == *peer {
                pieces.push(p.piece);
                false
            } else {
                true
            }
        });
        pieces
    }

    /// New chunk requests so that every download has up to `cap` of them
    /// in flight.
    pub fn next_requests(&mut self, cap: usize) -> Vec<(PeerId, Chunk)> {
        let mut res = Vec::new();
        for p in &mut self.pieces {
            while let Some(chunk) = p.next_request(cap) {
                res.push((p.peer, chunk));
            }
        }
        res
    }

    /// Store the bytes of `chunk` sent by `peer`. Returns the whole piece
    /// once its last chunk is in.
    pub fn add_chunk(
        &mut self,
        peer: &PeerId,
        chunk: Chunk,
        data: &[u8],
    ) -> Result<Option<Bytes>, Error> {
        let ix = self
            .position(peer, chunk.piece)
            .ok_or(Error::StaleChunk(*peer, chunk))?;
        self.pieces[ix].add(chunk, data)?;
        if !self.pieces[ix].is_complete() {
            return Ok(None);
        }
        Ok(Some(self.pieces.swap_remove(ix).into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use sha1_smol::Sha1;

    use crate::store::{MemoryStore, Store};

    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::from([n; 20])
    }

    /// Request every chunk, feed back what a seeder reads, and return the
    /// piece that comes out.
    fn download(store: &MemoryStore, piece: usize, cap: usize) -> Bytes {
        let mut assembly = Assembly::new(16);
        assembly.start(id(1), piece, store.piece_size(piece));
        loop {
            let requests = assembly.next_requests(cap);
            assert!(!requests.is_empty());
            for (peer, chunk) in requests {
                let data = store.read_chunk(&chunk).unwrap();
                if let Some(bytes) = assembly.add_chunk(&peer, chunk, &data).unwrap() {
                    assert!(assembly.is_empty());
                    return bytes;
                }
            }
        }
    }

    #[test]
    fn reassembled_piece_matches_its_digest() {
        let store = MemoryStore::seeder(950, 100);
        for _ in 0..2 {
            let bytes = download(&store, 3, 2);
            assert_eq!(Sha1::from(&bytes).digest(), store.digest(3).unwrap());
        }
        // a short last piece
        let bytes = download(&store, 9, 8);
        assert_eq!(bytes.len(), 50);
        assert_eq!(Sha1::from(&bytes).digest(), store.digest(9).unwrap());
    }

    #[test]
    fn requests_stay_under_the_cap() {
        let mut assembly = Assembly::new(16);
        assembly.start(id(1), 0, 100);
        assembly.start(id(2), 1, 100);
        assert_eq!(assembly.next_requests(2).len(), 4);
        assert!(assembly.next_requests(2).is_empty());

        let canceled = assembly.cancel(&id(2), 1);
        assert_eq!(canceled, vec![Chunk::new(1, 0, 16), Chunk::new(1, 16, 16)]);
        assert!(assembly.cancel(&id(2), 1).is_empty());
        assert_eq!(assembly.remove_peer(&id(1)), vec![0]);
        assert!(assembly.is_empty());
    }

    #[test]
    fn unexpected_bytes_are_rejected() {
        let mut assembly = Assembly::new(16);
        assembly.start(id(1), 0, 64);
        let requests = assembly.next_requests(1);
        let (_, first) = requests[0];

        assert!(matches!(
            assembly.add_chunk(&id(1), Chunk::new(0, 32, 16), &[0; 16]),
            Err(Error::UnsolicitedChunk(..))
        ));
        assert!(matches!(
            assembly.add_chunk(&id(2), first, &[0; 16]),
            Err(Error::StaleChunk(..))
        ));
        assert_eq!(assembly.add_chunk(&id(1), first, &[0; 16]).unwrap(), None);
        assert!(matches!(
            assembly.add_chunk(&id(1), first, &[0; 16]),
            Err(Error::DuplicateChunk(..))
        ));
    }

    #[test]
    fn short_chunk_is_asked_for_again() {
        let mut assembly = Assembly::new(16);
        assembly.start(id(1), 0, 16);
        let (_, chunk) = assembly.next_requests(1)[0];

        assert!(matches!(
            assembly.add_chunk(&id(1), chunk, &[0; 8]),
            Err(Error::ChunkOutOfBounds(..))
        ));
        assert_eq!(assembly.next_requests(1), vec![(id(1), chunk)]);
        assert!(assembly.next_requests(1).is_empty());

        let piece = assembly.add_chunk(&id(1), chunk, &[7; 16]).unwrap();
        assert_eq!(piece.unwrap(), vec![7u8; 16]);
    }
}
