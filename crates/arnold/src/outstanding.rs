//! Piece downloads in flight.
use std::fmt;

use tracing::warn;

use crate::{peer::PeerId, piece_ranker::PieceRanker, piece_set::PieceSet};

/// A piece we are downloading from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Download {
    pub peer: PeerId,
    pub piece: usize,
}

/// The downloads in flight. A piece shows up more than once while it is
/// raced in the endgame, a peer shows up once per piece we asked it for.
#[derive(Debug, Clone, Default)]
pub struct Outstanding(Vec<Download>);

impl Outstanding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: PeerId, piece: usize) {
        self.0.push(Download { peer, piece });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Download> {
        self.0.iter()
    }

    /// Forget every download from `peer`. Pieces left without any replica
    /// go back into `missing`. Returns the pieces that were dropped.
    pub fn remove_peer(
        &mut self,
        peer: &PeerId,
        missing: &mut PieceSet,
        ranker: &mut PieceRanker,
    ) -> Vec<usize> {
        let mut dropped = Vec::new();
        self.0.retain(|d| {
            if d.peer == *peer {
                dropped.push(d.piece);
                false
            } else {
                true
            }
        });
        for &piece in &dropped {
            ranker.register_download_cancel(piece);
            if !self.contains_piece(piece) {
                missing.set(piece);
            }
        }
        dropped
    }

    /// Take the download of `piece` from `peer` out of the ledger.
    pub fn extract(&mut self, peer: &PeerId, piece: usize) -> Option<Download> {
        let before = self.0.len();
        let mut res = None;
        self.0.retain(|d| {
            if d.piece == piece && d.peer == *peer {
                res = Some(*d);
                false
            } else {
                true
            }
        });
        if before - self.0.len() > 1 {
            warn!("Duplicate outstanding piece {piece} from {peer}");
        }
        res
    }

    pub fn contains_piece(&self, piece: usize) -> bool {
        self.0.iter().any(|d| d.piece == piece)
    }

    pub fn contains_from_peer(&self, peer: &PeerId) -> bool {
        self.0.iter().any(|d| d.peer == *peer)
    }

    pub fn contains_piece_from_peer(&self, piece: usize, peer: &PeerId) -> bool {
        self.0.iter().any(|d| d.piece == piece && d.peer == *peer)
    }

    pub fn count_replication(&self, piece: usize) -> usize {
        self.0.iter().filter(|d| d.piece == piece).count()
    }

    /// Drop every download of `piece`, returns the peers that had it.
    pub fn cancel_piece(&mut self, piece: usize) -> Vec<PeerId> {
        let mut peers = Vec::new();
        self.0.retain(|d| {
            if d.piece == piece {
                peers.push(d.peer);
                false
            } else {
                true
            }
        });
        peers
    }

    /// Every piece in flight, as a set over `piece_count` pieces.
    pub fn pieces(&self, piece_count: usize) -> PieceSet {
        let mut set = PieceSet::new(piece_count);
        for d in &self.0 {
            set.set(d.piece);
        }
        set
    }

    pub fn pieces_from_peer(&self, peer: &PeerId, piece_count: usize) -> PieceSet {
        let mut set = PieceSet::new(piece_count);
        for d in self.0.iter().filter(|d| d.peer == *peer) {
            set.set(d.piece);
        }
        set
    }
}

impl fmt::Display for Outstanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}@{}", d.piece, d.peer)?;
        }
        f.write_str("]")
    }
}
