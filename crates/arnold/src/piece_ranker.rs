//! Rarest-first ranking of the pieces we still miss.
use std::fmt;

use rand::Rng;
use tracing::warn;

use crate::piece_set::PieceSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    piece: usize,
    /// How many peers in our neighborhood have this piece.
    occurrences: u32,
    /// How many downloads of this piece are in flight.
    downloads: u32,
}

impl Entry {
    fn key(&self) -> (u32, usize) {
        (self.occurrences, self.piece)
    }
}

/// Constraints of [`PieceRanker::pick`].
#[derive(Debug, Clone, Copy)]
pub struct Pick<'a> {
    /// Only pieces with fewer downloads in flight than this.
    pub max_downloads: u32,
    /// Only pieces that at most this many peers have.
    pub max_occurrences: Option<u32>,
    /// Pieces to leave out, usually those already requested from the peer.
    pub exclude: Option<&'a PieceSet>,
    /// Size of the sample the winner is drawn from.
    pub max_choices: usize,
}

impl<'a> Pick<'a> {
    /// A piece nobody is downloading yet.
    pub fn fresh(max_choices: usize) -> Self {
        Self {
            max_downloads: 1,
            max_occurrences: None,
            exclude: None,
            max_choices,
        }
    }
}

/// The pieces we miss, sorted by `(occurrences, piece)`.
///
/// `rank` maps a piece to its slot in `entries`. Occurrence counts only
/// ever move by one, so after a change the entry bubbles a few slots at
/// most. Pieces we own are not ranked at all.
#[derive(Debug, Clone)]
pub struct PieceRanker {
    entries: Vec<Entry>,
    rank: Vec<Option<usize>>,
}

impl PieceRanker {
    /// Rank every piece that is not in `owned`.
    pub fn new(owned: &PieceSet) -> Self {
        let mut entries = Vec::new();
        let mut rank = vec![None; owned.len()];
        for piece in (0..owned.len()).filter(|p| !owned.get(*p)) {
            rank[piece] = Some(entries.len());
            entries.push(Entry {
                piece,
                occurrences: 0,
                downloads: 0,
            });
        }
        Self { entries, rank }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Slot of `piece`, repairing the ranking first if the index turns out
    /// to be corrupt.
    fn slot(&mut self, piece: usize) -> Option<usize> {
        let ix = (*self.rank.get(piece)?)?;
        if self.entries.get(ix).map(|e| e.piece) != Some(piece) {
            self.repair();
            return *self.rank.get(piece)?;
        }
        Some(ix)
    }

    /// Re-sort the entries and rebuild the index if [`Self::ranking_is_sane`]
    /// fails. Returns whether anything had to be fixed.
    pub fn repair(&mut self) -> bool {
        if self.ranking_is_sane() {
            return false;
        }
        warn!("Piece ranker: rebuilding the ranking");
        self.entries.sort_by_key(Entry::key);
        self.rank.iter_mut().for_each(|r| *r = None);
        for (ix, e) in self.entries.iter().enumerate() {
            if let Some(r) = self.rank.get_mut(e.piece) {
                *r = Some(ix);
            }
        }
        true
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.rank[self.entries[a].piece] = Some(a);
        self.rank[self.entries[b].piece] = Some(b);
    }

    pub fn add_occurrence(&mut self, piece: usize) {
        let Some(mut ix) = self.slot(piece) else {
            return;
        };
        self.entries[ix].occurrences += 1;
        while ix + 1 < self.entries.len()
            && self.entries[ix].key() > self.entries[ix + 1].key()
        {
            self.swap(ix, ix + 1);
            ix += 1;
        }
    }

    pub fn remove_occurrence(&mut self, piece: usize) {
        let Some(mut ix) = self.slot(piece) else {
            return;
        };
        let e = &mut self.entries[ix];
        if e.occurrences == 0 {
            warn!("Piece ranker: piece {piece} has no occurrences to remove");
            return;
        }
        e.occurrences -= 1;
        while ix > 0 && self.entries[ix].key() < self.entries[ix - 1].key() {
            self.swap(ix, ix - 1);
            ix -= 1;
        }
    }

    pub fn add_occurrences(&mut self, set: &PieceSet) {
        for piece in set.iter() {
            self.add_occurrence(piece);
        }
    }

    pub fn remove_occurrences(&mut self, set: &PieceSet) {
        for piece in set.iter() {
            self.remove_occurrence(piece);
        }
    }

    pub fn register_download_start(&mut self, piece: usize) {
        if let Some(ix) = self.slot(piece) {
            self.entries[ix].downloads += 1;
        }
    }

    pub fn register_download_cancel(&mut self, piece: usize) {
        if let Some(ix) = self.slot(piece) {
            let e = &mut self.entries[ix];
            e.downloads = e.downloads.saturating_sub(1);
        }
    }

    pub fn downloads(&self, piece: usize) -> u32 {
        self.rank
            .get(piece)
            .copied()
            .flatten()
            .and_then(|ix| self.entries.get(ix))
            .map_or(0, |e| e.downloads)
    }

    pub fn occurrences(&self, piece: usize) -> Option<u32> {
        let ix = (*self.rank.get(piece)?)?;
        self.entries.get(ix).map(|e| e.occurrences)
    }

    /// We own `piece`: drop it from the ranking for good.
    pub fn complete_piece(&mut self, piece: usize) {
        let Some(ix) = self.slot(piece) else {
            return;
        };
        self.rank[piece] = None;
        self.entries.remove(ix);
        for (i, e) in self.entries.iter().enumerate().skip(ix) {
            self.rank[e.piece] = Some(i);
        }
    }

    /// Pick one of the rarest pieces of `available` that satisfies `pick`.
    ///
    /// The scan starts at the rarest entry and stops at the end of the
    /// rarity tier of the first candidate, or when the sample is full. The
    /// winner is drawn uniformly from the sample so that peers looking at
    /// the same swarm do not all go for the same piece.
    pub fn pick<R: Rng + ?Sized>(
        &self,
        available: &PieceSet,
        pick: &Pick<'_>,
        rng: &mut R,
    ) -> Option<usize> {
        let mut choices: Vec<usize> = Vec::with_capacity(pick.max_choices);
        let mut tier = None;

        for e in &self.entries {
            if pick.max_occurrences.is_some_and(|max| e.occurrences > max) {
                break;
            }
            if tier.is_some_and(|t| t != e.occurrences) {
                break;
            }
            if e.downloads < pick.max_downloads
                && available.get(e.piece)
                && !pick.exclude.is_some_and(|x| x.get(e.piece))
            {
                tier = Some(e.occurrences);
                choices.push(e.piece);
                if choices.len() >= pick.max_choices {
                    break;
                }
            }
        }

        if choices.is_empty() {
            return None;
        }
        Some(choices[rng.gen_range(0..choices.len())])
    }

    /// Pieces from rarest to most common.
    pub fn ranking(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.piece).collect()
    }

    /// Check that the index and the sorted entries agree, logging every
    /// mismatch. Only reports, [`Self::repair`] fixes.
    pub fn ranking_is_sane(&self) -> bool {
        let mut sane = true;
        let mut indexed = 0;
        for (piece, r) in self.rank.iter().enumerate() {
            let Some(ix) = *r else {
                continue;
            };
            indexed += 1;
            match self.entries.get(ix) {
                None => {
                    warn!("Piece rank for {piece} (={ix}) points past the ranking");
                    sane = false;
                }
                Some(e) if e.piece != piece => {
                    warn!(
                        "Piece rank for {piece} (={ix}) points to the entry of piece {}",
                        e.piece
                    );
                    sane = false;
                }
                _ => {}
            }
        }
        if indexed != self.entries.len() {
            warn!(
                "{} ranked entries but {indexed} indexed pieces",
                self.entries.len()
            );
            sane = false;
        }
        if self.entries.windows(2).any(|w| w[0].key() >= w[1].key()) {
            warn!("Piece ranking is out of order");
            sane = false;
        }
        sane
    }
}

/// Tiers of equal occurrence count, with runs of consecutive pieces
/// collapsed, e.g. `0:[2] 1:[0-1,3]`.
impl fmt::Display for PieceRanker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.entries.len();
        let continues = |i: usize| {
            i + 1 < n
                && self.entries[i].piece + 1 == self.entries[i + 1].piece
                && self.entries[i].occurrences == self.entries[i + 1].occurrences
        };

        let mut i = 0;
        let mut tier: Option<u32> = None;
        while i < n {
            let e = self.entries[i];
            if tier != Some(e.occurrences) {
                if tier.is_some() {
                    f.write_str("] ")?;
                }
                write!(f, "{}:[", e.occurrences)?;
                tier = Some(e.occurrences);
            } else {
                f.write_str(",")?;
            }
            write!(f, "{}", e.piece)?;
            if continues(i) {
                while continues(i) {
                    i += 1;
                }
                write!(f, "-{}", self.entries[i].piece)?;
            }
            i += 1;
        }
        if tier.is_some() {
            f.write_str("]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn assert_rank(r: &PieceRanker, s: &str, order: &[usize]) {
        assert_eq!(r.ranking(), order);
        assert!(r.ranking_is_sane());
        assert_eq!(r.to_string(), s);
    }

    #[test]
    fn ranking_strings() {
        let mut r = PieceRanker::new(&PieceSet::new(4));
        assert_rank(&r, "0:[0-3]", &[0, 1, 2, 3]);

        r.add_occurrence(0);
        assert_rank(&r, "0:[1-3] 1:[0]", &[1, 2, 3, 0]);

        r.remove_occurrence(0);
        assert_rank(&r, "0:[0-3]", &[0, 1, 2, 3]);

        r.add_occurrence(0);
        r.add_occurrence(1);
        assert_rank(&r, "0:[2-3] 1:[0-1]", &[2, 3, 0, 1]);
        r.add_occurrence(2);
        assert_rank(&r, "0:[3] 1:[0-2]", &[3, 0, 1, 2]);
        r.add_occurrence(3);
        assert_rank(&r, "1:[0-3]", &[0, 1, 2, 3]);

        r.remove_occurrence(2);
        assert_rank(&r, "0:[2] 1:[0-1,3]", &[2, 0, 1, 3]);

        r.complete_piece(1);
        assert_rank(&r, "0:[2] 1:[0,3]", &[2, 0, 3]);
        assert_eq!(r.occurrences(1), None);
    }

    #[test]
    fn owned_pieces_are_not_ranked() {
        let mut owned = PieceSet::new(5);
        owned.set(1);
        owned.set(4);
        let r = PieceRanker::new(&owned);
        assert_rank(&r, "0:[0,2-3]", &[0, 2, 3]);
    }

    #[test]
    fn remove_inverts_add() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut r = PieceRanker::new(&PieceSet::new(16));
        for _ in 0..64 {
            r.add_occurrence(rng.gen_range(0..16));
            assert!(r.ranking_is_sane());
        }
        let before = r.ranking();
        let shown = r.to_string();
        for piece in 0..16 {
            r.add_occurrence(piece);
            assert!(r.ranking_is_sane());
            r.remove_occurrence(piece);
            assert!(r.ranking_is_sane());
            assert_eq!(r.ranking(), before);
            assert_eq!(r.to_string(), shown);
        }
    }

    #[test]
    fn corrupt_index_is_repaired() {
        let mut r = PieceRanker::new(&PieceSet::new(4));
        r.add_occurrence(0);
        let before = r.ranking();
        assert!(!r.repair());

        r.rank.swap(1, 2);
        assert!(!r.ranking_is_sane());
        assert!(r.repair());
        assert_rank(&r, "0:[1-3] 1:[0]", &before);

        // any lookup through a stale slot repairs too
        r.rank.swap(0, 3);
        r.add_occurrence(3);
        assert_rank(&r, "0:[1-2] 1:[0,3]", &[1, 2, 0, 3]);
    }

    #[test]
    fn picks_the_rarest_available_piece() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut r = PieceRanker::new(&PieceSet::new(4));
        // 0 and 1 common, 2 rare, 3 nowhere
        r.add_occurrences(&PieceSet::full(4));
        r.add_occurrence(0);
        r.add_occurrence(1);
        r.remove_occurrence(3);

        let mut available = PieceSet::new(4);
        available.set(0);
        available.set(2);
        for _ in 0..8 {
            assert_eq!(r.pick(&available, &Pick::fresh(30), &mut rng), Some(2));
        }

        r.register_download_start(2);
        assert_eq!(r.pick(&available, &Pick::fresh(30), &mut rng), Some(0));

        let capped = Pick {
            max_occurrences: Some(1),
            ..Pick::fresh(30)
        };
        assert_eq!(r.pick(&available, &capped, &mut rng), None);
    }

    #[test]
    fn endgame_refuses_a_third_replica() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut r = PieceRanker::new(&PieceSet::new(1));
        r.add_occurrences(&PieceSet::full(1));
        let endgame = Pick {
            max_downloads: 2,
            ..Pick::fresh(30)
        };

        let available = PieceSet::full(1);
        assert_eq!(r.pick(&available, &endgame, &mut rng), Some(0));
        r.register_download_start(0);
        assert_eq!(r.pick(&available, &endgame, &mut rng), Some(0));
        r.register_download_start(0);
        assert_eq!(r.pick(&available, &endgame, &mut rng), None);

        r.register_download_cancel(0);
        assert_eq!(r.downloads(0), 1);
        assert!(r.pick(&available, &endgame, &mut rng).is_some());
    }
}
