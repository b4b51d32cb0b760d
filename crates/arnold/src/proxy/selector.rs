use tracing::{debug, warn};

use crate::{context::Ctx, peer::PeerId, piece_set::PieceSet, wire::Message};

/// Decides which helper is responsible for which of the pieces we still
/// need.
///
/// Every new helper gets a share of the pieces nobody is responsible for,
/// so helpers split the pieces between them without overlap. Once every
/// piece we need is covered a new helper gets an empty share.
#[derive(Debug)]
pub struct PieceSelector {
    /// Responsible helpers per piece, `None` once we own the piece.
    responsible: Vec<Option<u32>>,
    helpers: Vec<(PeerId, PieceSet)>,
    max_helpers: usize,
    /// Where the next share starts, so shares go round the file.
    cursor: usize,
}

impl PieceSelector {
    pub fn new(known: &PieceSet, max_helpers: usize) -> Self {
        let responsible = (0..known.len())
            .map(|p| if known.get(p) { None } else { Some(0) })
            .collect();
        Self {
            responsible,
            helpers: Vec::new(),
            max_helpers: max_helpers.max(1),
            cursor: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.responsible.len()
    }

    pub fn responsible(&self, piece: usize) -> Option<u32> {
        self.responsible.get(piece).copied().flatten()
    }

    pub fn helper_count(&self) -> usize {
        self.helpers.len()
    }

    pub fn share_of(&self, helper: &PeerId) -> Option<&PieceSet> {
        self.helpers
            .iter()
            .find(|(h, _)| h == helper)
            .map(|(_, set)| set)
    }

    /// Some piece we need has nobody responsible for it.
    pub fn need_more_helpers(&self) -> bool {
        self.responsible.iter().any(|c| *c == Some(0))
    }

    fn next_share(&mut self) -> PieceSet {
        let n = self.piece_count();
        let mut share = PieceSet::new(n);
        let unowned = self.responsible.iter().flatten().count();
        if !self.need_more_helpers() {
            return share;
        }
        let size = unowned.div_ceil(self.max_helpers);

        let mut taken = 0;
        let mut last = None;
        for i in 0..n {
            if taken == size {
                break;
            }
            let piece = (self.cursor + i) % n;
            if let Some(count) = self.responsible[piece].as_mut() {
                if *count == 0 {
                    *count += 1;
                    share.set(piece);
                    taken += 1;
                    last = Some(piece);
                }
            }
        }
        if let Some(last) = last {
            self.cursor = (last + 1) % n;
        }
        share
    }

    /// Make `helper` responsible for a share of the pieces and tell it
    /// which ones.
    pub fn add_helper(&mut self, cx: &mut Ctx, helper: PeerId) {
        let share = self.next_share();
        debug!("helper {helper} is responsible for {share}");
        cx.bookkeeping(helper, Message::RequestPieces(share.clone()));
        self.helpers.push((helper, share));
    }

    /// Hand the share of `helper` back to the pool.
    pub fn remove_helper(&mut self, helper: &PeerId) {
        let Some(ix) = self.helpers.iter().position(|(h, _)| h == helper) else {
            warn!("PieceSelector: removing unknown helper {helper}");
            return;
        };
        let (_, share) = self.helpers.swap_remove(ix);
        for piece in share.iter() {
            if let Some(count) = self.responsible[piece].as_mut() {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn have_piece(&mut self, piece: usize) {
        if let Some(slot) = self.responsible.get_mut(piece) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        scheduler::testing::{ctx, id, set},
    };

    use super::*;

    fn counts(s: &PieceSelector) -> Vec<Option<u32>> {
        (0..s.piece_count()).map(|p| s.responsible(p)).collect()
    }

    #[test]
    fn helpers_split_the_pieces_without_overlap() {
        let mut cx = ctx(Config::default());
        let mut s = PieceSelector::new(&set(10, &[4]), 4);
        assert!(s.need_more_helpers());

        let mut helpers = 0;
        while s.need_more_helpers() {
            helpers += 1;
            s.add_helper(&mut cx, id(helpers));
        }
        // shares of ceil(9 / 4) pieces
        assert_eq!(helpers, 3);
        for p in 0..10 {
            let expected = if p == 4 { None } else { Some(1) };
            assert_eq!(s.responsible(p), expected, "piece {p}");
        }
        let mut union = PieceSet::new(10);
        for n in 1..=helpers {
            let share = s.share_of(&id(n)).unwrap();
            assert!(!share.intersects(&union));
            union.or(share);
        }
        assert_eq!(union, set(10, &[0, 1, 2, 3, 5, 6, 7, 8, 9]));

        // every helper was told about its share
        let sent = cx
            .take_outbox()
            .into_iter()
            .filter(|o| matches!(o.msg, Message::RequestPieces(_)))
            .count();
        assert_eq!(sent, 3);
    }

    #[test]
    fn removing_a_helper_restores_the_counts() {
        let mut cx = ctx(Config::default());
        let mut s = PieceSelector::new(&PieceSet::new(7), 3);
        s.add_helper(&mut cx, id(1));
        let before = counts(&s);

        s.add_helper(&mut cx, id(2));
        assert_ne!(counts(&s), before);
        s.remove_helper(&id(2));
        assert_eq!(counts(&s), before);

        // a piece we completed meanwhile stays owned
        s.add_helper(&mut cx, id(3));
        let share = s.share_of(&id(3)).unwrap().clone();
        let owned = share.iter().next().unwrap();
        s.have_piece(owned);
        s.remove_helper(&id(3));
        for p in 0..7 {
            if p == owned {
                assert_eq!(s.responsible(p), None);
            } else {
                assert_eq!(s.responsible(p), before[p]);
            }
        }
    }

    #[test]
    fn covered_pieces_are_not_shared_again() {
        let mut cx = ctx(Config::default());
        let mut s = PieceSelector::new(&PieceSet::new(4), 2);
        s.add_helper(&mut cx, id(1));
        s.add_helper(&mut cx, id(2));
        assert!(!s.need_more_helpers());
        let before = counts(&s);

        s.add_helper(&mut cx, id(3));
        assert!(s.share_of(&id(3)).unwrap().none());
        assert_eq!(counts(&s), before);
        for p in 0..4 {
            assert_eq!(s.responsible(p), Some(1), "piece {p}");
        }
    }

    #[test]
    fn unknown_helper_is_ignored() {
        let mut s = PieceSelector::new(&PieceSet::new(3), 2);
        let before = counts(&s);
        s.remove_helper(&id(9));
        assert_eq!(counts(&s), before);
    }
}
