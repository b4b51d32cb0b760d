use hashbrown::HashMap;
use tracing::{debug, info, trace, warn};

use crate::{
    context::Ctx,
    credit::CreditValue,
    peer::{ChunkRequest, PeerId, PeerRecord, PeerSet},
    personality::Personality,
    piece_set::PieceSet,
    scheduler::Scheduler,
    wire::{Chunk, Message},
};

use super::PieceSelector;

/// What an unclassified peer told us, replayed if it becomes a helper.
#[derive(Debug, Clone)]
struct Shadow {
    pieces: PieceSet,
    has_choked_us: Option<bool>,
    is_interested: Option<bool>,
    credit: Option<CreditValue>,
}

impl Shadow {
    fn new(piece_count: usize) -> Self {
        Self {
            pieces: PieceSet::new(piece_count),
            has_choked_us: None,
            is_interested: None,
            credit: None,
        }
    }
}

/// The scheduler of a node that hides behind helpers.
///
/// Only helpers are allowed to talk to us. Every new peer starts out
/// unclassified; while some piece has no responsible helper we ask one
/// random unclassified peer at a time to help us. A peer that joins is
/// handed to the inner scheduler together with everything it told us so
/// far, and gets a share of the pieces from the [`PieceSelector`].
#[derive(Debug)]
pub struct ProxyCoordinator {
    helpers: Box<dyn Scheduler>,
    helper_ids: PeerSet,
    non_helpers: PeerSet,
    /// Asked for help, no answer yet.
    candidates: PeerSet,
    shadows: HashMap<PeerId, Shadow>,
    selector: PieceSelector,
}

impl ProxyCoordinator {
    pub fn new(helpers: Box<dyn Scheduler>, known: &PieceSet, max_helpers: usize) -> Self {
        Self {
            helpers,
            helper_ids: PeerSet::new(),
            non_helpers: PeerSet::new(),
            candidates: PeerSet::new(),
            shadows: HashMap::new(),
            selector: PieceSelector::new(known, max_helpers),
        }
    }

    pub fn selector(&self) -> &PieceSelector {
        &self.selector
    }

    pub fn is_helper(&self, peer: &PeerId) -> bool {
        self.helper_ids.contains(peer)
    }

    pub fn is_candidate(&self, peer: &PeerId) -> bool {
        self.candidates.contains(peer)
    }

    fn shadow(&mut self, peer: &PeerId) -> &mut Shadow {
        let n = self.selector.piece_count();
        self.shadows.entry(*peer).or_insert_with(|| Shadow::new(n))
    }

    /// Ask one more peer for help, if we need it and nobody is deciding
    /// already.
    fn maintain_helper_pool(&mut self, cx: &mut Ctx) {
        if !self.candidates.is_empty() || !self.selector.need_more_helpers() {
            return;
        }
        if let Some(peer) = self.non_helpers.extract_random(cx.rng()) {
            debug!("asking {peer} for help");
            self.candidates.add(peer);
            cx.bookkeeping(peer, Message::AskForHelp);
        }
    }

    fn forget(&mut self, peer: &PeerId) {
        self.non_helpers.remove(peer);
        self.candidates.remove(peer);
        if self.helper_ids.remove(peer) {
            self.selector.remove_helper(peer);
        }
        self.shadows.remove(peer);
    }
}

impl Scheduler for ProxyCoordinator {
    fn name(&self) -> String {
        format!("ProxyCoordinator({})", self.helpers.name())
    }

    fn add_peer(
        &mut self,
        cx: &mut Ctx,
        peer: PeerId,
        _start_talking: bool,
        _personality: &mut dyn Personality,
    ) {
        trace!("ProxyCoordinator: new unclassified peer {peer}");
        self.non_helpers.add(peer);
        self.maintain_helper_pool(cx);
    }

    fn add_record(&mut self, cx: &mut Ctx, rec: PeerRecord) {
        warn!("ProxyCoordinator: adopted record of {}", rec.id);
        self.non_helpers.add(rec.id);
        self.maintain_helper_pool(cx);
    }

    fn remove_peer(&mut self, cx: &mut Ctx, peer: &PeerId) -> bool {
        let mut known = self.non_helpers.contains(peer) || self.candidates.contains(peer);
        self.forget(peer);
        known |= self.helpers.remove_peer(cx, peer);
        self.maintain_helper_pool(cx);
        known
    }

    fn extract_peer(&mut self, cx: &mut Ctx, peer: &PeerId) -> Option<PeerRecord> {
        self.forget(peer);
        let rec = self.helpers.extract_peer(cx, peer);
        self.maintain_helper_pool(cx);
        rec
    }

    fn register_peer_has_piece(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        piece: usize,
        personality: &mut dyn Personality,
    ) {
        if self.is_helper(peer) {
            self.helpers
                .register_peer_has_piece(cx, peer, piece, personality);
        } else if piece < self.selector.piece_count() {
            self.shadow(peer).pieces.set(piece);
        }
    }

    fn set_peer_has_pieces(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        bits: PieceSet,
        personality: &mut dyn Personality,
    ) {
        if self.is_helper(peer) {
            self.helpers.set_peer_has_pieces(cx, peer, bits, personality);
        } else {
            self.shadow(peer).pieces = bits;
        }
    }

    fn request_pieces(&mut self, _cx: &mut Ctx, _set: &PieceSet) {
        warn!("ProxyCoordinator: somebody asked us to fetch pieces");
    }

    fn register_received_chunk(&mut self, peer: &PeerId, len: usize) {
        self.helpers.register_received_chunk(peer, len);
    }

    fn register_incorrect_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize) -> bool {
        let banned = self.helpers.register_incorrect_piece(cx, peer, piece);
        if banned && self.helper_ids.remove(peer) {
            self.selector.remove_helper(peer);
        }
        self.maintain_helper_pool(cx);
        banned
    }

    fn register_failed_piece_download(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        piece: usize,
    ) -> bool {
        let banned = self.helpers.register_failed_piece_download(cx, peer, piece);
        self.maintain_helper_pool(cx);
        banned
    }

    fn register_completed_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize) {
        self.helpers.register_completed_piece(cx, peer, piece);
        self.selector.have_piece(piece);
    }

    fn add_chunk_request(&mut self, cx: &mut Ctx, peer: &PeerId, chunk: Chunk) {
        if !self.is_helper(peer) {
            warn!("ProxyCoordinator: non-helper {peer} asked for {chunk}");
            cx.bookkeeping(*peer, Message::CloseConnection);
            return;
        }
        self.helpers.add_chunk_request(cx, peer, chunk);
    }

    fn remove_chunk_request(&mut self, peer: &PeerId, chunk: &Chunk) {
        self.helpers.remove_chunk_request(peer, chunk);
    }

    fn next_chunk_request(&mut self) -> Option<ChunkRequest> {
        self.helpers.next_chunk_request()
    }

    fn has_incoming_chunk_requests(&self) -> bool {
        self.helpers.has_incoming_chunk_requests()
    }

    fn set_peer_has_choked_us(&mut self, cx: &mut Ctx, peer: &PeerId, flag: bool) {
        if self.is_helper(peer) {
            self.helpers.set_peer_has_choked_us(cx, peer, flag);
        } else {
            self.shadow(peer).has_choked_us = Some(flag);
        }
    }

    fn set_peer_is_interested(&mut self, cx: &mut Ctx, peer: &PeerId, flag: bool) {
        if self.is_helper(peer) {
            self.helpers.set_peer_is_interested(cx, peer, flag);
        } else {
            self.shadow(peer).is_interested = Some(flag);
        }
    }

    fn generate_more_transmission(&mut self, cx: &mut Ctx) -> bool {
        self.maintain_helper_pool(cx);
        self.helpers.generate_more_transmission(cx)
    }

    fn peer_joined_as_helper(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        personality: &mut dyn Personality,
    ) {
        let asked = self.candidates.remove(peer);
        if asked && !self.selector.need_more_helpers() {
            // we got the pieces it would have fetched in the meantime
            debug!("peer {peer} joined as helper, but nothing is left to share");
            self.non_helpers.add(*peer);
            cx.bookkeeping(*peer, Message::StopHelping);
        } else if asked {
            info!("peer {peer} joined as helper");
            let shadow = self.shadows.remove(peer);
            self.helpers.add_peer(cx, *peer, true, personality);
            self.helper_ids.add(*peer);
            self.selector.add_helper(cx, *peer);
            if let Some(shadow) = shadow {
                if !shadow.pieces.none() {
                    self.helpers
                        .set_peer_has_pieces(cx, peer, shadow.pieces, personality);
                }
                if let Some(flag) = shadow.has_choked_us {
                    self.helpers.set_peer_has_choked_us(cx, peer, flag);
                }
                if let Some(flag) = shadow.is_interested {
                    self.helpers.set_peer_is_interested(cx, peer, flag);
                }
                if let Some(credit) = shadow.credit {
                    self.helpers.update_credit(peer, credit);
                }
            }
        } else {
            warn!("ProxyCoordinator: {peer} joined as helper, but we never asked it");
        }
        self.maintain_helper_pool(cx);
    }

    fn peer_resigned_as_helper(&mut self, cx: &mut Ctx, peer: &PeerId) -> bool {
        self.shadows.remove(peer);
        let was_helper = if self.candidates.remove(peer) {
            debug!("peer {peer} refused to help");
            false
        } else {
            let removed = self.helpers.remove_peer(cx, peer);
            if self.helper_ids.remove(peer) {
                info!("helper {peer} resigned");
                self.selector.remove_helper(peer);
            }
            removed
        };
        self.maintain_helper_pool(cx);
        was_helper
    }

    fn source_peer_count(&self) -> usize {
        self.helpers.source_peer_count()
    }

    fn ask_for_help(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        _personality: &mut dyn Personality,
    ) -> bool {
        // we are hiding ourselves, we cannot help others
        cx.bookkeeping(*peer, Message::ResignAsHelper);
        false
    }

    fn handle_stopped_helping(&mut self, _cx: &mut Ctx, peer: &PeerId) {
        debug!("ProxyCoordinator: ignored stop helping message from {peer}");
    }

    fn handle_closed_connection(&mut self, peer: &PeerId) {
        self.non_helpers.remove(peer);
        self.candidates.remove(peer);
        self.shadows.remove(peer);
        self.helpers.handle_closed_connection(peer);
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.helpers.contains(peer)
            || self.candidates.contains(peer)
            || self.non_helpers.contains(peer)
    }

    fn update_credit(&mut self, peer: &PeerId, credit: CreditValue) {
        if self.is_helper(peer) {
            self.helpers.update_credit(peer, credit);
        } else {
            let shadow = self.shadow(peer);
            shadow.credit = Some(match shadow.credit {
                Some(old) => old.merge(credit),
                None => credit,
            });
        }
    }

    fn shutdown(&mut self, cx: &mut Ctx) {
        for peer in self.helper_ids.iter() {
            cx.bookkeeping(*peer, Message::StopHelping);
        }
        self.helpers.shutdown(cx);
    }

    fn dump_state(&self) {
        info!(
            "ProxyCoordinator: helpers={:?} candidates={:?} non helpers={:?}",
            self.helper_ids, self.candidates, self.non_helpers
        );
        self.helpers.dump_state();
    }

    fn print_statistics(&self) {
        info!(
            "ProxyCoordinator: {} helpers at the end",
            self.selector.helper_count()
        );
        self.helpers.print_statistics();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        context::DownloadCmd,
        peer::RankingPolicy,
        personality::GreedyPersonality,
        scheduler::{
            testing::{ctx, id, set},
            GreedyScheduler,
        },
    };

    use super::*;

    fn coordinator(pieces: usize) -> ProxyCoordinator {
        let known = PieceSet::new(pieces);
        let inner = GreedyScheduler::new(known.clone(), RankingPolicy::TitForTat);
        ProxyCoordinator::new(Box::new(inner), &known, 2)
    }

    fn asked(cx: &mut Ctx) -> Vec<PeerId> {
        cx.take_outbox()
            .into_iter()
            .filter(|o| o.msg == Message::AskForHelp)
            .map(|o| o.to)
            .collect()
    }

    #[test]
    fn asks_one_peer_at_a_time() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut c = coordinator(4);

        c.add_peer(&mut cx, id(1), false, &mut personality);
        c.add_peer(&mut cx, id(2), false, &mut personality);
        assert_eq!(asked(&mut cx), vec![id(1)]);
        assert!(c.is_candidate(&id(1)));

        // a refusal makes room for the next candidate
        assert!(!c.peer_resigned_as_helper(&mut cx, &id(1)));
        assert!(!c.contains(&id(1)));
        assert_eq!(asked(&mut cx), vec![id(2)]);
    }

    #[test]
    fn joining_helper_gets_its_shadow_state_and_a_share() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut c = coordinator(4);

        c.add_peer(&mut cx, id(1), false, &mut personality);
        c.set_peer_has_pieces(&mut cx, &id(1), set(4, &[0, 1, 2, 3]), &mut personality);
        c.update_credit(&id(1), CreditValue::new(5.0, 1));
        cx.take_outbox();
        assert!(cx.take_downloads().is_empty());

        c.peer_joined_as_helper(&mut cx, &id(1), &mut personality);
        assert!(c.is_helper(&id(1)));
        let share = c.selector().share_of(&id(1)).unwrap().clone();
        assert_eq!(share.cardinality(), 2);
        assert!(cx
            .take_outbox()
            .iter()
            .any(|o| o.to == id(1) && o.msg == Message::RequestPieces(share.clone())));
        // the replayed catalog starts downloads from the helper
        let downloads = cx.take_downloads();
        assert!(!downloads.is_empty());
        assert!(downloads
            .iter()
            .all(|d| matches!(d, DownloadCmd::Start { peer, .. } if *peer == id(1))));
    }

    #[test]
    fn only_helpers_are_served() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut c = coordinator(4);
        c.add_peer(&mut cx, id(1), false, &mut personality);
        cx.take_outbox();

        c.add_chunk_request(&mut cx, &id(1), Chunk::new(0, 0, 16));
        assert!(!c.has_incoming_chunk_requests());
        assert!(cx
            .take_outbox()
            .iter()
            .any(|o| o.to == id(1) && o.msg == Message::CloseConnection));
    }

    #[test]
    fn resigning_helper_gives_back_its_share() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut c = coordinator(4);

        for n in 1..=3 {
            c.add_peer(&mut cx, id(n), false, &mut personality);
        }
        let first = asked(&mut cx)[0];
        c.peer_joined_as_helper(&mut cx, &first, &mut personality);
        let second = asked(&mut cx)[0];
        c.peer_joined_as_helper(&mut cx, &second, &mut personality);
        assert!(!c.selector().need_more_helpers());
        assert!(asked(&mut cx).is_empty());

        assert!(c.peer_resigned_as_helper(&mut cx, &first));
        assert!(!c.is_helper(&first));
        assert_eq!(c.selector().helper_count(), 1);
        // the freed share needs a new helper, and the last peer is asked
        assert!(c.selector().need_more_helpers());
        assert_eq!(asked(&mut cx).len(), 1);
    }

    #[test]
    fn late_helper_is_sent_away() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut c = coordinator(4);

        for n in 1..=3 {
            c.add_peer(&mut cx, id(n), false, &mut personality);
        }
        let first = asked(&mut cx)[0];
        c.peer_joined_as_helper(&mut cx, &first, &mut personality);
        let second = asked(&mut cx)[0];

        // the pieces left for the second helper arrive before it answers
        let share = c.selector().share_of(&first).unwrap().clone();
        for piece in (0..4).filter(|p| !share.get(*p)) {
            c.register_completed_piece(&mut cx, &first, piece);
        }
        assert!(!c.selector().need_more_helpers());
        cx.take_outbox();

        c.peer_joined_as_helper(&mut cx, &second, &mut personality);
        assert!(!c.is_helper(&second));
        assert!(c.contains(&second));
        assert_eq!(c.selector().helper_count(), 1);
        let outbox = cx.take_outbox();
        assert!(outbox
            .iter()
            .any(|o| o.to == second && o.msg == Message::StopHelping));
        assert!(!outbox.iter().any(|o| o.msg == Message::AskForHelp));
    }
}
