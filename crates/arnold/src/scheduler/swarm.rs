use tracing::{debug, info, trace, warn};

use crate::{
    context::Ctx,
    credit::CreditValue,
    outstanding::Outstanding,
    peer::{ChunkRequest, PeerId, PeerList, PeerRecord, PeerSet, RankingPolicy},
    personality::Personality,
    piece_ranker::{PieceRanker, Pick},
    piece_set::PieceSet,
    wire::{Chunk, Message},
};

use super::Scheduler;

/// The state every plain scheduler keeps about the swarm.
///
/// Every piece is in exactly one of `known`, `missing` and the pieces of
/// `outstanding`, except that a piece raced in the endgame is in
/// `outstanding` more than once.
#[derive(Debug)]
pub struct Swarm {
    /// Pieces we own.
    pub known: PieceSet,
    /// Pieces we want and have not requested from anyone.
    pub missing: PieceSet,
    /// Members of the pool we are not talking to yet.
    pub non_neighbors: PeerSet,
    pub banned: PeerSet,
    pub neighbors: PeerList,
    pub outstanding: Outstanding,
    pub ranker: PieceRanker,
    pub seeding: bool,
    policy: RankingPolicy,
}

impl Swarm {
    pub fn new(known: PieceSet, policy: RankingPolicy) -> Self {
        let seeding = known.is_complete();
        let reward = if seeding {
            policy.seeder()
        } else {
            policy.leecher()
        };
        Self {
            missing: known.complement(),
            non_neighbors: PeerSet::new(),
            banned: PeerSet::new(),
            neighbors: PeerList::new(known.len(), reward, policy.potential()),
            outstanding: Outstanding::new(),
            ranker: PieceRanker::new(&known),
            seeding,
            policy,
            known,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.known.len()
    }

    pub fn is_endgame(&self) -> bool {
        self.missing.none()
    }

    pub fn send_catalog(&mut self, cx: &mut Ctx, peer: PeerId) {
        trace!("send our catalog to neighbor {peer}");
        cx.bookkeeping(peer, Message::Catalog(self.known.clone()));
        self.neighbors.set_sent_catalog(&peer);
    }

    /// Make `peer` a neighbor and make sure it has our catalog. Returns
    /// `true` if a catalog had to be sent.
    pub fn select_as_neighbor(&mut self, cx: &mut Ctx, peer: PeerId) -> bool {
        let needs_catalog = if self.neighbors.contains(&peer) {
            !self.neighbors.sent_catalog(&peer)
        } else {
            debug!("selected peer {peer} as neighbor");
            self.non_neighbors.remove(&peer);
            self.neighbors.add_peer(cx, peer, self.seeding);
            true
        };
        if needs_catalog {
            self.send_catalog(cx, peer);
        }
        needs_catalog
    }

    /// Talk to one more peer: a random candidate if there is one, or else a
    /// neighbor that has something we still need.
    pub fn select_new_neighbor(&mut self, cx: &mut Ctx) -> bool {
        if let Some(peer) = self.non_neighbors.extract_random(cx.rng()) {
            return self.select_as_neighbor(cx, peer);
        }
        if !self.missing.none() {
            let missing = self.missing.clone();
            return self.neighbors.add_a_peer(cx, &missing);
        }
        let wanted = self.outstanding.pieces(self.piece_count());
        self.neighbors.add_a_peer(cx, &wanted)
    }

    /// Select new neighbors until there are `minimal` of them, or no more
    /// can be found. Returns `true` if any was added.
    pub fn grow_neighbors(&mut self, cx: &mut Ctx, minimal: usize) -> bool {
        let mut grown = false;
        while self.neighbors.is_too_small(minimal) {
            if !self.select_new_neighbor(cx) {
                break;
            }
            grown = true;
        }
        grown
    }

    /// Ask the engine to download `piece` from `peer`.
    pub fn create_piece_request(&mut self, cx: &mut Ctx, peer: PeerId, piece: usize) {
        self.neighbors.register_piece_download(&peer, piece);
        self.outstanding.add(peer, piece);
        self.missing.clear(piece);
        cx.start_download(peer, piece);
        self.ranker.register_download_start(piece);
        debug!("download piece {piece} from {peer}");
    }

    /// The peers we may ask for one more piece, in reward order.
    pub fn peers_with_room(&self, cx: &Ctx) -> Vec<PeerId> {
        let cap = cx.config.piece_requests_per_peer;
        self.neighbors
            .reward_ranked()
            .filter(|p| p.we_are_interested() && p.has_room_for_request(cap))
            .map(|p| p.id)
            .collect()
    }

    pub fn has_room(&self, cx: &Ctx, peer: &PeerId) -> bool {
        self.neighbors
            .get(peer, false)
            .is_some_and(|p| p.has_room_for_request(cx.config.piece_requests_per_peer))
    }

    /// Start downloading the piece the ranker picks among those of `peer`.
    /// If there is none we lose interest in the peer, unless something is
    /// still in flight from it. Returns `true` if a download was started.
    pub fn request_piece(&mut self, cx: &mut Ctx, peer: PeerId, pick: &Pick<'_>) -> bool {
        let Some(available) = self
            .neighbors
            .get(&peer, false)
            .map(|p| p.known_pieces().clone())
        else {
            return false;
        };
        match self.ranker.pick(&available, pick, cx.rng()) {
            Some(piece) => {
                self.create_piece_request(cx, peer, piece);
                true
            }
            None => {
                if !self.outstanding.contains_from_peer(&peer) {
                    self.neighbors
                        .update(&peer, |p| p.set_we_are_uninterested(cx, "No pieces we need"));
                }
                false
            }
        }
    }

    /// Stop downloading anything from `peer` and put its pieces back into
    /// `missing` where no other download of them is running.
    fn drop_downloads(&mut self, cx: &mut Ctx, peer: &PeerId) {
        let dropped = self
            .outstanding
            .remove_peer(peer, &mut self.missing, &mut self.ranker);
        for piece in dropped {
            cx.cancel_download(*peer, piece);
        }
    }

    /// Take `peer` out of the neighbors and forget what it offered us.
    pub fn forget_neighbor(&mut self, cx: &mut Ctx, peer: &PeerId, delete: bool) -> Option<PeerRecord> {
        let rec = if delete {
            self.neighbors.remove(peer)?
        } else {
            self.neighbors.extract(peer)?
        };
        self.drop_downloads(cx, peer);
        self.ranker.remove_occurrences(rec.known_pieces());
        Some(rec)
    }

    /// Stop talking to `peer` for good, without touching its downloads.
    pub fn disconnect(&mut self, cx: &mut Ctx, peer: PeerId) {
        self.non_neighbors.remove(&peer);
        if let Some(rec) = self.neighbors.extract(&peer) {
            self.ranker.remove_occurrences(rec.known_pieces());
        }
        self.neighbors.disconnect(cx, peer);
        self.banned.add(peer);
        debug!("disconnected from {peer}");
    }

    pub fn remove_seeders(&mut self, cx: &mut Ctx) {
        for peer in self.neighbors.seeders() {
            self.disconnect(cx, peer);
        }
    }

    /// A download of `piece` from `peer` ended without the piece. Returns
    /// `false` if there was no such download.
    pub fn abandon_download(&mut self, peer: &PeerId, piece: usize) -> bool {
        let found = self.outstanding.extract(peer, piece).is_some();
        if found {
            self.ranker.register_download_cancel(piece);
            if self.neighbors.contains(peer) {
                self.neighbors.register_canceled(peer, piece);
            }
        }
        if !self.outstanding.contains_piece(piece) && !self.known.get(piece) {
            self.missing.set(piece);
        }
        found
    }

    /// We now own `piece`, which `peer` sent us.
    pub fn complete_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize, may_seed: bool) {
        self.ranker.complete_piece(piece);
        self.neighbors.register_completed(cx, peer, piece);
        if self.outstanding.extract(peer, piece).is_some() && self.missing.get(piece) {
            warn!("Completed piece {piece} was listed as missing");
        }
        let others = self.outstanding.cancel_piece(piece);
        if !others.is_empty() {
            info!("canceled {} extra downloads of piece {piece}", others.len());
        }
        for other in others {
            debug!("Canceling duplicate download of piece {piece} from {other}");
            cx.cancel_download(other, piece);
            self.neighbors.register_canceled(&other, piece);
        }
        self.missing.clear(piece);
        self.known.set(piece);
        trace!("we now have {} pieces", self.known.cardinality());

        if may_seed && !self.seeding && self.known.is_complete() {
            self.seeding = true;
            self.neighbors.stop_our_downloading(cx);
            self.neighbors.set_reward_ranker(self.policy.seeder());
            self.remove_seeders(cx);
        }
    }

    /// Pieces that are wanted but neither missing nor outstanding. Always
    /// empty unless the bookkeeping is broken.
    pub fn lost_pieces(&self) -> PieceSet {
        let mut lost = self.known.complement();
        lost.and_not(&self.missing);
        lost.and_not(&self.outstanding.pieces(self.piece_count()));
        lost
    }

    pub fn dump_state(&self, name: &str) {
        info!("{name}: seeding={}", self.seeding);
        info!(
            "{} known, {} outstanding, {} unrequested missing pieces",
            self.known.cardinality(),
            self.outstanding.len(),
            self.missing.cardinality()
        );
        if !self.non_neighbors.is_empty() {
            info!("non neighbors={:?}", self.non_neighbors);
        }
        if !self.banned.is_empty() {
            info!("banned peers={:?}", self.banned);
        }
        info!("outstanding pieces={}", self.outstanding);
        self.neighbors.dump_state();
        info!("piece ranking={}", self.ranker);
        self.ranker.ranking_is_sane();
    }
}

/// The part of a plain scheduler that differs between the variants.
pub trait Strategy: std::fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Top up the neighbor set.
    fn maintain_neighbors(&mut self, swarm: &mut Swarm, cx: &mut Ctx);

    /// Hand out piece downloads to the peers that have room for them.
    fn maintain_outstanding(&mut self, swarm: &mut Swarm, cx: &mut Ctx);

    fn next_chunk_request(&mut self, swarm: &mut Swarm) -> Option<ChunkRequest> {
        swarm.neighbors.next_chunk_request()
    }

    /// A cache never wants the whole file for itself, so it never seeds.
    fn may_seed(&self) -> bool {
        true
    }
}

/// A [`Scheduler`] over a [`Swarm`], driven by a [`Strategy`].
#[derive(Debug)]
pub struct SwarmScheduler<S> {
    swarm: Swarm,
    strategy: S,
}

impl<S: Strategy> SwarmScheduler<S> {
    pub fn with_strategy(known: PieceSet, policy: RankingPolicy, strategy: S) -> Self {
        let mut swarm = Swarm::new(known, policy);
        swarm.seeding &= strategy.may_seed();
        Self { swarm, strategy }
    }

    pub fn swarm(&self) -> &Swarm {
        &self.swarm
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    fn maintain(&mut self, cx: &mut Ctx) {
        self.strategy.maintain_neighbors(&mut self.swarm, cx);
        self.strategy.maintain_outstanding(&mut self.swarm, cx);
    }
}

impl<S: Strategy> Scheduler for SwarmScheduler<S> {
    fn name(&self) -> String {
        self.strategy.name().to_owned()
    }

    fn add_peer(
        &mut self,
        cx: &mut Ctx,
        peer: PeerId,
        start_talking: bool,
        personality: &mut dyn Personality,
    ) {
        trace!("{}: new peer {peer}", self.strategy.name());
        personality.new_peer(peer);
        if start_talking {
            self.swarm.select_as_neighbor(cx, peer);
        } else {
            self.swarm.non_neighbors.add(peer);
            self.strategy.maintain_neighbors(&mut self.swarm, cx);
        }
    }

    fn add_record(&mut self, cx: &mut Ctx, rec: PeerRecord) {
        trace!("{}: new active peer {}", self.strategy.name(), rec.id);
        let id = rec.id;
        let sent_catalog = rec.sent_catalog();
        self.swarm.ranker.add_occurrences(rec.known_pieces());
        self.swarm.non_neighbors.remove(&id);
        self.swarm.neighbors.add_record(cx, rec, self.swarm.seeding);
        if !sent_catalog {
            self.swarm.send_catalog(cx, id);
        }
    }

    fn remove_peer(&mut self, cx: &mut Ctx, peer: &PeerId) -> bool {
        let mut known = self.swarm.non_neighbors.remove(peer);
        known |= self.swarm.forget_neighbor(cx, peer, true).is_some();
        known |= self.swarm.banned.remove(peer);
        trace!("{}: removed peer {peer}", self.strategy.name());
        self.strategy.maintain_neighbors(&mut self.swarm, cx);
        known
    }

    fn extract_peer(&mut self, cx: &mut Ctx, peer: &PeerId) -> Option<PeerRecord> {
        let rec = self.swarm.forget_neighbor(cx, peer, false);
        self.strategy.maintain_neighbors(&mut self.swarm, cx);
        rec
    }

    fn register_peer_has_piece(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        piece: usize,
        personality: &mut dyn Personality,
    ) {
        if self.swarm.banned.contains(peer) {
            trace!("ignored have of banned peer {peer}");
            return;
        }
        let is_new = self
            .swarm
            .neighbors
            .get(peer, false)
            .is_some_and(|p| !p.known_pieces().get(piece));
        let we_may_have_piece = !self.swarm.missing.get(piece);
        let is_seeder = self.swarm.neighbors.peer_has_piece(
            cx,
            peer,
            piece,
            we_may_have_piece,
            self.swarm.seeding,
            personality,
        );
        if is_new {
            self.swarm.ranker.add_occurrence(piece);
        }
        if is_seeder && self.swarm.seeding && self.strategy.may_seed() {
            self.swarm.disconnect(cx, *peer);
        }
        self.maintain(cx);
    }

    fn set_peer_has_pieces(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        bits: PieceSet,
        personality: &mut dyn Personality,
    ) {
        if self.swarm.banned.contains(peer) {
            trace!("ignored catalog of banned peer {peer}");
            return;
        }
        if bits.len() != self.swarm.piece_count() {
            warn!(
                "Peer {peer} sent a catalog of {} pieces, we have {}",
                bits.len(),
                self.swarm.piece_count()
            );
            return;
        }
        trace!("peer {peer} sent catalog {bits}");
        self.swarm.select_as_neighbor(cx, *peer);
        if let Some(old) = self
            .swarm
            .neighbors
            .get(peer, false)
            .map(|p| p.known_pieces().clone())
        {
            self.swarm.ranker.remove_occurrences(&old);
        }
        self.swarm.ranker.add_occurrences(&bits);
        let is_seeder =
            self.swarm
                .neighbors
                .set_bitset(cx, peer, bits, self.swarm.seeding, personality);
        if is_seeder && self.swarm.seeding && self.strategy.may_seed() {
            self.swarm.disconnect(cx, *peer);
        }
        self.maintain(cx);
    }

    fn request_pieces(&mut self, cx: &mut Ctx, set: &PieceSet) {
        if set.len() != self.swarm.piece_count() {
            warn!("Request for a piece set of the wrong size {}", set.len());
            return;
        }
        let mut wanted = set.clone();
        wanted.and_not(&self.swarm.known);
        wanted.and_not(&self.swarm.outstanding.pieces(self.swarm.piece_count()));
        self.swarm.missing.or(&wanted);
        self.maintain(cx);
    }

    fn register_received_chunk(&mut self, peer: &PeerId, len: usize) {
        self.swarm.neighbors.register_received_chunk(peer, len);
    }

    fn register_incorrect_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize) -> bool {
        warn!("Peer {peer} sent an incorrect piece {piece}; BANNED");
        if !self.swarm.abandon_download(peer, piece) {
            warn!("No such incorrect piece: piece={piece} peer={peer}");
        }
        self.swarm.forget_neighbor(cx, peer, true);
        self.swarm.non_neighbors.remove(peer);
        self.swarm.banned.add(*peer);
        self.swarm.neighbors.disconnect(cx, *peer);
        self.maintain(cx);
        true
    }

    fn register_failed_piece_download(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        piece: usize,
    ) -> bool {
        debug!("could not download piece {piece} from peer {peer}");
        if !self.swarm.abandon_download(peer, piece) {
            warn!("No such failed piece: piece={piece} peer={peer}");
        }
        self.maintain(cx);
        false
    }

    fn register_completed_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize) {
        let may_seed = self.strategy.may_seed();
        self.swarm.complete_piece(cx, peer, piece, may_seed);
        self.maintain(cx);
    }

    fn add_chunk_request(&mut self, cx: &mut Ctx, peer: &PeerId, chunk: Chunk) {
        if self.swarm.banned.contains(peer) {
            trace!("ignored chunk request of banned peer {peer}");
            return;
        }
        self.swarm.non_neighbors.remove(peer);
        self.swarm
            .neighbors
            .add_chunk_request(cx, peer, chunk, self.swarm.seeding);
    }

    fn remove_chunk_request(&mut self, peer: &PeerId, chunk: &Chunk) {
        self.swarm.neighbors.remove_chunk_request(peer, chunk);
    }

    fn next_chunk_request(&mut self) -> Option<ChunkRequest> {
        self.strategy.next_chunk_request(&mut self.swarm)
    }

    fn has_incoming_chunk_requests(&self) -> bool {
        self.swarm.neighbors.has_incoming_chunk_requests()
    }

    fn set_peer_has_choked_us(&mut self, cx: &mut Ctx, peer: &PeerId, flag: bool) {
        let is_neighbor = self.swarm.neighbors.set_peer_has_choked_us(peer, flag);
        if !is_neighbor && !self.swarm.banned.contains(peer) {
            warn!("Non-neighbor {peer} has choked us");
        }
        self.maintain(cx);
    }

    fn set_peer_is_interested(&mut self, cx: &mut Ctx, peer: &PeerId, flag: bool) {
        self.swarm.neighbors.set_peer_is_interested(peer, flag);
        self.strategy.maintain_neighbors(&mut self.swarm, cx);
    }

    fn generate_more_transmission(&mut self, cx: &mut Ctx) -> bool {
        self.swarm.select_new_neighbor(cx)
    }

    fn peer_joined_as_helper(
        &mut self,
        _cx: &mut Ctx,
        peer: &PeerId,
        _personality: &mut dyn Personality,
    ) {
        warn!("{}: peer {peer} sent us a join message", self.strategy.name());
    }

    fn peer_resigned_as_helper(&mut self, _cx: &mut Ctx, peer: &PeerId) -> bool {
        warn!(
            "{}: peer {peer} sent us a resignation message",
            self.strategy.name()
        );
        false
    }

    fn source_peer_count(&self) -> usize {
        self.swarm.neighbors.len()
    }

    fn ask_for_help(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        _personality: &mut dyn Personality,
    ) -> bool {
        // a plain node never helps anyone
        cx.bookkeeping(*peer, Message::ResignAsHelper);
        false
    }

    fn handle_stopped_helping(&mut self, _cx: &mut Ctx, peer: &PeerId) {
        debug!("ignored stop helping message from {peer}");
    }

    fn handle_closed_connection(&mut self, peer: &PeerId) {
        self.swarm.neighbors.set_wants_to_talk(peer, false);
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.swarm.neighbors.contains(peer)
            || self.swarm.non_neighbors.contains(peer)
            || self.swarm.banned.contains(peer)
    }

    fn update_credit(&mut self, peer: &PeerId, credit: CreditValue) {
        self.swarm.neighbors.update_credit(peer, credit);
    }

    fn shutdown(&mut self, cx: &mut Ctx) {
        self.swarm.neighbors.shutdown(cx);
    }

    fn dump_state(&self) {
        self.swarm.dump_state(self.strategy.name());
    }

    fn print_statistics(&self) {
        info!("{} scheduler:", self.strategy.name());
        self.swarm.neighbors.print_statistics();
    }
}
