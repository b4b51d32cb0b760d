//! Schedulers decide which peers we talk to, what we download from whom
//! and whose chunk requests we serve.
//!
//! The engine only knows the [`Scheduler`] trait. The plain schedulers are
//! a [`SwarmScheduler`] over one of the [`Strategy`]s in this module, the
//! proxy schedulers in [`crate::proxy`] wrap plain ones.
mod cache;
mod greedy;
mod slotted;
mod swarm;

pub use cache::*;
pub use greedy::*;
pub use slotted::*;
pub use swarm::*;

use std::fmt::Debug;

use crate::{
    context::Ctx,
    credit::CreditValue,
    peer::{ChunkRequest, PeerId, PeerRecord},
    personality::Personality,
    piece_set::PieceSet,
    wire::Chunk,
};

pub trait Scheduler: Debug + Send {
    fn name(&self) -> String;

    /// A new member of the pool. With `start_talking` it becomes a
    /// neighbor right away, otherwise it waits as a candidate.
    fn add_peer(
        &mut self,
        cx: &mut Ctx,
        peer: PeerId,
        start_talking: bool,
        personality: &mut dyn Personality,
    );

    /// Adopt a record that another scheduler gave up.
    fn add_record(&mut self, cx: &mut Ctx, rec: PeerRecord);

    /// Forget `peer`. Returns `false` if we never heard of it.
    fn remove_peer(&mut self, cx: &mut Ctx, peer: &PeerId) -> bool;

    /// Like [`Scheduler::remove_peer`], but hand the record over so another
    /// scheduler can adopt it.
    fn extract_peer(&mut self, cx: &mut Ctx, peer: &PeerId) -> Option<PeerRecord>;

    fn register_peer_has_piece(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        piece: usize,
        personality: &mut dyn Personality,
    );

    fn set_peer_has_pieces(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        bits: PieceSet,
        personality: &mut dyn Personality,
    );

    /// Add `set` to the pieces we want.
    fn request_pieces(&mut self, cx: &mut Ctx, set: &PieceSet);

    fn register_received_chunk(&mut self, peer: &PeerId, len: usize);

    /// `peer` sent us a piece that failed verification. Returns `true` if
    /// the peer was banned.
    fn register_incorrect_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize) -> bool;

    /// The download of `piece` from `peer` was abandoned. Returns `true`
    /// if the peer was banned.
    fn register_failed_piece_download(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize)
        -> bool;

    fn register_completed_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize);

    fn add_chunk_request(&mut self, cx: &mut Ctx, peer: &PeerId, chunk: Chunk);
    fn remove_chunk_request(&mut self, peer: &PeerId, chunk: &Chunk);

    /// The next chunk request we should serve.
    fn next_chunk_request(&mut self) -> Option<ChunkRequest>;
    fn has_incoming_chunk_requests(&self) -> bool;

    fn set_peer_has_choked_us(&mut self, cx: &mut Ctx, peer: &PeerId, flag: bool);
    fn set_peer_is_interested(&mut self, cx: &mut Ctx, peer: &PeerId, flag: bool);

    /// The send queue ran dry, try to find someone to send to. Returns
    /// `true` if anything changed.
    fn generate_more_transmission(&mut self, cx: &mut Ctx) -> bool;

    fn peer_joined_as_helper(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        personality: &mut dyn Personality,
    );

    /// Returns `true` if `peer` was a helper of ours.
    fn peer_resigned_as_helper(&mut self, cx: &mut Ctx, peer: &PeerId) -> bool;

    /// Peers we can download from.
    fn source_peer_count(&self) -> usize;

    /// `peer` asked us to help it. Returns `true` if we accepted.
    fn ask_for_help(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        personality: &mut dyn Personality,
    ) -> bool;

    fn handle_stopped_helping(&mut self, cx: &mut Ctx, peer: &PeerId);
    fn handle_closed_connection(&mut self, peer: &PeerId);

    /// Do we know `peer` in any role, banned included.
    fn contains(&self, peer: &PeerId) -> bool;

    fn update_credit(&mut self, peer: &PeerId, credit: CreditValue);

    /// Say goodbye to every peer that still talks to us.
    fn shutdown(&mut self, cx: &mut Ctx);

    fn dump_state(&self);
    fn print_statistics(&self);
}


#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::{
        config::Config,
        peer::RankingPolicy,
        personality::{GreedyPersonality, TradingPersonality},
    };

    use super::{
        testing::{ctx, id},
        *,
    };

    const PIECES: usize = 12;
    const PEERS: u8 = 6;

    /// Every piece is owned, missing or in flight, never two of these.
    fn assert_accounted(swarm: &Swarm, step: &str) {
        let in_flight = swarm.outstanding.pieces(PIECES);
        assert!(swarm.lost_pieces().none(), "{step}: lost {}", swarm.lost_pieces());
        assert!(!swarm.known.intersects(&swarm.missing), "{step}: owned and missing");
        assert!(!swarm.known.intersects(&in_flight), "{step}: owned and in flight");
        assert!(!swarm.missing.intersects(&in_flight), "{step}: missing and in flight");
        assert!(swarm.ranker.ranking_is_sane(), "{step}: ranking");
    }

    fn random_set(rng: &mut StdRng) -> PieceSet {
        let mut set = PieceSet::new(PIECES);
        for piece in 0..PIECES {
            if rng.gen_bool(0.4) {
                set.set(piece);
            }
        }
        set
    }

    /// Drive `s` through a seeded mix of what the engine reports, checking
    /// the piece accounting after every call. Downloads only end the way
    /// the engine ends them: completed, failed or refused as incorrect.
    /// Returns whether the endgame was reached.
    fn run_random_events<S: Strategy>(
        mut s: SwarmScheduler<S>,
        personality: &mut dyn Personality,
        seed: u64,
    ) -> bool {
        let mut cx = ctx(Config::default());
        let mut rng = StdRng::seed_from_u64(seed);
        let mut members: Vec<PeerId> = Vec::new();
        let mut endgame = false;

        for step in 0..500 {
            let outsiders: Vec<PeerId> = (1..=PEERS)
                .map(id)
                .filter(|p| !members.contains(p))
                .collect();
            let member = (!members.is_empty()).then(|| members[rng.gen_range(0..members.len())]);
            let downloads: Vec<_> = s.swarm().outstanding.iter().copied().collect();
            let download =
                (!downloads.is_empty()).then(|| downloads[rng.gen_range(0..downloads.len())]);

            let op = match (rng.gen_range(0..12), member, download) {
                (_, None, _) | (0, ..) if !outsiders.is_empty() => {
                    let peer = outsiders[rng.gen_range(0..outsiders.len())];
                    members.push(peer);
                    s.add_peer(&mut cx, peer, rng.gen_bool(0.5), personality);
                    "join"
                }
                (1, Some(peer), _) => {
                    let piece = rng.gen_range(0..PIECES);
                    s.register_peer_has_piece(&mut cx, &peer, piece, personality);
                    "have"
                }
                (2, Some(peer), _) => {
                    let bits = random_set(&mut rng);
                    s.set_peer_has_pieces(&mut cx, &peer, bits, personality);
                    "catalog"
                }
                (3..=5, _, Some(d)) => {
                    s.register_completed_piece(&mut cx, &d.peer, d.piece);
                    "complete"
                }
                (6, _, Some(d)) => {
                    s.register_failed_piece_download(&mut cx, &d.peer, d.piece);
                    "failed download"
                }
                (7, _, Some(d)) => {
                    s.register_incorrect_piece(&mut cx, &d.peer, d.piece);
                    "incorrect piece"
                }
                (8, Some(peer), _) => {
                    s.remove_peer(&mut cx, &peer);
                    members.retain(|m| *m != peer);
                    "disconnect"
                }
                (9, Some(peer), _) => {
                    s.set_peer_has_choked_us(&mut cx, &peer, rng.gen_bool(0.2));
                    "choke"
                }
                _ => {
                    s.generate_more_transmission(&mut cx);
                    "idle"
                }
            };
            cx.take_outbox();
            cx.take_downloads();

            let swarm = s.swarm();
            assert_accounted(swarm, &format!("seed {seed} step {step} ({op})"));
            endgame |= swarm.is_endgame() && !swarm.outstanding.is_empty();
            if swarm.known.is_complete() {
                break;
            }
        }
        endgame
    }

    #[test]
    fn greedy_accounts_for_every_piece() {
        let mut endgame = false;
        for seed in 0..16 {
            let s = GreedyScheduler::new(PieceSet::new(PIECES), RankingPolicy::TitForTat);
            endgame |= run_random_events(s, &mut GreedyPersonality::default(), seed);
        }
        assert!(endgame, "no run got to the endgame");
    }

    #[test]
    fn slotted_accounts_for_every_piece() {
        for seed in 0..16 {
            let s = SlottedScheduler::new(PieceSet::new(PIECES), RankingPolicy::Credit, 3);
            run_random_events(s, &mut GreedyPersonality::default(), seed);
        }
    }

    #[test]
    fn cache_accounts_for_every_piece() {
        for seed in 0..16 {
            let s = CacheScheduler::new(PieceSet::new(PIECES), RankingPolicy::TitForTat);
            run_random_events(s, &mut TradingPersonality::default(), seed);
        }
    }
}
