use rand::Rng;
use tokio::time::Instant;
use tracing::trace;

use crate::{
    context::Ctx,
    peer::{ChunkRequest, PeerId, RankingPolicy},
    piece_ranker::Pick,
    piece_set::PieceSet,
};

use super::{Strategy, Swarm, SwarmScheduler};

/// Serve a fixed number of peers at a time.
///
/// All slots but the last go to the best ranked interested peers, the last
/// one to a random interested peer outside of them, so newcomers get a
/// chance to prove themselves. The slots are refilled every
/// `slot_update_interval`, or sooner when new neighbors show up. Only
/// peers in a slot get their chunk requests served, and the slots take
/// turns.
#[derive(Debug, Clone)]
pub struct Slotted {
    slots: Vec<Option<PeerId>>,
    last_update: Option<Instant>,
}

pub type SlottedScheduler = SwarmScheduler<Slotted>;

impl SlottedScheduler {
    pub fn new(known: PieceSet, policy: RankingPolicy, slots: usize) -> Self {
        Self::with_strategy(known, policy, Slotted::new(slots))
    }
}

impl Slotted {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: vec![None; slots.max(1)],
            last_update: None,
        }
    }

    pub fn slots(&self) -> &[Option<PeerId>] {
        &self.slots
    }

    fn update_is_due(&self, cx: &Ctx) -> bool {
        self.last_update
            .map_or(true, |t| t.elapsed() > cx.config.slot_update_interval())
    }

    /// Reassign every slot. Returns `true` if we could use more peers: a
    /// slot stayed empty or went to a peer that chokes us.
    fn fill_slots(&mut self, swarm: &mut Swarm, cx: &mut Ctx) -> bool {
        let interested: Vec<PeerId> = swarm
            .neighbors
            .reward_ranked()
            .filter(|p| !p.is_deleted() && p.peer_is_interested())
            .map(|p| p.id)
            .collect();
        let n = self.slots.len();
        let performance = n - 1;

        let old = std::mem::replace(&mut self.slots, vec![None; n]);
        for (slot, peer) in self.slots.iter_mut().take(performance).zip(&interested) {
            *slot = Some(*peer);
        }
        if interested.len() >= n {
            let ix = cx.rng().gen_range(performance..interested.len());
            self.slots[performance] = Some(interested[ix]);
        }

        let mut need_more = false;
        for slot in self.slots.clone() {
            let Some(peer) = slot else {
                need_more = true;
                continue;
            };
            let choked_us = swarm
                .neighbors
                .update(&peer, |p| {
                    p.set_we_unchoked_peer(cx, "peer has a slot");
                    p.peer_has_choked_us()
                })
                .unwrap_or(true);
            need_more |= choked_us;
        }
        for peer in old.into_iter().flatten() {
            if !self.slots.contains(&Some(peer)) {
                swarm
                    .neighbors
                    .update(&peer, |p| p.set_we_choked_peer(cx, "peer lost its slot"));
            }
        }
        trace!("slots: {:?}", self.slots);
        need_more
    }

    fn has_unused_slots(&self, swarm: &Swarm) -> bool {
        self.slots.iter().any(|slot| match slot {
            Some(peer) => swarm
                .neighbors
                .get(peer, false)
                .map_or(true, |p| p.peer_has_choked_us()),
            None => true,
        })
    }

    fn endgame(&self, swarm: &mut Swarm, cx: &mut Ctx) {
        let max_downloads = cx.config.maximal_endgame_replication;
        let max_choices = cx.config.ranker_maximum_choices;
        for peer in swarm.peers_with_room(cx) {
            while swarm.has_room(cx, &peer) {
                let from_peer = swarm.outstanding.pieces_from_peer(&peer, swarm.piece_count());
                let pick = Pick {
                    max_downloads,
                    max_occurrences: None,
                    exclude: Some(&from_peer),
                    max_choices,
                };
                let Some(available) = swarm
                    .neighbors
                    .get(&peer, false)
                    .map(|p| p.known_pieces().clone())
                else {
                    break;
                };
                let Some(piece) = swarm.ranker.pick(&available, &pick, cx.rng()) else {
                    break;
                };
                swarm.create_piece_request(cx, peer, piece);
            }
        }
    }
}

impl Strategy for Slotted {
    fn name(&self) -> &'static str {
        "Slotted"
    }

    fn maintain_neighbors(&mut self, swarm: &mut Swarm, cx: &mut Ctx) {
        let mut grown = false;
        if self.has_unused_slots(swarm) || swarm.neighbors.is_too_small(cx.config.neighbor_set_size) {
            let maximal = cx.config.maximal_tracker_set_size;
            grown = swarm.grow_neighbors(cx, maximal);
        }
        if grown || self.update_is_due(cx) {
            self.last_update = Some(Instant::now());
            self.fill_slots(swarm, cx);
            self.maintain_outstanding(swarm, cx);
        }
    }

    fn maintain_outstanding(&mut self, swarm: &mut Swarm, cx: &mut Ctx) {
        if swarm.seeding {
            return;
        }
        if swarm.is_endgame() {
            self.endgame(swarm, cx);
        } else {
            let pick = Pick::fresh(cx.config.ranker_maximum_choices);
            for peer in swarm.peers_with_room(cx) {
                while swarm.has_room(cx, &peer) && swarm.request_piece(cx, peer, &pick) {}
            }
        }
        if self.update_is_due(cx) {
            self.last_update = Some(Instant::now());
            if self.fill_slots(swarm, cx) {
                self.maintain_neighbors(swarm, cx);
            }
        }
    }

    fn next_chunk_request(&mut self, swarm: &mut Swarm) -> Option<ChunkRequest> {
        let mut res = None;
        for peer in self.slots.iter().flatten() {
            if let Some(r) = swarm.neighbors.next_chunk_request_of(peer) {
                trace!("next granted chunk request is {} of {}", r.chunk, r.peer);
                res = Some(r);
                break;
            }
        }
        // next time another slot goes first
        self.slots.rotate_left(1);
        res
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        scheduler::testing::{ctx, id},
        wire::{Chunk, Message},
    };

    use super::*;

    fn swarm_with(cx: &mut Ctx, peers: u8) -> Swarm {
        let mut swarm = Swarm::new(PieceSet::new(4), RankingPolicy::OneTrack);
        for n in 1..=peers {
            swarm.select_as_neighbor(cx, id(n));
        }
        cx.take_outbox();
        swarm
    }

    fn chokes_to(cx: &mut Ctx, peer: PeerId) -> usize {
        cx.take_outbox()
            .iter()
            .filter(|o| o.to == peer && matches!(o.msg, Message::Choke { choked: true, .. }))
            .count()
    }

    #[test]
    fn best_peers_and_one_random_peer_get_slots() {
        let mut cx = ctx(Config::default());
        let mut swarm = swarm_with(&mut cx, 4);
        let mut slotted = Slotted::new(2);

        let need_more = slotted.fill_slots(&mut swarm, &mut cx);
        assert!(!need_more);
        // one track ranks the newest peer first
        assert_eq!(slotted.slots()[0], Some(id(4)));
        let lucky = slotted.slots()[1].unwrap();
        assert_ne!(lucky, id(4));

        // the lucky peer loses interest and its slot, and is choked once
        swarm.neighbors.set_peer_is_interested(&lucky, false);
        slotted.fill_slots(&mut swarm, &mut cx);
        assert!(!slotted.slots().contains(&Some(lucky)));
        assert_eq!(chokes_to(&mut cx, lucky), 1);
        slotted.fill_slots(&mut swarm, &mut cx);
        assert_eq!(chokes_to(&mut cx, lucky), 0);
    }

    #[test]
    fn empty_slots_ask_for_more_peers() {
        let mut cx = ctx(Config::default());
        let mut swarm = swarm_with(&mut cx, 1);
        let mut slotted = Slotted::new(3);

        assert!(slotted.fill_slots(&mut swarm, &mut cx));
        assert!(slotted.has_unused_slots(&swarm));
        assert_eq!(slotted.slots().iter().flatten().count(), 1);
    }

    #[test]
    fn slots_take_turns() {
        let mut cx = ctx(Config::default());
        let mut swarm = swarm_with(&mut cx, 2);
        let mut slotted = Slotted::new(2);
        slotted.fill_slots(&mut swarm, &mut cx);
        let first = slotted.slots()[0].unwrap();
        let second = slotted.slots()[1].unwrap();

        for n in 1..=2 {
            for off in 0..2 {
                swarm
                    .neighbors
                    .add_chunk_request(&mut cx, &id(n), Chunk::new(0, off * 16, 16), false);
            }
        }
        let served: Vec<PeerId> = std::iter::from_fn(|| slotted.next_chunk_request(&mut swarm))
            .map(|r| r.peer)
            .collect();
        assert_eq!(served, vec![first, second, first, second]);
        assert!(!swarm.neighbors.has_incoming_chunk_requests());
    }
}
