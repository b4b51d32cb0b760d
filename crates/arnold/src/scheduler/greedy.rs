use tracing::trace;

use crate::{
    context::Ctx,
    peer::RankingPolicy,
    piece_ranker::Pick,
    piece_set::PieceSet,
    utils::to_human_readable,
};

use super::{Strategy, Swarm, SwarmScheduler};

/// Download from every peer that lets us, as fast as possible.
///
/// There is no limit on the peers we serve. Before the endgame every peer
/// with room gets one of the rarest pieces nobody is downloading yet. In
/// the endgame the fastest peers race the pieces with the fewest
/// downloads, up to `maximal_endgame_replication` downloads per piece.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greedy;

pub type GreedyScheduler = SwarmScheduler<Greedy>;

impl GreedyScheduler {
    pub fn new(known: PieceSet, policy: RankingPolicy) -> Self {
        Self::with_strategy(known, policy, Greedy)
    }
}

impl Greedy {
    /// The piece of `potential` with the fewest downloads in flight, unless
    /// even that one is raced enough already.
    pub fn best_endgame_piece(swarm: &Swarm, potential: &PieceSet, ceiling: usize) -> Option<usize> {
        let (piece, replication) = potential
            .iter()
            .map(|p| (p, swarm.outstanding.count_replication(p)))
            .min_by_key(|(_, r)| *r)?;
        if replication >= ceiling {
            return None;
        }
        Some(piece)
    }

    fn endgame(&self, swarm: &mut Swarm, cx: &mut Ctx) {
        let cap = cx.config.piece_requests_per_peer;
        let ceiling = cx.config.maximal_endgame_replication as usize;
        let wanted = swarm.known.complement();

        for peer in swarm.neighbors.speed_ids() {
            loop {
                let Some(p) = swarm.neighbors.get(&peer, false) else {
                    break;
                };
                if !p.has_room_for_request(cap) {
                    break;
                }
                trace!(
                    "endgame: {} receives {}/s",
                    peer,
                    to_human_readable(p.receive_rate())
                );
                if !p.has_some_of(&wanted) {
                    if !swarm.outstanding.contains_from_peer(&peer) {
                        swarm
                            .neighbors
                            .update(&peer, |p| p.set_we_are_uninterested(cx, "has no pieces that we want"));
                    }
                    break;
                }
                let mut potential = p.potential_pieces(&wanted);
                potential.and_not(&swarm.outstanding.pieces_from_peer(&peer, swarm.piece_count()));
                let Some(piece) = Self::best_endgame_piece(swarm, &potential, ceiling) else {
                    break;
                };
                swarm.create_piece_request(cx, peer, piece);
            }
        }
    }

    fn before_endgame(&self, swarm: &mut Swarm, cx: &mut Ctx) {
        let pick = Pick::fresh(cx.config.ranker_maximum_choices);
        for peer in swarm.peers_with_room(cx) {
            while swarm.has_room(cx, &peer) && swarm.request_piece(cx, peer, &pick) {}
        }
    }
}

impl Strategy for Greedy {
    fn name(&self) -> &'static str {
        "Greedy"
    }

    fn maintain_neighbors(&mut self, swarm: &mut Swarm, cx: &mut Ctx) {
        let minimal = cx.config.neighbor_set_size;
        swarm.grow_neighbors(cx, minimal);
    }

    fn maintain_outstanding(&mut self, swarm: &mut Swarm, cx: &mut Ctx) {
        if swarm.seeding {
            return;
        }
        if swarm.is_endgame() {
            self.endgame(swarm, cx);
        } else {
            self.before_endgame(swarm, cx);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        context::DownloadCmd,
        personality::GreedyPersonality,
        scheduler::{
            testing::{ctx, id, set},
            Scheduler,
        },
        wire::Message,
    };

    use super::*;

    fn leecher(pieces: usize) -> GreedyScheduler {
        GreedyScheduler::new(PieceSet::new(pieces), RankingPolicy::TitForTat)
    }

    #[test]
    fn catalog_starts_downloads() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut s = leecher(4);

        s.add_peer(&mut cx, id(1), false, &mut personality);
        // the only candidate is promoted and gets our catalog
        assert!(s.swarm().neighbors.contains(&id(1)));
        assert!(cx
            .take_outbox()
            .iter()
            .any(|o| o.to == id(1) && matches!(o.msg, Message::Catalog(_))));

        s.set_peer_has_pieces(&mut cx, &id(1), set(4, &[0, 1, 2]), &mut personality);
        let downloads = cx.take_downloads();
        assert_eq!(downloads.len(), cx.config.piece_requests_per_peer);
        for d in &downloads {
            let DownloadCmd::Start { peer, piece } = d else {
                panic!()
            };
            assert_eq!(*peer, id(1));
            assert!(*piece < 3);
            assert!(!s.swarm().missing.get(*piece));
        }
        assert_eq!(s.swarm().outstanding.len(), 2);
        assert!(s.swarm().lost_pieces().none());
    }

    #[test]
    fn incorrect_piece_bans_and_requeues() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut s = leecher(4);

        s.add_peer(&mut cx, id(1), true, &mut personality);
        s.set_peer_has_pieces(&mut cx, &id(1), set(4, &[2]), &mut personality);
        assert_eq!(cx.take_downloads(), vec![DownloadCmd::Start { peer: id(1), piece: 2 }]);
        cx.take_outbox();

        assert!(s.register_incorrect_piece(&mut cx, &id(1), 2));
        assert!(!s.swarm().neighbors.contains(&id(1)));
        assert!(s.swarm().banned.contains(&id(1)));
        assert!(s.contains(&id(1)));
        assert!(s.swarm().missing.get(2));
        assert!(s.swarm().outstanding.is_empty());
        assert_eq!(s.swarm().ranker.occurrences(2), Some(0));
        assert!(cx
            .take_outbox()
            .iter()
            .any(|o| o.to == id(1) && o.msg == Message::CloseConnection));

        // a banned peer is not heard anymore
        s.set_peer_has_pieces(&mut cx, &id(1), set(4, &[0, 1, 2, 3]), &mut personality);
        assert!(!s.swarm().neighbors.contains(&id(1)));
        assert!(cx.take_downloads().is_empty());
    }

    #[test]
    fn endgame_respects_the_replication_ceiling() {
        let config = Config {
            piece_requests_per_peer: 1,
            ..Default::default()
        };
        let mut cx = ctx(config);
        let mut personality = GreedyPersonality::default();
        // only piece 1 is left
        let mut s = GreedyScheduler::new(set(2, &[0]), RankingPolicy::TitForTat);

        for n in 1..=3 {
            s.add_peer(&mut cx, id(n), true, &mut personality);
        }
        s.set_peer_has_pieces(&mut cx, &id(1), set(2, &[1]), &mut personality);
        assert_eq!(s.swarm().outstanding.count_replication(1), 1);
        assert!(s.swarm().is_endgame());

        s.set_peer_has_pieces(&mut cx, &id(2), set(2, &[1]), &mut personality);
        assert_eq!(s.swarm().outstanding.count_replication(1), 2);

        s.set_peer_has_pieces(&mut cx, &id(3), set(2, &[1]), &mut personality);
        assert_eq!(s.swarm().outstanding.count_replication(1), 2);
        assert!(!s.swarm().outstanding.contains_from_peer(&id(3)));

        let mut potential = PieceSet::new(2);
        potential.set(1);
        assert_eq!(Greedy::best_endgame_piece(s.swarm(), &potential, 2), None);

        // the first copy to arrive cancels the other one
        cx.take_downloads();
        s.register_completed_piece(&mut cx, &id(2), 1);
        assert_eq!(cx.take_downloads(), vec![DownloadCmd::Cancel { peer: id(1), piece: 1 }]);
        assert!(s.swarm().seeding);
        assert!(s.swarm().outstanding.is_empty());
    }

    #[test]
    fn peer_leaving_requeues_its_pieces() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut s = leecher(4);

        s.add_peer(&mut cx, id(1), true, &mut personality);
        s.set_peer_has_pieces(&mut cx, &id(1), set(4, &[0, 1]), &mut personality);
        assert_eq!(s.swarm().outstanding.len(), 2);

        assert!(s.remove_peer(&mut cx, &id(1)));
        assert!(s.swarm().outstanding.is_empty());
        assert!(s.swarm().missing.is_complete());
        assert_eq!(s.swarm().ranker.occurrences(0), Some(0));
        assert!(!s.remove_peer(&mut cx, &id(1)));
    }

    #[test]
    fn repeated_have_counts_once() {
        let mut cx = ctx(Config::default());
        let mut personality = GreedyPersonality::default();
        let mut s = leecher(4);

        s.add_peer(&mut cx, id(1), true, &mut personality);
        s.register_peer_has_piece(&mut cx, &id(1), 3, &mut personality);
        s.register_peer_has_piece(&mut cx, &id(1), 3, &mut personality);
        assert_eq!(s.swarm().ranker.occurrences(3), Some(1));
        assert!(s.swarm().ranker.ranking_is_sane());
    }
}
