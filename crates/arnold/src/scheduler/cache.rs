use crate::{
    context::Ctx,
    peer::RankingPolicy,
    piece_ranker::Pick,
    piece_set::PieceSet,
};

use super::{Strategy, Swarm, SwarmScheduler};

/// For a node that does not want the file, but earns credit by passing
/// pieces on.
///
/// A piece is only worth caching while few neighbors have it: at most
/// `maximal_cache_replication_fraction` of the neighbor set. A cache never
/// becomes a seeder, so it never drops peers for being seeders.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cache;

pub type CacheScheduler = SwarmScheduler<Cache>;

impl CacheScheduler {
    pub fn new(known: PieceSet, policy: RankingPolicy) -> Self {
        Self::with_strategy(known, policy, Cache)
    }
}

impl Cache {
    /// Pieces that more neighbors than this have are not worth caching.
    pub fn maximal_replication(swarm: &Swarm, cx: &Ctx) -> u32 {
        (swarm.neighbors.len() as f64 * cx.config.maximal_cache_replication_fraction) as u32
    }
}

impl Strategy for Cache {
    fn name(&self) -> &'static str {
        "Cache"
    }

    fn maintain_neighbors(&mut self, swarm: &mut Swarm, cx: &mut Ctx) {
        while swarm.neighbors.is_too_small(cx.config.neighbor_set_size) {
            if let Some(peer) = swarm.non_neighbors.extract_random(cx.rng()) {
                swarm.select_as_neighbor(cx, peer);
                continue;
            }
            let missing = swarm.missing.clone();
            if !swarm.neighbors.add_a_peer(cx, &missing) {
                break;
            }
        }
    }

    fn maintain_outstanding(&mut self, swarm: &mut Swarm, cx: &mut Ctx) {
        let pick = Pick {
            max_occurrences: Some(Self::maximal_replication(swarm, cx)),
            ..Pick::fresh(cx.config.ranker_maximum_choices)
        };
        for peer in swarm.peers_with_room(cx) {
            while swarm.has_room(cx, &peer) && swarm.request_piece(cx, peer, &pick) {}
        }
    }

    fn may_seed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        context::DownloadCmd,
        personality::TradingPersonality,
        scheduler::{
            testing::{ctx, id, set},
            Scheduler,
        },
    };

    use super::*;

    #[test]
    fn common_pieces_are_not_cached() {
        let mut cx = ctx(Config::default());
        let mut swarm = Swarm::new(PieceSet::new(2), RankingPolicy::TitForTat);
        for n in 1..=5 {
            swarm.select_as_neighbor(&mut cx, id(n));
        }
        // piece 0 is everywhere, piece 1 only on peer 1
        swarm
            .neighbors
            .update(&id(1), |p| p.set_known_pieces(set(2, &[0, 1])));
        for n in 2..=3 {
            swarm.neighbors.update(&id(n), |p| p.set_known_pieces(set(2, &[0])));
        }
        swarm.ranker.add_occurrences(&set(2, &[0, 1]));
        swarm.ranker.add_occurrences(&set(2, &[0]));
        swarm.ranker.add_occurrences(&set(2, &[0]));
        assert_eq!(Cache::maximal_replication(&swarm, &cx), 2);

        Cache.maintain_outstanding(&mut swarm, &mut cx);
        assert_eq!(
            cx.take_downloads(),
            vec![DownloadCmd::Start {
                peer: id(1),
                piece: 1
            }]
        );
        assert!(swarm.missing.get(0));
        // peer 1 is still sending, the others have nothing for us
        assert!(swarm.neighbors.get(&id(1), false).unwrap().we_are_interested());
        assert!(!swarm.neighbors.get(&id(2), false).unwrap().we_are_interested());
    }

    #[test]
    fn a_cache_never_seeds() {
        // with a single neighbor every piece would be too common otherwise
        let mut cx = ctx(Config {
            maximal_cache_replication_fraction: 1.0,
            ..Default::default()
        });
        let mut personality = TradingPersonality::default();
        let mut s = CacheScheduler::new(PieceSet::new(1), RankingPolicy::TitForTat);

        s.add_peer(&mut cx, id(1), true, &mut personality);
        s.set_peer_has_pieces(&mut cx, &id(1), set(1, &[0]), &mut personality);
        assert_eq!(
            cx.take_downloads(),
            vec![DownloadCmd::Start {
                peer: id(1),
                piece: 0
            }]
        );
        s.register_completed_piece(&mut cx, &id(1), 0);
        assert!(s.swarm().known.is_complete());
        assert!(!s.swarm().seeding);
        // the seeder stays around
        assert!(s.swarm().neighbors.contains(&id(1)));
        assert_eq!(s.name(), "Cache");
    }
}
