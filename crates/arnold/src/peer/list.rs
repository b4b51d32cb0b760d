use std::cmp::Ordering;

use hashbrown::HashMap;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{
    context::Ctx,
    credit::CreditValue,
    personality::Personality,
    piece_set::PieceSet,
    wire::{Chunk, Message},
};

use super::{ChunkRequest, PeerId, PeerRanker, PeerRecord};

/// The records of the peers a scheduler talks to, with two orderings over
/// them: the reward order decides who gets served and who we request from
/// first, the speed order drives the endgame.
///
/// The records live in a single map, the orderings are lists of ids. Every
/// mutation that can move a peer in either ordering goes through
/// [`PeerList::update`], which takes the peer out of both lists, applies
/// the change and puts it back with a binary search.
#[derive(Debug)]
pub struct PeerList {
    records: HashMap<PeerId, PeerRecord>,
    reward: Vec<PeerId>,
    speed: Vec<PeerId>,
    reward_ranker: PeerRanker,
    speed_ranker: PeerRanker,
    piece_count: usize,
    waiting_requests: usize,
    maximal_waiting_requests: usize,
}

fn compare(
    records: &HashMap<PeerId, PeerRecord>,
    ranker: PeerRanker,
    a: &PeerId,
    b: &PeerRecord,
) -> Ordering {
    match records.get(a) {
        Some(a) => ranker.compare(a, b),
        None => Ordering::Greater,
    }
}

fn insert_sorted(
    view: &mut Vec<PeerId>,
    records: &HashMap<PeerId, PeerRecord>,
    ranker: PeerRanker,
    id: PeerId,
) {
    let Some(rec) = records.get(&id) else {
        return;
    };
    let pos = view.partition_point(|x| compare(records, ranker, x, rec) != Ordering::Greater);
    view.insert(pos, id);
}

fn locate(
    view: &[PeerId],
    records: &HashMap<PeerId, PeerRecord>,
    ranker: PeerRanker,
    id: &PeerId,
) -> Option<usize> {
    if let Some(rec) = records.get(id) {
        let lo = view.partition_point(|x| compare(records, ranker, x, rec) == Ordering::Less);
        let found = view[lo..]
            .iter()
            .take_while(|x| compare(records, ranker, x, rec) == Ordering::Equal)
            .position(|x| x == id);
        if let Some(i) = found {
            return Some(lo + i);
        }
    }
    view.iter().position(|x| x == id)
}

impl PeerList {
    pub fn new(piece_count: usize, reward_ranker: PeerRanker, speed_ranker: PeerRanker) -> Self {
        Self {
            records: HashMap::new(),
            reward: Vec::new(),
            speed: Vec::new(),
            reward_ranker,
            speed_ranker,
            piece_count,
            waiting_requests: 0,
            maximal_waiting_requests: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.reward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reward.is_empty()
    }

    pub fn is_too_small(&self, minimal: usize) -> bool {
        self.len() < minimal
    }

    fn unlink(&mut self, id: &PeerId) {
        if let Some(ix) = locate(&self.reward, &self.records, self.reward_ranker, id) {
            self.reward.remove(ix);
        }
        if let Some(ix) = locate(&self.speed, &self.records, self.speed_ranker, id) {
            self.speed.remove(ix);
        }
    }

    fn link(&mut self, id: PeerId) {
        insert_sorted(&mut self.reward, &self.records, self.reward_ranker, id);
        insert_sorted(&mut self.speed, &self.records, self.speed_ranker, id);
    }

    /// Apply `f` to the record of `id` and restore both orderings.
    pub fn update<R>(&mut self, id: &PeerId, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        if !self.records.contains_key(id) {
            return None;
        }
        self.unlink(id);
        let rec = self.records.get_mut(id)?;
        let before = rec.chunk_request_count();
        let res = f(rec);
        rec.refresh_rates(Instant::now());
        // requests dropped by a flag change no longer count as waiting
        let dropped = before.saturating_sub(rec.chunk_request_count());
        self.waiting_requests = self.waiting_requests.saturating_sub(dropped);
        self.link(*id);
        Some(res)
    }

    /// Recompute every rate snapshot and re-sort both orderings.
    pub fn refresh_rankings(&mut self) {
        let now = Instant::now();
        for rec in self.records.values_mut() {
            rec.refresh_rates(now);
        }
        self.resort();
    }

    fn resort(&mut self) {
        let records = &self.records;
        let (reward, speed) = (self.reward_ranker, self.speed_ranker);
        self.reward.sort_by(|a, b| match (records.get(a), records.get(b)) {
            (Some(a), Some(b)) => reward.compare(a, b),
            _ => Ordering::Equal,
        });
        self.speed.sort_by(|a, b| match (records.get(a), records.get(b)) {
            (Some(a), Some(b)) => speed.compare(a, b),
            _ => Ordering::Equal,
        });
    }

    pub fn set_reward_ranker(&mut self, ranker: PeerRanker) {
        debug!("reward ranking is now {}", ranker.name());
        self.reward_ranker = ranker;
        self.resort();
    }

    pub fn reward_ranker(&self) -> PeerRanker {
        self.reward_ranker
    }

    /// Records in reward order, including soft-deleted ones.
    pub fn reward_ranked(&self) -> impl Iterator<Item = &PeerRecord> {
        self.reward.iter().filter_map(|id| self.records.get(id))
    }

    pub fn speed_ranked(&self) -> impl Iterator<Item = &PeerRecord> {
        self.speed.iter().filter_map(|id| self.records.get(id))
    }

    /// A snapshot of the reward order, for loops that mutate the list.
    pub fn reward_ids(&self) -> Vec<PeerId> {
        self.reward.clone()
    }

    pub fn speed_ids(&self) -> Vec<PeerId> {
        self.speed.clone()
    }

    pub fn add_peer(&mut self, cx: &mut Ctx, id: PeerId, we_are_seeding: bool) {
        let rec = PeerRecord::create(cx, id, self.piece_count);
        self.add_record(cx, rec, we_are_seeding);
    }

    pub fn add_record(&mut self, cx: &mut Ctx, mut rec: PeerRecord, we_are_seeding: bool) {
        trace!("Added peer {} to neighbor list", rec.id);
        if we_are_seeding {
            rec.set_we_are_uninterested(cx, "we are seeding");
        } else {
            rec.set_we_are_interested(cx, "new peer may have interesting pieces");
        }
        let id = rec.id;
        if self.records.contains_key(&id) {
            self.unlink(&id);
        }
        self.waiting_requests += rec.chunk_request_count();
        if let Some(old) = self.records.insert(id, rec) {
            self.waiting_requests = self
                .waiting_requests
                .saturating_sub(old.chunk_request_count());
        }
        self.link(id);
    }

    /// Take a record out of the list, leaving its flags as they are.
    pub fn extract(&mut self, id: &PeerId) -> Option<PeerRecord> {
        if !self.records.contains_key(id) {
            trace!("Cannot extract unknown peer {id}");
            return None;
        }
        self.unlink(id);
        let rec = self.records.remove(id)?;
        self.waiting_requests = self
            .waiting_requests
            .saturating_sub(rec.chunk_request_count());
        trace!("Extracted peer {id}");
        Some(rec)
    }

    /// Take a record out of the list and mark it deleted.
    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        let mut rec = self.extract(id)?;
        rec.set_deleted();
        trace!("Marked peer {id} as deleted");
        Some(rec)
    }

    /// Is `id` in the list and not deleted.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.get(id, false).is_some()
    }

    pub fn get(&self, id: &PeerId, include_deleted: bool) -> Option<&PeerRecord> {
        self.records
            .get(id)
            .filter(|p| include_deleted || !p.is_deleted())
    }

    pub fn disconnect(&self, cx: &mut Ctx, id: PeerId) {
        cx.bookkeeping(id, Message::CloseConnection);
    }

    /// Register the catalog of a peer, returns whether it is a seeder.
    pub fn set_bitset(
        &mut self,
        cx: &mut Ctx,
        id: &PeerId,
        bits: PieceSet,
        we_are_seeder: bool,
        personality: &mut dyn Personality,
    ) -> bool {
        if !self.records.contains_key(id) {
            warn!("Unknown peer {id} sent us its catalog");
            return false;
        }
        let has_pieces = !bits.none();
        self.update(id, |p| {
            p.set_known_pieces(bits);
            let is_seeder = p.is_seeder();
            if is_seeder {
                personality.peer_is_seeder(p.id);
                p.set_we_choked_peer(cx, "is seeder");
            }
            if !we_are_seeder && has_pieces {
                p.set_we_are_interested(cx, "learned about new pieces");
            }
            is_seeder
        })
        .unwrap_or(false)
    }

    /// Register a have of a peer, returns whether it just became a seeder.
    pub fn peer_has_piece(
        &mut self,
        cx: &mut Ctx,
        id: &PeerId,
        piece: usize,
        we_may_have_piece: bool,
        we_are_seeding: bool,
        personality: &mut dyn Personality,
    ) -> bool {
        if !self.contains(id) {
            if !self.records.contains_key(id) {
                warn!("Unknown peer {id} reported it has piece {piece}");
            }
            return false;
        }
        self.update(id, |p| {
            let now_seeder = p.register_has_piece(piece);
            if now_seeder {
                personality.peer_is_seeder(p.id);
                p.set_we_choked_peer(cx, "is seeder");
                if !we_are_seeding {
                    p.set_we_are_interested(cx, "is seeder");
                }
            } else if !we_may_have_piece && !p.we_choked_peer() {
                p.set_we_are_interested(cx, "peer has an interesting piece");
            }
            now_seeder
        })
        .unwrap_or(false)
    }

    pub fn register_piece_download(&mut self, id: &PeerId, piece: usize) {
        self.update(id, |p| p.register_piece_download(piece));
    }

    pub fn register_canceled(&mut self, id: &PeerId, piece: usize) {
        if self.update(id, |p| p.register_canceled_piece(piece)).is_none() {
            warn!("Unknown peer {id} canceled piece {piece}");
        }
    }

    /// Credit `id` with the piece and announce it to every peer that knows
    /// our catalog.
    pub fn register_completed(&mut self, cx: &mut Ctx, id: &PeerId, piece: usize) {
        self.update(id, |p| p.register_completed_piece(piece));
        for p in self.reward.iter().filter_map(|id| self.records.get(id)) {
            if p.needs_have() {
                cx.bookkeeping(p.id, Message::Have(piece));
            }
        }
    }

    pub fn update_credit(&mut self, id: &PeerId, credit: CreditValue) {
        if !self.contains(id) {
            return;
        }
        let changed = self
            .records
            .get(id)
            .map(|p| p.credit_value().merge(credit) != p.credit_value())
            .unwrap_or(false);
        if changed {
            self.update(id, |p| p.update_credit(credit));
        }
    }

    pub fn register_received_chunk(&mut self, id: &PeerId, len: usize) {
        if self.contains(id) {
            self.update(id, |p| p.register_received_chunk(len));
        }
    }

    /// Queue a chunk request, peers we never heard of are added on the fly.
    pub fn add_chunk_request(
        &mut self,
        cx: &mut Ctx,
        id: &PeerId,
        chunk: Chunk,
        we_are_seeding: bool,
    ) {
        match self.records.get_mut(id) {
            Some(p) if p.is_deleted() => {
                warn!("Ignored chunk request from deleted peer {id}; it requested {chunk}");
                return;
            }
            Some(p) => p.add_chunk_request(chunk),
            None => {
                self.add_peer(cx, *id, we_are_seeding);
                trace!("Peer {id} added to neighbor list because it sent a chunk request");
                if let Some(p) = self.records.get_mut(id) {
                    p.add_chunk_request(chunk);
                }
            }
        }
        self.waiting_requests += 1;
        self.maximal_waiting_requests = self.maximal_waiting_requests.max(self.waiting_requests);
    }

    pub fn remove_chunk_request(&mut self, id: &PeerId, chunk: &Chunk) {
        if let Some(p) = self.records.get_mut(id) {
            let removed = p.remove_chunk_request(chunk);
            self.waiting_requests = self.waiting_requests.saturating_sub(removed);
        }
    }

    /// The oldest request of the best ranked peer that has one.
    pub fn next_chunk_request(&mut self) -> Option<ChunkRequest> {
        for id in &self.reward {
            let Some(p) = self.records.get_mut(id) else {
                continue;
            };
            if let Some(r) = p.next_chunk_request() {
                trace!("Next granted chunk request is {} of {}", r.chunk, r.peer);
                self.waiting_requests = self.waiting_requests.saturating_sub(1);
                return Some(r);
            }
        }
        None
    }

    /// Dequeue the oldest request of one specific peer.
    pub fn next_chunk_request_of(&mut self, id: &PeerId) -> Option<ChunkRequest> {
        let r = self.records.get_mut(id)?.next_chunk_request()?;
        self.waiting_requests = self.waiting_requests.saturating_sub(1);
        Some(r)
    }

    pub fn has_incoming_chunk_requests(&self) -> bool {
        self.waiting_requests > 0
    }

    pub fn waiting_requests(&self) -> usize {
        self.waiting_requests
    }

    /// Returns `false` if the peer is unknown.
    pub fn set_peer_has_choked_us(&mut self, id: &PeerId, flag: bool) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.update(id, |p| p.set_peer_has_choked_us(flag)).is_some()
    }

    pub fn set_peer_is_interested(&mut self, id: &PeerId, flag: bool) {
        if self.contains(id) {
            self.update(id, |p| p.set_peer_is_interested(flag));
        }
    }

    pub fn set_wants_to_talk(&mut self, id: &PeerId, flag: bool) {
        if self.contains(id) {
            self.update(id, |p| p.set_wants_to_talk(flag));
        }
    }

    /// Start talking to one more peer that has something we miss, starting
    /// at a random place in the list so every peer gets a fair trial.
    pub fn add_a_peer(&mut self, cx: &mut Ctx, missing: &PieceSet) -> bool {
        let n = self.reward.len();
        if n == 0 {
            return false;
        }
        let start = cx.rng().gen_range(0..n);
        let found = (0..n)
            .map(|i| self.reward[(start + i) % n])
            .find(|id| {
                self.records.get(id).is_some_and(|p| {
                    !p.is_deleted() && !p.we_are_interested() && p.has_some_of(missing)
                })
            });
        let Some(id) = found else {
            return false;
        };
        self.update(&id, |p| {
            p.set_we_are_interested(cx, "we need more data sources");
            if p.is_seeder() {
                p.set_we_choked_peer(cx, "seeder doesn't need us");
            } else {
                p.set_we_unchoked_peer(cx, "tit-for-tat");
            }
        });
        true
    }

    pub fn stop_our_downloading(&mut self, cx: &mut Ctx) {
        for id in self.reward_ids() {
            if self.contains(&id) {
                self.update(&id, |p| p.set_we_are_uninterested(cx, "we are seeder"));
            }
        }
    }

    pub fn sent_catalog(&self, id: &PeerId) -> bool {
        match self.get(id, false) {
            Some(p) => p.sent_catalog(),
            None => {
                warn!("Asked whether we sent our catalog to unknown peer {id}");
                false
            }
        }
    }

    pub fn set_sent_catalog(&mut self, id: &PeerId) {
        match self.records.get_mut(id).filter(|p| !p.is_deleted()) {
            Some(p) => p.set_sent_catalog(),
            None => warn!("Sent catalog to unknown peer {id}"),
        }
    }

    /// Tell every peer that still talks to us that we are leaving.
    pub fn shutdown(&self, cx: &mut Ctx) {
        for p in self.reward_ranked() {
            if p.needs_shutdown() {
                cx.bookkeeping(p.id, Message::CloseConnection);
            }
        }
    }

    pub fn seeders(&self) -> Vec<PeerId> {
        self.reward_ranked()
            .filter(|p| p.is_seeder())
            .map(|p| p.id)
            .collect()
    }

    pub fn print_statistics(&self) {
        if self.is_empty() {
            info!("(no peers)");
            return;
        }
        info!("maximal waiting requests={}", self.maximal_waiting_requests);
        info!("rx pieces  cancel pc  rx bytes  tx bytes peer");
        for p in self.reward_ranked() {
            info!("{}", p.statistics_line());
        }
        info!(" Chunk request fulfillment:");
        for p in self.reward_ranked() {
            info!(" {}", p.fulfillment_line());
        }
    }

    pub fn dump_state(&self) {
        if self.is_empty() {
            info!("(no peers)");
            return;
        }
        info!(
            "waiting requests={} maximal waiting requests={}",
            self.waiting_requests, self.maximal_waiting_requests
        );
        info!("Peer state:");
        for p in self.reward_ranked().filter(|p| !p.is_deleted()) {
            info!("  {}", p.flags_line());
        }
        info!("rx pieces cl pieces  rx bytes  tx bytes      rate        rate peer");
        for p in self.reward_ranked() {
            info!("{}", p.state_line());
        }
        info!(" Outstanding piece requests:");
        for p in self.reward_ranked() {
            let mut pieces: Vec<_> = p.requested_pieces().copied().collect();
            if !pieces.is_empty() {
                pieces.sort_unstable();
                info!("  {}: requested pieces={pieces:?}", p.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{config::Config, personality::GreedyPersonality};

    use super::*;

    fn setup() -> (Ctx, PeerList) {
        let cx = Ctx::new(Arc::new(Config::default()), PeerId::from([0; 20]), 3);
        let list = PeerList::new(
            4,
            PeerRanker::SequenceNumber,
            PeerRanker::PotentialReceive,
        );
        (cx, list)
    }

    fn id(n: u8) -> PeerId {
        PeerId::from([n; 20])
    }

    #[test]
    fn orders_and_reorders() {
        let (mut cx, mut list) = setup();
        for n in 1..=3 {
            list.add_peer(&mut cx, id(n), false);
        }
        // newest first
        assert_eq!(list.reward_ids(), vec![id(3), id(2), id(1)]);
        assert_eq!(list.speed_ids().len(), 3);

        list.set_reward_ranker(PeerRanker::CreditForLeecher);
        list.update_credit(&id(1), CreditValue::new(100.0, 1));
        assert_eq!(list.reward_ids()[0], id(1));

        let p = list.remove(&id(1)).unwrap();
        assert!(p.is_deleted());
        assert!(!list.contains(&id(1)));
        assert_eq!(list.len(), 2);
        assert_eq!(list.speed_ids().len(), 2);
    }

    #[test]
    fn waiting_requests_follow_the_queues() {
        let (mut cx, mut list) = setup();
        let c = Chunk::new(0, 0, 16);

        // unknown peers are added by their first request
        list.add_chunk_request(&mut cx, &id(1), c, false);
        assert!(list.contains(&id(1)));
        list.add_chunk_request(&mut cx, &id(1), Chunk::new(0, 16, 16), false);
        assert_eq!(list.waiting_requests(), 2);

        assert_eq!(list.next_chunk_request().map(|r| r.chunk), Some(c));
        assert_eq!(list.waiting_requests(), 1);

        list.set_wants_to_talk(&id(1), false);
        assert!(!list.has_incoming_chunk_requests());
        assert!(list.next_chunk_request().is_none());
    }

    #[test]
    fn catalog_and_have() {
        let (mut cx, mut list) = setup();
        let mut personality = GreedyPersonality::default();
        list.add_peer(&mut cx, id(1), false);
        cx.take_outbox();

        let mut bits = PieceSet::new(4);
        bits.set(0);
        bits.set(1);
        bits.set(2);
        assert!(!list.set_bitset(&mut cx, &id(1), bits, false, &mut personality));
        assert!(list.peer_has_piece(&mut cx, &id(1), 3, false, false, &mut personality));
        assert_eq!(list.seeders(), vec![id(1)]);

        // exactly one choke for the new seeder
        let chokes = cx
            .take_outbox()
            .into_iter()
            .filter(|o| matches!(o.msg, Message::Choke { choked: true, .. }))
            .count();
        assert_eq!(chokes, 1);

        // unknown peers are ignored
        assert!(!list.peer_has_piece(&mut cx, &id(9), 0, false, false, &mut personality));
    }

    #[test]
    fn have_goes_to_peers_with_our_catalog() {
        let (mut cx, mut list) = setup();
        list.add_peer(&mut cx, id(1), false);
        list.add_peer(&mut cx, id(2), false);
        list.register_piece_download(&id(1), 2);
        list.set_sent_catalog(&id(2));
        cx.take_outbox();

        list.register_completed(&mut cx, &id(1), 2);
        let out = cx.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, id(2));
        assert_eq!(out[0].msg, Message::Have(2));
        assert_eq!(list.get(&id(1), false).unwrap().received_pieces(), 1);
    }

    #[test]
    fn add_a_peer_picks_an_uninterested_source() {
        let (mut cx, mut list) = setup();
        list.add_peer(&mut cx, id(1), true);
        let mut missing = PieceSet::new(4);
        missing.set(1);

        // knows nothing yet
        assert!(!list.add_a_peer(&mut cx, &missing));

        let mut bits = PieceSet::new(4);
        bits.set(1);
        list.update(&id(1), |p| p.set_known_pieces(bits));
        assert!(list.add_a_peer(&mut cx, &missing));
        assert!(list.get(&id(1), false).unwrap().we_are_interested());
        assert!(!list.add_a_peer(&mut cx, &missing));
    }
}
