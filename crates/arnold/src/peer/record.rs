use std::{collections::VecDeque, time::Duration};

use hashbrown::HashSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    context::Ctx,
    counter::WindowCounter,
    credit::CreditValue,
    piece_set::PieceSet,
    utils::{format_duration, to_human_readable},
    wire::{Chunk, Message},
};

use super::{ChunkRequest, PeerId};

/// The state we keep about one remote peer.
///
/// Every flag setter that has to be announced to the peer pushes the
/// message into the outbox of the [`Ctx`], and only when the flag actually
/// changes.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Creation order, strictly increasing over the life of the engine.
    pub seq: u64,
    known: PieceSet,
    is_seeder: bool,
    sent_catalog: bool,
    deleted: bool,
    credit: CreditValue,
    /// Pieces we are downloading from this peer.
    requested: HashSet<usize>,
    /// Chunks this peer asked us for, oldest first.
    chunk_requests: VecDeque<ChunkRequest>,
    recv: WindowCounter,
    send: WindowCounter,
    // rates as seen by the last re-ranking, the comparators only look at
    // these so the ordering of a list stays consistent between updates.
    recv_rate: f64,
    send_rate: f64,
    received_pieces: u32,
    canceled_pieces: u32,
    peer_has_choked_us: bool,
    we_choked_peer: bool,
    peer_is_interested: bool,
    we_are_interested: bool,
    wants_to_talk: bool,
    fulfilled: u32,
    fulfillment: Duration,
}

impl PeerRecord {
    pub fn new(id: PeerId, piece_count: usize, window: Duration, seq: u64) -> Self {
        Self {
            id,
            seq,
            known: PieceSet::new(piece_count),
            is_seeder: false,
            sent_catalog: false,
            deleted: false,
            credit: CreditValue::UNKNOWN,
            requested: HashSet::new(),
            chunk_requests: VecDeque::new(),
            recv: WindowCounter::new(window),
            send: WindowCounter::new(window),
            recv_rate: 0.0,
            send_rate: 0.0,
            received_pieces: 0,
            canceled_pieces: 0,
            peer_has_choked_us: false,
            we_choked_peer: false,
            peer_is_interested: true,
            we_are_interested: true,
            wants_to_talk: true,
            fulfilled: 0,
            fulfillment: Duration::ZERO,
        }
    }

    /// Build a record with the sequence number and the transfer window
    /// taken from the context.
    pub fn create(cx: &mut Ctx, id: PeerId, piece_count: usize) -> Self {
        let seq = cx.next_seq();
        Self::new(id, piece_count, cx.config.transfer_window(), seq)
    }

    pub fn known_pieces(&self) -> &PieceSet {
        &self.known
    }

    pub fn set_known_pieces(&mut self, bits: PieceSet) {
        self.is_seeder = bits.is_complete();
        self.known = bits;
        trace!(
            "{}: is_seeder={} known pieces {}",
            self.id,
            self.is_seeder,
            self.known
        );
    }

    /// Returns `true` if the peer just became a seeder.
    pub fn register_has_piece(&mut self, piece: usize) -> bool {
        if self.is_seeder {
            return false;
        }
        self.known.set(piece);
        self.is_seeder = self.known.is_complete();
        trace!(
            "{}: is_seeder={} {} known pieces",
            self.id,
            self.is_seeder,
            self.known.cardinality()
        );
        self.is_seeder
    }

    pub fn register_received_chunk(&mut self, len: usize) {
        self.recv.record(len as u64);
    }

    /// Recompute the rate snapshots the rankers compare.
    pub fn refresh_rates(&mut self, now: Instant) {
        self.recv_rate = self.recv.rate_at(now);
        self.send_rate = self.send.rate_at(now);
    }

    pub fn receive_rate(&self) -> f64 {
        self.recv_rate
    }

    pub fn send_rate(&self) -> f64 {
        self.send_rate
    }

    pub fn register_piece_download(&mut self, piece: usize) {
        self.requested.insert(piece);
    }

    pub fn requested_pieces(&self) -> impl Iterator<Item = &usize> {
        self.requested.iter()
    }

    pub fn has_room_for_request(&self, cap: usize) -> bool {
        !self.deleted
            && !self.peer_has_choked_us
            && self.wants_to_talk
            && self.requested.len() < cap
    }

    pub fn register_completed_piece(&mut self, piece: usize) {
        self.received_pieces += 1;
        if !self.requested.remove(&piece) {
            warn!(
                "Piece {piece} was not a request to peer {} but it completed it anyway",
                self.id
            );
        }
    }

    pub fn register_canceled_piece(&mut self, piece: usize) {
        self.canceled_pieces += 1;
        if !self.requested.remove(&piece) {
            warn!(
                "Piece {piece} was not a request to peer {} but it was canceled anyway",
                self.id
            );
        }
    }

    pub fn add_chunk_request(&mut self, chunk: Chunk) {
        trace!("Registered request for {chunk} from {}", self.id);
        self.chunk_requests.push_back(ChunkRequest::new(chunk, self.id));
    }

    /// Dequeue the oldest chunk request and account for the bytes we are
    /// about to send.
    pub fn next_chunk_request(&mut self) -> Option<ChunkRequest> {
        if self.deleted {
            return None;
        }
        let r = self.chunk_requests.pop_front()?;
        self.send.record(r.chunk.len as u64);
        self.fulfilled += 1;
        self.fulfillment += r.requested_at.elapsed();
        Some(r)
    }

    /// Drop every queued request for `chunk`, returns how many were queued.
    pub fn remove_chunk_request(&mut self, chunk: &Chunk) -> usize {
        let before = self.chunk_requests.len();
        self.chunk_requests.retain(|r| r.chunk != *chunk);
        before - self.chunk_requests.len()
    }

    pub fn chunk_request_count(&self) -> usize {
        self.chunk_requests.len()
    }

    /// The pieces of this peer that are in `missing`.
    pub fn potential_pieces(&self, missing: &PieceSet) -> PieceSet {
        let mut res = self.known.clone();
        res.and(missing);
        res
    }

    pub fn has_some_of(&self, missing: &PieceSet) -> bool {
        if self.deleted || self.peer_has_choked_us {
            return false;
        }
        if self.is_seeder {
            return true;
        }
        self.known.intersects(missing)
    }

    pub fn is_seeder(&self) -> bool {
        self.is_seeder
    }

    pub fn received_pieces(&self) -> u32 {
        self.received_pieces
    }

    pub fn canceled_pieces(&self) -> u32 {
        self.canceled_pieces
    }

    pub fn set_peer_has_choked_us(&mut self, flag: bool) {
        trace!("peer_has_choked_us={flag} for {}", self.id);
        self.peer_has_choked_us = flag;
    }

    pub fn set_peer_is_interested(&mut self, flag: bool) {
        trace!("peer_is_interested={flag} for {}", self.id);
        self.peer_is_interested = self.wants_to_talk && flag;
    }

    pub fn set_we_choked_peer(&mut self, cx: &mut Ctx, reason: &str) {
        self.set_choke(cx, true, reason);
    }

    pub fn set_we_unchoked_peer(&mut self, cx: &mut Ctx, reason: &str) {
        self.set_choke(cx, false, reason);
    }

    fn set_choke(&mut self, cx: &mut Ctx, choked: bool, reason: &str) {
        if self.we_choked_peer == choked {
            return;
        }
        self.we_choked_peer = choked;
        debug!("we_choked_peer={choked} ({reason}) for {}", self.id);
        cx.bookkeeping(
            self.id,
            Message::Choke {
                choked,
                reason: reason.to_owned(),
            },
        );
    }

    pub fn set_we_are_interested(&mut self, cx: &mut Ctx, reason: &str) {
        self.set_interest(cx, true, reason);
    }

    pub fn set_we_are_uninterested(&mut self, cx: &mut Ctx, reason: &str) {
        self.set_interest(cx, false, reason);
    }

    fn set_interest(&mut self, cx: &mut Ctx, interested: bool, reason: &str) {
        if self.we_are_interested == interested {
            return;
        }
        self.we_are_interested = interested;
        debug!("we_are_interested={interested} ({reason}) for {}", self.id);
        cx.bookkeeping(self.id, Message::Interested(interested));
    }

    pub fn we_choked_peer(&self) -> bool {
        self.we_choked_peer
    }

    pub fn we_are_interested(&self) -> bool {
        self.we_are_interested
    }

    pub fn peer_has_choked_us(&self) -> bool {
        self.peer_has_choked_us
    }

    pub fn peer_is_interested(&self) -> bool {
        self.peer_is_interested
    }

    pub fn wants_to_talk(&self) -> bool {
        self.wants_to_talk
    }

    pub fn set_sent_catalog(&mut self) {
        self.sent_catalog = true;
    }

    pub fn sent_catalog(&self) -> bool {
        self.sent_catalog
    }

    pub fn needs_have(&self) -> bool {
        !self.deleted && self.wants_to_talk && self.sent_catalog
    }

    pub fn needs_shutdown(&self) -> bool {
        !self.deleted && self.wants_to_talk
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_wants_to_talk(&mut self, flag: bool) {
        self.wants_to_talk = flag;
        if !flag {
            self.chunk_requests.clear();
            self.sent_catalog = false;
            self.peer_is_interested = false;
        }
    }

    /// Soft delete: the record stays around for statistics but takes no
    /// part in scheduling anymore.
    pub fn set_deleted(&mut self) {
        self.deleted = true;
        self.is_seeder = false;
        self.peer_is_interested = false;
        self.wants_to_talk = false;
        self.requested.clear();
        self.chunk_requests.clear();
    }

    /// Merge a credit snapshot, returns `true` if it replaced ours.
    pub fn update_credit(&mut self, credit: CreditValue) -> bool {
        let merged = self.credit.merge(credit);
        let changed = merged != self.credit;
        self.credit = merged;
        changed
    }

    pub fn credit(&self) -> f64 {
        self.credit.value
    }

    pub fn credit_value(&self) -> CreditValue {
        self.credit
    }

    /// One line of the statistics table.
    pub fn statistics_line(&self) -> String {
        format!(
            "{:>9} {:>9} {:>9} {:>9} {}",
            self.received_pieces,
            self.canceled_pieces,
            to_human_readable(self.recv.total() as f64),
            to_human_readable(self.send.total() as f64),
            self.id
        )
    }

    pub fn state_line(&self) -> String {
        format!(
            "{:>9} {:>9} {:>9} {:>9} {:>9}/s {:>9}/s {}",
            self.received_pieces,
            self.canceled_pieces,
            to_human_readable(self.recv.total() as f64),
            to_human_readable(self.send.total() as f64),
            to_human_readable(self.recv_rate),
            to_human_readable(self.send_rate),
            self.id
        )
    }

    pub fn flags_line(&self) -> String {
        format!(
            "{} seeder={} choked_us={} we_choked={} interested={} \
             we_interested={} talks={} deleted={} credit={} {} known pieces",
            self.id,
            self.is_seeder,
            self.peer_has_choked_us,
            self.we_choked_peer,
            self.peer_is_interested,
            self.we_are_interested,
            self.wants_to_talk,
            self.deleted,
            self.credit,
            self.known.cardinality()
        )
    }

    pub fn fulfillment_line(&self) -> String {
        if self.fulfilled == 0 {
            return format!("{}: no samples", self.id);
        }
        format!(
            "{}: samples={} average={}",
            self.id,
            self.fulfilled,
            format_duration(self.fulfillment / self.fulfilled)
        )
    }
}
