use tracing::{debug, info, warn};

use crate::{
    context::Ctx,
    credit::CreditValue,
    peer::{ChunkRequest, PeerId, PeerRecord},
    personality::Personality,
    piece_set::PieceSet,
    scheduler::Scheduler,
    wire::{Chunk, Message},
};

/// The scheduler of a node that relays for coordinators.
///
/// Coordinators we help live in their own inner scheduler, every other
/// peer in the outwards one. Events go to whichever of the two knows the
/// peer, the outwards scheduler when neither does. Accepting a request for
/// help moves the record from outwards to coordinators, a stop moves it
/// back.
#[derive(Debug)]
pub struct ProxyHelper {
    outwards: Box<dyn Scheduler>,
    coordinators: Box<dyn Scheduler>,
}

impl ProxyHelper {
    pub fn new(outwards: Box<dyn Scheduler>, coordinators: Box<dyn Scheduler>) -> Self {
        Self {
            outwards,
            coordinators,
        }
    }

    pub fn outwards(&self) -> &dyn Scheduler {
        self.outwards.as_ref()
    }

    pub fn coordinators(&self) -> &dyn Scheduler {
        self.coordinators.as_ref()
    }

    fn route(&mut self, peer: &PeerId) -> &mut dyn Scheduler {
        if self.coordinators.contains(peer) {
            self.coordinators.as_mut()
        } else {
            self.outwards.as_mut()
        }
    }
}

impl Scheduler for ProxyHelper {
    fn name(&self) -> String {
        "ProxyHelper".to_owned()
    }

    fn add_peer(
        &mut self,
        cx: &mut Ctx,
        peer: PeerId,
        _start_talking: bool,
        personality: &mut dyn Personality,
    ) {
        self.outwards.add_peer(cx, peer, false, personality);
    }

    fn add_record(&mut self, cx: &mut Ctx, rec: PeerRecord) {
        self.outwards.add_record(cx, rec);
    }

    fn remove_peer(&mut self, cx: &mut Ctx, peer: &PeerId) -> bool {
        self.route(peer).remove_peer(cx, peer)
    }

    fn extract_peer(&mut self, cx: &mut Ctx, peer: &PeerId) -> Option<PeerRecord> {
        match self.coordinators.extract_peer(cx, peer) {
            Some(rec) => Some(rec),
            None => self.outwards.extract_peer(cx, peer),
        }
    }

    fn register_peer_has_piece(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        piece: usize,
        personality: &mut dyn Personality,
    ) {
        self.route(peer)
            .register_peer_has_piece(cx, peer, piece, personality);
    }

    fn set_peer_has_pieces(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        bits: PieceSet,
        personality: &mut dyn Personality,
    ) {
        self.route(peer).set_peer_has_pieces(cx, peer, bits, personality);
    }

    fn request_pieces(&mut self, cx: &mut Ctx, set: &PieceSet) {
        self.outwards.request_pieces(cx, set);
    }

    fn register_received_chunk(&mut self, peer: &PeerId, len: usize) {
        self.route(peer).register_received_chunk(peer, len);
    }

    fn register_incorrect_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize) -> bool {
        if self.coordinators.contains(peer) {
            let banned = self.coordinators.register_incorrect_piece(cx, peer, piece);
            // we will not relay for a coordinator that feeds us garbage
            cx.bookkeeping(*peer, Message::ResignAsHelper);
            banned
        } else {
            self.outwards.register_incorrect_piece(cx, peer, piece)
        }
    }

    fn register_failed_piece_download(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        piece: usize,
    ) -> bool {
        self.route(peer).register_failed_piece_download(cx, peer, piece)
    }

    fn register_completed_piece(&mut self, cx: &mut Ctx, peer: &PeerId, piece: usize) {
        self.coordinators.register_completed_piece(cx, peer, piece);
        self.outwards.register_completed_piece(cx, peer, piece);
    }

    fn add_chunk_request(&mut self, cx: &mut Ctx, peer: &PeerId, chunk: Chunk) {
        self.route(peer).add_chunk_request(cx, peer, chunk);
    }

    fn remove_chunk_request(&mut self, peer: &PeerId, chunk: &Chunk) {
        self.route(peer).remove_chunk_request(peer, chunk);
    }

    /// Coordinators go first.
    fn next_chunk_request(&mut self) -> Option<ChunkRequest> {
        self.coordinators
            .next_chunk_request()
            .or_else(|| self.outwards.next_chunk_request())
    }

    fn has_incoming_chunk_requests(&self) -> bool {
        self.coordinators.has_incoming_chunk_requests()
            || self.outwards.has_incoming_chunk_requests()
    }

    fn set_peer_has_choked_us(&mut self, cx: &mut Ctx, peer: &PeerId, flag: bool) {
        self.route(peer).set_peer_has_choked_us(cx, peer, flag);
    }

    fn set_peer_is_interested(&mut self, cx: &mut Ctx, peer: &PeerId, flag: bool) {
        self.route(peer).set_peer_is_interested(cx, peer, flag);
    }

    fn generate_more_transmission(&mut self, cx: &mut Ctx) -> bool {
        self.coordinators.generate_more_transmission(cx)
            || self.outwards.generate_more_transmission(cx)
    }

    fn peer_joined_as_helper(
        &mut self,
        _cx: &mut Ctx,
        peer: &PeerId,
        _personality: &mut dyn Personality,
    ) {
        warn!("ProxyHelper: peer {peer} sent us a join message");
    }

    fn peer_resigned_as_helper(&mut self, _cx: &mut Ctx, peer: &PeerId) -> bool {
        warn!("ProxyHelper: peer {peer} sent us a resignation message");
        false
    }

    fn source_peer_count(&self) -> usize {
        self.coordinators.source_peer_count() + self.outwards.source_peer_count()
    }

    fn ask_for_help(
        &mut self,
        cx: &mut Ctx,
        peer: &PeerId,
        personality: &mut dyn Personality,
    ) -> bool {
        match self.outwards.extract_peer(cx, peer) {
            Some(rec) => {
                info!("active peer {peer} asked for help, accepted");
                self.coordinators.add_record(cx, rec);
            }
            None => {
                info!("inactive peer {peer} asked for help, accepted");
                self.outwards.remove_peer(cx, peer);
                self.coordinators.add_peer(cx, *peer, true, personality);
            }
        }
        cx.bookkeeping(*peer, Message::JoinHelpers);
        true
    }

    fn handle_stopped_helping(&mut self, cx: &mut Ctx, peer: &PeerId) {
        match self.coordinators.extract_peer(cx, peer) {
            Some(rec) => {
                debug!("peer {peer} asked us to stop helping");
                self.outwards.add_record(cx, rec);
            }
            None => debug!("unknown peer {peer} asked us to stop helping"),
        }
    }

    fn handle_closed_connection(&mut self, peer: &PeerId) {
        self.coordinators.handle_closed_connection(peer);
        self.outwards.handle_closed_connection(peer);
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.outwards.contains(peer) || self.coordinators.contains(peer)
    }

    fn update_credit(&mut self, peer: &PeerId, credit: CreditValue) {
        self.route(peer).update_credit(peer, credit);
    }

    fn shutdown(&mut self, cx: &mut Ctx) {
        self.coordinators.shutdown(cx);
        self.outwards.shutdown(cx);
    }

    fn dump_state(&self) {
        info!("------ Proxy helper: coordinators ------");
        self.coordinators.dump_state();
        info!("------ Proxy helper: outwards ------");
        self.outwards.dump_state();
    }

    fn print_statistics(&self) {
        info!("------ Proxy helper: coordinators ------");
        self.coordinators.print_statistics();
        info!("------ Proxy helper: outwards ------");
        self.outwards.print_statistics();
    }
}
