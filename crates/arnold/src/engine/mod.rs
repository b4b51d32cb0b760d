//! The engine owns all the scheduling state of a node and is the only one
//! that mutates it.
//!
//! It is an actor: messages of other peers and membership changes come in
//! through its two inboxes, everything it decides to send goes out through
//! the [`Transmitter`]. Each round it handles what came in, keeps the chunk
//! requests of its downloads topped up and keeps the transmitter busy, and
//! it only sleeps when a whole round made no progress.
mod assembly;
mod builder;

pub use assembly::*;
pub use builder::*;

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::{
    select,
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    context::{DownloadCmd, Ctx},
    credit::{Credit, CreditValue},
    error::Error,
    peer::PeerId,
    personality::Personality,
    scheduler::Scheduler,
    store::Store,
    transmitter::{Transmitter, TransmitterHandle, TransmitterReport},
    transport::Transport,
    utils::{format_duration, to_human_readable},
    watchdog::{Heartbeat, Watchdog},
    wire::{Chunk, Message, MessageId},
};

/// A message of another peer, as handed over by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: PeerId,
    pub msg: Message,
    /// Bytes on the wire.
    pub len: usize,
    pub at: Instant,
}

/// Membership changes and orders for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMsg {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    PoolTerminated,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Stopping,
    Stopped,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        }
    }
}

/// Messages per type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageCounts(HashMap<MessageId, u64>);

impl MessageCounts {
    pub fn count(&mut self, id: MessageId) {
        *self.0.entry(id).or_default() += 1;
    }

    pub fn get(&self, id: MessageId) -> u64 {
        self.0.get(&id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl From<HashMap<MessageId, u64>> for MessageCounts {
    fn from(value: HashMap<MessageId, u64>) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in MessageId::ALL {
            let n = self.get(id);
            if n == 0 {
                continue;
            }
            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(f, "{}={n}", id.name())?;
        }
        Ok(())
    }
}

/// What an engine did, returned when it stops.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub peer: PeerId,
    pub scheduler: String,
    pub personality: String,
    pub pieces: usize,
    pub piece_count: usize,
    pub credit: CreditValue,
    pub received: MessageCounts,
    pub received_bytes: u64,
    pub transmitter: TransmitterReport,
    pub elapsed: Duration,
    pub download_time: Option<Duration>,
    pub watchdog_misses: u64,
}

impl EngineReport {
    pub fn is_complete(&self) -> bool {
        self.pieces == self.piece_count
    }
}

impl fmt::Display for EngineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({} scheduler, {} personality): {}/{} pieces in {}",
            self.peer,
            self.scheduler,
            self.personality,
            self.pieces,
            self.piece_count,
            format_duration(self.elapsed)
        )?;
        if let Some(t) = self.download_time {
            writeln!(f, "  download time {}", format_duration(t))?;
        }
        writeln!(
            f,
            "  received {} messages ({}): {}",
            self.received.total(),
            to_human_readable(self.received_bytes as f64),
            self.received
        )?;
        writeln!(f, "  {}", self.transmitter)?;
        write!(f, "  credit {}", self.credit)
    }
}

pub struct Engine {
    cx: Ctx,
    scheduler: Box<dyn Scheduler>,
    personality: Box<dyn Personality>,
    store: Box<dyn Store>,
    transport: Arc<dyn Transport>,
    assembly: Assembly,
    credit: Credit,
    messages: mpsc::Receiver<Delivery>,
    control: mpsc::UnboundedReceiver<EngineMsg>,
    control_tx: mpsc::UnboundedSender<EngineMsg>,
    /// Woken by the transmitter when the data queue shrinks.
    wake: Arc<Notify>,
    transmitter: TransmitterHandle,
    pending_transmitter: Option<Transmitter>,
    received: MessageCounts,
    received_bytes: u64,
    phase: Phase,
    rounds: u64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("local", &self.cx.local)
            .field("scheduler", &self.scheduler.name())
            .field("phase", &self.phase)
            .finish()
    }
}

impl Engine {
    pub fn local(&self) -> PeerId {
        self.cx.local
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Lets the owner stop the engine with [`EngineMsg::Quit`].
    pub fn handle(&self) -> mpsc::UnboundedSender<EngineMsg> {
        self.control_tx.clone()
    }

    pub async fn run(self) -> Result<EngineReport, Error> {
        let span = info_span!("engine", peer = %self.cx.local);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<EngineReport, Error> {
        let started = Instant::now();
        let transmitter = self
            .pending_transmitter
            .take()
            .ok_or(Error::EngineStopped)?;
        let transmitter = tokio::spawn(
            transmitter
                .run()
                .instrument(info_span!("transmitter", peer = %self.cx.local)),
        );
        let (watchdog, watchdog_task) = Watchdog::spawn(self.cx.config.watchdog_interval());

        info!(
            "started with {} scheduler and {} personality, {}/{} pieces",
            self.scheduler.name(),
            self.personality.name(),
            self.store.known_pieces().cardinality(),
            self.store.piece_count()
        );
        if self.store.is_complete() {
            self.personality.this_peer_is_seeder();
        }

        while self.phase == Phase::Running {
            self.rounds += 1;
            watchdog.reset(self.heartbeat());
            while self.phase == Phase::Running && self.step()? {
                // let the transmitter run on a single threaded runtime
                tokio::task::yield_now().await;
            }
            if self.phase != Phase::Running {
                break;
            }
            self.wait().await;
        }

        let transmitter = self.stop(transmitter).await?;
        drop(watchdog);
        let watchdog_misses = watchdog_task.await?;
        self.print_statistics();

        Ok(EngineReport {
            peer: self.cx.local,
            scheduler: self.scheduler.name(),
            personality: self.personality.name(),
            pieces: self.store.known_pieces().cardinality(),
            piece_count: self.store.piece_count(),
            credit: self.credit.value(),
            received: self.received,
            received_bytes: self.received_bytes,
            transmitter,
            elapsed: started.elapsed(),
            download_time: self.personality.download_time(),
            watchdog_misses,
        })
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            phase: self.phase.name(),
            rounds: self.rounds,
            received_messages: self.received.total(),
            pending_data: self.transmitter.data_pending(),
            downloads: self.assembly.len(),
        }
    }

    /// One pass over everything that may need doing. Returns `true` if
    /// anything happened.
    fn step(&mut self) -> Result<bool, Error> {
        let mut progress = self.handle_messages();
        progress |= self.handle_control();
        progress |= self.maintain_requests();
        progress |= self.keep_send_queue_filled();
        self.flush()?;
        if self.phase == Phase::Running && self.personality.should_stop() {
            info!("{} personality wants to stop", self.personality.name());
            self.phase = Phase::Stopping;
        }
        Ok(progress)
    }

    async fn wait(&mut self) {
        let max_sleep = self.cx.config.engine_sleep();
        select! {
            Some(d) = self.messages.recv() => self.handle_delivery(d),
            Some(msg) = self.control.recv() => self.handle_control_msg(msg),
            _ = self.wake.notified() => {},
            _ = sleep(max_sleep) => {
                if self.scheduler.source_peer_count() > 0 && !self.store.is_complete() {
                    debug!("nothing happened for {}", format_duration(max_sleep));
                    self.dump_state();
                }
            }
        }
    }

    /// Apply the download commands of the last scheduler calls and hand
    /// their messages to the transmitter.
    fn flush(&mut self) -> Result<(), Error> {
        for cmd in self.cx.take_downloads() {
            match cmd {
                DownloadCmd::Start { peer, piece } => {
                    let size = self.store.piece_size(piece);
                    self.assembly.start(peer, piece, size);
                }
                DownloadCmd::Cancel { peer, piece } => {
                    for chunk in self.assembly.cancel(&peer, piece) {
                        self.cx.bookkeeping(peer, Message::Cancel(chunk));
                    }
                }
            }
        }
        for out in self.cx.take_outbox() {
            self.transmitter.send(out)?;
        }
        Ok(())
    }

    fn handle_messages(&mut self) -> bool {
        let mut progress = false;
        // leave room for the rest of the round
        for _ in 0..self.cx.config.received_queue_capacity.max(1) {
            let Ok(d) = self.messages.try_recv() else {
                break;
            };
            self.handle_delivery(d);
            progress = true;
        }
        progress
    }

    fn handle_control(&mut self) -> bool {
        let mut progress = false;
        while let Ok(msg) = self.control.try_recv() {
            self.handle_control_msg(msg);
            progress = true;
        }
        progress
    }

    fn handle_control_msg(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::PeerJoined(peer) if peer == self.cx.local => {}
            EngineMsg::PeerJoined(peer) => {
                debug!("peer {peer} joined");
                self.scheduler
                    .add_peer(&mut self.cx, peer, false, self.personality.as_mut());
            }
            EngineMsg::PeerLeft(peer) if peer == self.cx.local => {
                info!("we left the pool");
                self.phase = Phase::Stopping;
            }
            EngineMsg::PeerLeft(peer) => self.peer_left(peer),
            EngineMsg::PoolTerminated => {
                info!("the pool was terminated");
                self.phase = Phase::Stopping;
            }
            EngineMsg::Quit => {
                info!("asked to quit");
                self.phase = Phase::Stopping;
            }
        }
    }

    fn peer_left(&mut self, peer: PeerId) {
        debug!("peer {peer} left");
        for piece in self.assembly.remove_peer(&peer) {
            self.scheduler
                .register_failed_piece_download(&mut self.cx, &peer, piece);
        }
        self.scheduler.remove_peer(&mut self.cx, &peer);
        self.personality.remove_peer(peer);
    }

    fn handle_delivery(&mut self, d: Delivery) {
        self.received.count(d.msg.id());
        self.received_bytes += d.len as u64;
        let from = d.from;
        trace!("received {} from {from}", d.msg.id().name());

        let cx = &mut self.cx;
        let personality = self.personality.as_mut();
        match d.msg {
            Message::Request { chunk, credit } => {
                self.scheduler.add_chunk_request(cx, &from, chunk);
                self.scheduler.update_credit(&from, credit);
            }
            Message::Piece {
                chunk,
                data,
                credit,
            } => self.handle_piece(from, chunk, data, credit),
            Message::RequestPieces(set) => self.scheduler.request_pieces(cx, &set),
            Message::Choke { choked, reason } => {
                trace!("{from} choked={choked} because {reason}");
                self.scheduler.set_peer_has_choked_us(cx, &from, choked);
            }
            Message::Interested(flag) => {
                self.scheduler.set_peer_is_interested(cx, &from, flag);
            }
            Message::Catalog(set) => {
                self.scheduler
                    .set_peer_has_pieces(cx, &from, set, personality);
            }
            Message::Cancel(chunk) => self.scheduler.remove_chunk_request(&from, &chunk),
            Message::Have(piece) => {
                self.scheduler
                    .register_peer_has_piece(cx, &from, piece, personality);
            }
            Message::AskForHelp => {
                if self.scheduler.ask_for_help(cx, &from, personality) {
                    personality.new_helped_peer(from);
                }
            }
            Message::StopHelping => {
                self.scheduler.handle_stopped_helping(cx, &from);
                if !personality.remove_helped_peer(from) {
                    warn!("{from} stopped a help we never gave");
                }
            }
            Message::JoinHelpers => {
                self.scheduler.peer_joined_as_helper(cx, &from, personality);
            }
            Message::ResignAsHelper => {
                self.scheduler.peer_resigned_as_helper(cx, &from);
            }
            Message::CloseConnection => self.scheduler.handle_closed_connection(&from),
        }
    }

    fn handle_piece(&mut self, from: PeerId, chunk: Chunk, data: Bytes, credit: CreditValue) {
        if self.store.is_valid_piece(chunk.piece) {
            trace!("ignored {chunk} from {from}, we have the piece");
            return;
        }
        self.scheduler.update_credit(&from, credit);
        self.scheduler.register_received_chunk(&from, data.len());
        match self.assembly.add_chunk(&from, chunk, &data) {
            Ok(Some(piece)) => self.store_piece(from, chunk.piece, piece),
            Ok(None) => {}
            // a cancel crossed the data on the wire
            Err(e @ Error::StaleChunk(..)) => debug!("{e}"),
            Err(e) => warn!("{e}"),
        }
    }

    fn store_piece(&mut self, from: PeerId, piece: usize, data: Bytes) {
        let len = data.len();
        match self.store.store_piece(piece, data) {
            Ok(true) => {
                debug!("completed piece {piece} from {from}");
                self.credit.add(-(len as f64), "received piece");
                self.scheduler
                    .register_completed_piece(&mut self.cx, &from, piece);
                self.personality.added_piece(piece);
                if self.store.is_complete() {
                    info!("we have all {} pieces", self.store.piece_count());
                    self.personality.this_peer_is_seeder();
                }
            }
            Ok(false) => {
                warn!("piece {piece} from {from} failed verification");
                self.scheduler
                    .register_incorrect_piece(&mut self.cx, &from, piece);
            }
            Err(e) => {
                warn!("could not store piece {piece} from {from}: {e}");
                self.scheduler
                    .register_incorrect_piece(&mut self.cx, &from, piece);
            }
        }
    }

    /// Keep every download at its number of chunk requests in flight.
    fn maintain_requests(&mut self) -> bool {
        let cap = self.cx.config.chunk_requests_per_peer;
        let requests = self.assembly.next_requests(cap);
        for (peer, chunk) in &requests {
            let credit = self.credit.value();
            self.cx.request(
                *peer,
                Message::Request {
                    chunk: *chunk,
                    credit,
                },
            );
        }
        !requests.is_empty()
    }

    /// Serve a chunk request if the transmitter can take more data, or ask
    /// the scheduler for someone to talk to.
    fn keep_send_queue_filled(&mut self) -> bool {
        if !self.transmitter.needs_data() {
            return false;
        }
        let Some(r) = self.scheduler.next_chunk_request() else {
            return self.scheduler.generate_more_transmission(&mut self.cx);
        };
        match self.store.read_chunk(&r.chunk) {
            Ok(data) => {
                self.credit.add(data.len() as f64, "sent chunk");
                let credit = self.credit.value();
                self.cx.data(
                    r.peer,
                    Message::Piece {
                        chunk: r.chunk,
                        data,
                        credit,
                    },
                );
            }
            Err(e) => warn!("cannot serve {} to {}: {e}", r.chunk, r.peer),
        }
        true
    }

    /// Say goodbye, let the transmitter drain and close the store and the
    /// transport.
    async fn stop(
        &mut self,
        transmitter: JoinHandle<TransmitterReport>,
    ) -> Result<TransmitterReport, Error> {
        self.phase = Phase::Stopping;
        info!("stopping");
        self.scheduler.shutdown(&mut self.cx);
        self.flush()?;
        self.transmitter.quit()?;

        let report = match timeout(self.cx.config.transmitter_shutdown_timeout(), transmitter).await
        {
            Ok(report) => report?,
            Err(_) => {
                warn!("{}", Error::TransmitterTimeout);
                TransmitterReport::default()
            }
        };
        self.store.close()?;
        self.transport.close().await;
        self.phase = Phase::Stopped;
        Ok(report)
    }

    pub fn dump_state(&self) {
        info!(
            "engine: phase={} rounds={} credit={} pending data={}",
            self.phase.name(),
            self.rounds,
            self.credit.value(),
            self.transmitter.data_pending()
        );
        for p in self.assembly.iter() {
            info!("downloading {p}");
        }
        self.scheduler.dump_state();
        self.personality.dump_state();
    }

    fn print_statistics(&self) {
        info!(
            "received {} messages: {}",
            self.received.total(),
            self.received
        );
        info!(
            "owned {}/{} pieces, credit {}",
            self.store.known_pieces().cardinality(),
            self.store.piece_count(),
            self.credit.value()
        );
        self.scheduler.print_statistics();
        self.personality.print_statistics();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_print_in_wire_order() {
        let mut counts = MessageCounts::default();
        counts.count(MessageId::Piece);
        counts.count(MessageId::Have);
        counts.count(MessageId::Piece);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.get(MessageId::Piece), 2);
        assert_eq!(counts.get(MessageId::Catalog), 0);
        assert_eq!(counts.to_string(), "have=1 piece=2");
    }
}
