//! Shared state handed to the schedulers and personalities on every call.
//!
//! Schedulers never talk to the transmitter or the engine directly: they push
//! messages into the outbox and piece downloads into the download queue, and
//! the engine drains both once the call returns.
use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};

use crate::{config::Config, peer::PeerId, wire::Message};

/// The three transmitter queues, served in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Request,
    Bookkeeping,
    Data,
}

/// A message waiting to be handed to the transmitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub priority: Priority,
    pub to: PeerId,
    pub msg: Message,
}

/// What a scheduler wants the engine to do with a piece download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadCmd {
    Start { peer: PeerId, piece: usize },
    Cancel { peer: PeerId, piece: usize },
}

#[derive(Debug)]
pub struct Ctx {
    pub config: Arc<Config>,
    pub local: PeerId,
    rng: StdRng,
    outbox: Vec<Outgoing>,
    downloads: Vec<DownloadCmd>,
    next_seq: u64,
}

impl Ctx {
    pub fn new(config: Arc<Config>, local: PeerId, seed: u64) -> Self {
        Self {
            config,
            local,
            rng: StdRng::seed_from_u64(seed),
            outbox: Vec::new(),
            downloads: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Sequence numbers of peer records, strictly increasing.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn bookkeeping(&mut self, to: PeerId, msg: Message) {
        self.push(Priority::Bookkeeping, to, msg);
    }

    pub fn request(&mut self, to: PeerId, msg: Message) {
        self.push(Priority::Request, to, msg);
    }

    pub fn data(&mut self, to: PeerId, msg: Message) {
        self.push(Priority::Data, to, msg);
    }

    fn push(&mut self, priority: Priority, to: PeerId, msg: Message) {
        self.outbox.push(Outgoing { priority, to, msg });
    }

    pub fn start_download(&mut self, peer: PeerId, piece: usize) {
        self.downloads.push(DownloadCmd::Start { peer, piece });
    }

    pub fn cancel_download(&mut self, peer: PeerId, piece: usize) {
        self.downloads.push(DownloadCmd::Cancel { peer, piece });
    }

    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_downloads(&mut self) -> Vec<DownloadCmd> {
        std::mem::take(&mut self.downloads)
    }

    /// Messages queued so far, without draining them.
    pub fn outbox(&self) -> &[Outgoing] {
        &self.outbox
    }

    pub fn downloads(&self) -> &[DownloadCmd] {
        &self.downloads
    }
}
