//! Everything we know about remote peers.
//!
//! A [`PeerRecord`] holds the state of one peer, a [`PeerList`] owns the
//! records and keeps them ordered by the active [`PeerRanker`]s.
mod list;
mod ranking;
mod record;

pub use list::*;
pub use ranking::*;
pub use record::*;

use std::fmt::Display;

use rand::{seq::SliceRandom, Rng};
use speedy::{Readable, Writable};
use tokio::time::Instant;

use crate::wire::Chunk;

/// Opaque identity of a member of the pool.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Readable, Writable,
)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn gen<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut id = [0u8; 20];
        rng.fill(&mut id[..]);
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the first 4 bytes are plenty to tell peers apart in the logs
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let buff: [u8; 20] = value
            .try_into()
            .map_err(|_| "The PeerId must have exactly 20 bytes")?;
        Ok(PeerId(buff))
    }
}

/// A small unordered set of peers, used for the candidate pools of the
/// proxy schedulers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerSet(Vec<PeerId>);

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: PeerId) {
        if !self.contains(&peer) {
            self.0.push(peer);
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.0.contains(peer)
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        match self.0.iter().position(|p| p == peer) {
            Some(ix) => {
                self.0.swap_remove(ix);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Remove and return a uniformly chosen member.
    pub fn extract_random<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<PeerId> {
        let peer = *self.0.choose(rng)?;
        self.remove(&peer);
        Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.0.iter()
    }
}

/// A chunk that a remote peer asked us for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkRequest {
    pub chunk: Chunk,
    pub peer: PeerId,
    pub requested_at: Instant,
}

impl ChunkRequest {
    pub fn new(chunk: Chunk, peer: PeerId) -> Self {
        Self {
            chunk,
            peer,
            requested_at: Instant::now(),
        }
    }
}
