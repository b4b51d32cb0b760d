//! Behavior models: they only decide when the local node stops taking part.
use std::{fmt::Debug, time::Duration};

use clap::ValueEnum;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{peer::PeerId, utils::format_duration};

pub trait Personality: Debug + Send {
    fn name(&self) -> String;
    fn new_peer(&mut self, peer: PeerId);
    fn remove_peer(&mut self, peer: PeerId);
    fn peer_is_seeder(&mut self, peer: PeerId);
    fn this_peer_is_seeder(&mut self);
    fn should_stop(&mut self) -> bool;
    fn added_piece(&mut self, piece: usize);
    /// A coordinator asked us to help it.
    fn new_helped_peer(&mut self, _peer: PeerId) {}
    /// Returns `false` if we were not helping `peer`.
    fn remove_helped_peer(&mut self, _peer: PeerId) -> bool {
        true
    }
    /// Time from the first peer until we owned everything.
    fn download_time(&self) -> Option<Duration>;
    fn dump_state(&self);
    fn print_statistics(&self);
}

/// Which personality an engine starts with.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum PersonalityKind {
    /// Leave as soon as we have the whole file.
    #[default]
    Greedy,
    /// Stay until no peer needs us anymore.
    Altruistic,
    /// Like altruistic, but give up after seeding for a fraction of the
    /// download time.
    Impatient,
    /// Greedy until the first peer shows up, altruistic otherwise.
    BigSwarm,
    /// For caches: stay while peers need what we have.
    Trading,
    /// For helpers: stay while a coordinator needs us.
    ProxyHelper,
}

impl PersonalityKind {
    pub fn build(&self, seeding_fraction: f64) -> Box<dyn Personality> {
        match self {
            PersonalityKind::Greedy => Box::<GreedyPersonality>::default(),
            PersonalityKind::Altruistic => Box::<AltruisticPersonality>::default(),
            PersonalityKind::Impatient => {
                Box::new(ImpatientPersonality::new(seeding_fraction))
            }
            PersonalityKind::BigSwarm => Box::<BigSwarmPersonality>::default(),
            PersonalityKind::Trading => Box::<TradingPersonality>::default(),
            PersonalityKind::ProxyHelper => Box::<ProxyHelperPersonality>::default(),
        }
    }
}

/// The moments every personality reports on.
#[derive(Debug, Clone, Copy, Default)]
struct Timeline {
    start: Option<Instant>,
    first_piece: Option<Instant>,
    became_seeder: Option<Instant>,
}

impl Timeline {
    fn start(&mut self) {
        self.start.get_or_insert_with(Instant::now);
    }

    fn piece(&mut self) {
        self.first_piece.get_or_insert_with(Instant::now);
    }

    /// Returns `true` the first time only.
    fn seeder(&mut self) -> bool {
        if self.became_seeder.is_some() {
            return false;
        }
        self.became_seeder = Some(Instant::now());
        if let (Some(start), Some(seeder)) = (self.start, self.became_seeder) {
            let first = self
                .first_piece
                .map(|t| format_duration(t.saturating_duration_since(start)))
                .unwrap_or_else(|| "-".to_owned());
            info!(
                "Downloaded file in {}; first piece after {first}",
                format_duration(seeder - start)
            );
        }
        true
    }

    fn download_time(&self) -> Option<Duration> {
        Some(self.became_seeder?.saturating_duration_since(self.start?))
    }

    fn report(&self, name: &str) {
        let Some(start) = self.start else {
            info!("{name} personality: never became active");
            return;
        };
        if let Some(first) = self.first_piece {
            info!(
                "Saw first piece after {}",
                format_duration(first.saturating_duration_since(start))
            );
        }
        match self.became_seeder {
            Some(seeder) => info!(
                "{name} personality: service time {} of which seeding time {}",
                format_duration(start.elapsed()),
                format_duration(seeder.elapsed())
            ),
            None => info!(
                "{name} personality: service time {} with no seeding time",
                format_duration(start.elapsed())
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct GreedyPersonality {
    timeline: Timeline,
    should_stop: bool,
}

impl Personality for GreedyPersonality {
    fn name(&self) -> String {
        "Greedy".to_owned()
    }

    fn new_peer(&mut self, _peer: PeerId) {
        self.timeline.start();
    }

    fn remove_peer(&mut self, _peer: PeerId) {}

    fn peer_is_seeder(&mut self, _peer: PeerId) {}

    fn this_peer_is_seeder(&mut self) {
        self.timeline.seeder();
        self.should_stop = true;
    }

    fn should_stop(&mut self) -> bool {
        self.should_stop
    }

    fn added_piece(&mut self, _piece: usize) {
        self.timeline.piece();
    }

    fn download_time(&self) -> Option<Duration> {
        self.timeline.download_time()
    }

    fn dump_state(&self) {
        info!("GreedyPersonality: should_stop={}", self.should_stop);
    }

    fn print_statistics(&self) {
        self.timeline.report("Greedy");
    }
}

/// Peers that still miss pieces, shared by the personalities that stay
/// around for others.
#[derive(Debug, Default)]
struct Needy {
    peers: HashSet<PeerId>,
    saw_clients: bool,
}

impl Needy {
    fn add(&mut self, peer: PeerId) {
        self.peers.insert(peer);
        self.saw_clients = true;
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    fn done(&self) -> bool {
        self.saw_clients && self.peers.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct AltruisticPersonality {
    timeline: Timeline,
    needy: Needy,
    have_my_stuff: bool,
}

impl Personality for AltruisticPersonality {
    fn name(&self) -> String {
        "Altruistic".to_owned()
    }

    fn new_peer(&mut self, peer: PeerId) {
        if !self.needy.saw_clients && !self.have_my_stuff {
            self.timeline.start();
        }
        self.needy.add(peer);
        debug!("AltruisticPersonality: added peer {peer} to needy peers");
    }

    fn remove_peer(&mut self, peer: PeerId) {
        self.needy.remove(&peer);
        debug!(
            "AltruisticPersonality: peer {peer} disappeared, {} needy peers left",
            self.needy.peers.len()
        );
    }

    fn peer_is_seeder(&mut self, peer: PeerId) {
        self.needy.remove(&peer);
        debug!(
            "AltruisticPersonality: peer {peer} is a seeder, {} needy peers left",
            self.needy.peers.len()
        );
    }

    fn this_peer_is_seeder(&mut self) {
        self.have_my_stuff = true;
        self.timeline.seeder();
    }

    fn should_stop(&mut self) -> bool {
        self.have_my_stuff && self.needy.done()
    }

    fn added_piece(&mut self, _piece: usize) {
        self.timeline.piece();
    }

    fn download_time(&self) -> Option<Duration> {
        self.timeline.download_time()
    }

    fn dump_state(&self) {
        info!(
            "AltruisticPersonality: saw_clients={} have_my_stuff={} needy={:?}",
            self.needy.saw_clients, self.have_my_stuff, self.needy.peers
        );
    }

    fn print_statistics(&self) {
        self.timeline.report("Altruistic");
    }
}

#[derive(Debug)]
pub struct ImpatientPersonality {
    timeline: Timeline,
    needy: Needy,
    have_my_stuff: bool,
    /// How long to seed, as a fraction of the download time.
    linger_fraction: f64,
    deadline: Option<Instant>,
}

impl ImpatientPersonality {
    pub fn new(linger_fraction: f64) -> Self {
        Self {
            timeline: Timeline::default(),
            needy: Needy::default(),
            have_my_stuff: false,
            linger_fraction,
            deadline: None,
        }
    }
}

impl Personality for ImpatientPersonality {
    fn name(&self) -> String {
        "Impatient".to_owned()
    }

    fn new_peer(&mut self, peer: PeerId) {
        if !self.needy.saw_clients && !self.have_my_stuff {
            self.timeline.start();
        }
        self.needy.add(peer);
    }

    fn remove_peer(&mut self, peer: PeerId) {
        self.needy.remove(&peer);
    }

    fn peer_is_seeder(&mut self, peer: PeerId) {
        self.needy.remove(&peer);
    }

    fn this_peer_is_seeder(&mut self) {
        self.have_my_stuff = true;
        if self.timeline.seeder() {
            if let Some(download) = self.timeline.download_time() {
                self.deadline = Some(
                    Instant::now() + download.mul_f64(self.linger_fraction.max(0.0)),
                );
            }
        }
    }

    fn should_stop(&mut self) -> bool {
        let passed_deadline = self.deadline.is_some_and(|d| d < Instant::now());
        self.have_my_stuff && (self.needy.done() || passed_deadline)
    }

    fn added_piece(&mut self, _piece: usize) {
        self.timeline.piece();
    }

    fn download_time(&self) -> Option<Duration> {
        self.timeline.download_time()
    }

    fn dump_state(&self) {
        let stop = match (self.deadline, self.timeline.start) {
            (Some(d), Some(s)) => format_duration(d.saturating_duration_since(s)),
            _ => "(unknown)".to_owned(),
        };
        info!(
            "ImpatientPersonality: saw_clients={} have_my_stuff={} needy={:?} stop_moment={stop}",
            self.needy.saw_clients, self.have_my_stuff, self.needy.peers
        );
    }

    fn print_statistics(&self) {
        self.timeline.report("Impatient");
    }
}

/// Picks its real personality at the first event: greedy if a peer or a
/// piece comes first, altruistic if we turn out to be a seeder already.
#[derive(Debug, Default)]
pub struct BigSwarmPersonality {
    inner: Option<Box<dyn Personality>>,
}

impl BigSwarmPersonality {
    fn greedy(&mut self) -> &mut Box<dyn Personality> {
        self.inner.get_or_insert_with(|| {
            let p: Box<dyn Personality> = Box::<GreedyPersonality>::default();
            p
        })
    }
}

impl Personality for BigSwarmPersonality {
    fn name(&self) -> String {
        match &self.inner {
            Some(p) => format!("BigSwarm ({})", p.name()),
            None => "BigSwarm (<undecided>)".to_owned(),
        }
    }

    fn new_peer(&mut self, peer: PeerId) {
        self.greedy().new_peer(peer);
    }

    fn remove_peer(&mut self, peer: PeerId) {
        self.greedy().remove_peer(peer);
    }

    fn peer_is_seeder(&mut self, peer: PeerId) {
        self.greedy().peer_is_seeder(peer);
    }

    fn this_peer_is_seeder(&mut self) {
        self.inner
            .get_or_insert_with(|| {
                let p: Box<dyn Personality> = Box::<AltruisticPersonality>::default();
                p
            })
            .this_peer_is_seeder();
    }

    fn should_stop(&mut self) -> bool {
        self.inner.as_mut().is_some_and(|p| p.should_stop())
    }

    fn added_piece(&mut self, piece: usize) {
        self.greedy().added_piece(piece);
    }

    fn new_helped_peer(&mut self, peer: PeerId) {
        match &mut self.inner {
            Some(p) => p.new_helped_peer(peer),
            None => warn!("BigSwarmPersonality: no personality has been chosen"),
        }
    }

    fn remove_helped_peer(&mut self, peer: PeerId) -> bool {
        match &mut self.inner {
            Some(p) => p.remove_helped_peer(peer),
            None => {
                warn!("BigSwarmPersonality: no personality has been chosen");
                true
            }
        }
    }

    fn download_time(&self) -> Option<Duration> {
        self.inner.as_ref()?.download_time()
    }

    fn dump_state(&self) {
        match &self.inner {
            Some(p) => {
                info!("BigSwarmPersonality: nested personality is {}", p.name());
                p.dump_state();
            }
            None => warn!("BigSwarmPersonality: no personality has been chosen"),
        }
    }

    fn print_statistics(&self) {
        if let Some(p) = &self.inner {
            p.print_statistics();
        }
    }
}

/// A cache never owns the file, it stays as long as peers need it.
#[derive(Debug, Default)]
pub struct TradingPersonality {
    timeline: Timeline,
    needy: Needy,
}

impl Personality for TradingPersonality {
    fn name(&self) -> String {
        "Trading".to_owned()
    }

    fn new_peer(&mut self, peer: PeerId) {
        self.timeline.start();
        self.needy.add(peer);
    }

    fn remove_peer(&mut self, peer: PeerId) {
        self.needy.remove(&peer);
    }

    fn peer_is_seeder(&mut self, peer: PeerId) {
        self.needy.remove(&peer);
    }

    fn this_peer_is_seeder(&mut self) {
        debug!("TradingPersonality: we are now a seeder");
        self.timeline.seeder();
    }

    fn should_stop(&mut self) -> bool {
        self.needy.done()
    }

    fn added_piece(&mut self, _piece: usize) {
        self.timeline.piece();
    }

    fn download_time(&self) -> Option<Duration> {
        self.timeline.download_time()
    }

    fn dump_state(&self) {
        info!(
            "TradingPersonality: saw_clients={} needy={:?}",
            self.needy.saw_clients, self.needy.peers
        );
    }

    fn print_statistics(&self) {
        self.timeline.report("Trading");
    }
}

/// A helper leaves once every coordinator it helped has the file or is
/// gone.
#[derive(Debug, Default)]
pub struct ProxyHelperPersonality {
    timeline: Timeline,
    needy: Needy,
}

impl Personality for ProxyHelperPersonality {
    fn name(&self) -> String {
        "ProxyHelper".to_owned()
    }

    fn new_peer(&mut self, _peer: PeerId) {}

    fn remove_peer(&mut self, peer: PeerId) {
        self.needy.remove(&peer);
    }

    fn peer_is_seeder(&mut self, peer: PeerId) {
        if self.needy.remove(&peer) {
            self.timeline.seeder();
        }
    }

    fn this_peer_is_seeder(&mut self) {}

    fn should_stop(&mut self) -> bool {
        self.needy.done()
    }

    fn added_piece(&mut self, _piece: usize) {
        self.timeline.piece();
    }

    fn new_helped_peer(&mut self, peer: PeerId) {
        self.timeline.start();
        self.needy.add(peer);
    }

    fn remove_helped_peer(&mut self, peer: PeerId) -> bool {
        self.needy.remove(&peer)
    }

    fn download_time(&self) -> Option<Duration> {
        self.timeline.download_time()
    }

    fn dump_state(&self) {
        info!(
            "ProxyHelperPersonality: saw_needy={} needy={:?}",
            self.needy.saw_clients, self.needy.peers
        );
    }

    fn print_statistics(&self) {
        self.timeline.report("ProxyHelper");
    }
}
