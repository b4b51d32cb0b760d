//! Wiring of an [`Engine`]: which scheduler, which personality.
use std::sync::Arc;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    config::Config,
    context::Ctx,
    credit::Credit,
    peer::RankingPolicy,
    personality::{Personality, PersonalityKind},
    piece_set::PieceSet,
    proxy::{ProxyCoordinator, ProxyHelper},
    scheduler::{CacheScheduler, GreedyScheduler, Scheduler, SlottedScheduler},
    store::Store,
    transmitter::Transmitter,
    transport::Membership,
};

use super::{Assembly, Engine, MessageCounts, Phase};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    /// Talk to every neighbor, no upload slots.
    #[default]
    Greedy,
    /// A fixed number of upload slots, refreshed periodically.
    Slotted,
    /// Download only the pieces that are scarce, to relay them.
    Cache,
}

/// The part a node plays in proxy mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyRole {
    /// Downloads only through helpers.
    Coordinator,
    /// Downloads for the coordinators it accepted.
    Helper,
}

#[derive(Debug, Clone)]
pub struct EngineBuilder {
    config: Arc<Config>,
    scheduler: SchedulerKind,
    policy: RankingPolicy,
    personality: PersonalityKind,
    proxy: Option<ProxyRole>,
    seed: u64,
}

impl EngineBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            scheduler: SchedulerKind::default(),
            policy: RankingPolicy::default(),
            personality: PersonalityKind::default(),
            proxy: None,
            seed: 0,
        }
    }

    pub fn scheduler(mut self, kind: SchedulerKind) -> Self {
        self.scheduler = kind;
        self
    }

    pub fn policy(mut self, policy: RankingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Ignored for caches and helpers, they always trade.
    pub fn personality(mut self, kind: PersonalityKind) -> Self {
        self.personality = kind;
        self
    }

    pub fn proxy(mut self, role: Option<ProxyRole>) -> Self {
        self.proxy = role;
        self
    }

    /// Seed of the random choices of the engine.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn plain_scheduler(&self, known: PieceSet) -> Box<dyn Scheduler> {
        match self.scheduler {
            SchedulerKind::Greedy => Box::new(GreedyScheduler::new(known, self.policy)),
            SchedulerKind::Slotted => Box::new(SlottedScheduler::new(
                known,
                self.policy,
                self.config.maximal_unchoked_peers,
            )),
            SchedulerKind::Cache => Box::new(CacheScheduler::new(known, self.policy)),
        }
    }

    fn build_scheduler(&self, known: PieceSet) -> Box<dyn Scheduler> {
        match self.proxy {
            None => self.plain_scheduler(known),
            Some(ProxyRole::Coordinator) => Box::new(ProxyCoordinator::new(
                self.plain_scheduler(known.clone()),
                &known,
                self.config.proxy_maximal_helpers,
            )),
            Some(ProxyRole::Helper) => Box::new(ProxyHelper::new(
                self.plain_scheduler(known.clone()),
                self.plain_scheduler(known),
            )),
        }
    }

    fn build_personality(&self) -> Box<dyn Personality> {
        let kind = match (self.proxy, self.scheduler) {
            (Some(ProxyRole::Helper), _) => PersonalityKind::ProxyHelper,
            (_, SchedulerKind::Cache) => PersonalityKind::Trading,
            _ => self.personality,
        };
        kind.build(self.config.impatient_seeding_fraction)
    }

    pub fn build(&self, membership: Membership, store: Box<dyn Store>) -> Engine {
        let Membership {
            local,
            transport,
            messages,
            control,
            control_tx,
        } = membership;

        let scheduler = self.build_scheduler(store.known_pieces());
        let personality = self.build_personality();
        debug!(
            "{local}: {} scheduler, {} personality",
            scheduler.name(),
            personality.name()
        );

        let wake = Arc::new(Notify::new());
        let (transmitter, handle) =
            Transmitter::new(self.config.clone(), transport.clone(), wake.clone());

        Engine {
            cx: Ctx::new(self.config.clone(), local, self.seed),
            scheduler,
            personality,
            store,
            transport,
            assembly: Assembly::new(self.config.chunk_size),
            credit: Credit::new(),
            messages,
            control,
            control_tx,
            wake,
            transmitter: handle,
            pending_transmitter: Some(transmitter),
            received: MessageCounts::default(),
            received_bytes: 0,
            phase: Phase::Running,
            rounds: 0,
        }
    }
}
