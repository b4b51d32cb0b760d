//! A whole pool of engines in one process.
use std::sync::Arc;

use arnold::{
    config::Config,
    engine::{Engine, EngineBuilder, EngineReport, ProxyRole},
    peer::PeerId,
    personality::PersonalityKind,
    store::MemoryStore,
    transport::LocalPool,
};
use rand::{rngs::StdRng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{args::Args, error::Error};

type EngineTask = JoinHandle<Result<EngineReport, arnold::error::Error>>;

#[derive(Debug)]
pub struct Simulation {
    config: Arc<Config>,
    args: Args,
    pool: LocalPool,
    rng: StdRng,
    /// Engines started so far, each gets its own seed.
    started: u64,
}

impl Simulation {
    pub fn new(config: Config, args: Args) -> Result<Self, Error> {
        if args.seeders == 0 || (args.peers == 0 && !args.proxy) {
            return Err(Error::EmptyPool);
        }
        let pool = LocalPool::new(config.received_queue_capacity);
        Ok(Self {
            config: Arc::new(config),
            rng: StdRng::seed_from_u64(args.seed),
            args,
            pool,
            started: 0,
        })
    }

    fn file_size(&self) -> usize {
        self.args.pieces * self.config.piece_size()
    }

    fn builder(&self) -> EngineBuilder {
        EngineBuilder::new(self.config.clone())
            .scheduler(self.args.scheduler)
            .policy(self.args.ranking)
            .personality(self.args.personality)
    }

    async fn join(&mut self, builder: EngineBuilder, store: MemoryStore) -> Result<Engine, Error> {
        let id = PeerId::gen(&mut self.rng);
        let membership = self.pool.join(id).await?;
        let engine = builder
            .seed(self.args.seed.wrapping_add(self.started))
            .build(membership, Box::new(store));
        self.started += 1;
        Ok(engine)
    }

    /// Start every member, wait for the downloaders and stop the rest.
    pub async fn run(mut self) -> Result<Vec<EngineReport>, Error> {
        let size = self.file_size();
        let piece_size = self.config.piece_size();
        info!(
            "{} seeders, {} leechers, {} pieces of {} bytes",
            self.args.seeders,
            self.args.peers,
            self.args.pieces,
            piece_size
        );

        // everybody joins before anyone runs, so that no seeder sees an
        // empty pool and leaves. Seeders and helpers stop with the pool,
        // the downloaders on their own.
        let mut servers = Vec::new();
        let mut downloaders = Vec::new();
        for _ in 0..self.args.seeders {
            let builder = self.builder().personality(PersonalityKind::Altruistic);
            servers.push(self.join(builder, MemoryStore::seeder(size, piece_size)).await?);
        }
        if self.args.proxy {
            for _ in 0..self.args.helpers {
                let builder = self.builder().proxy(Some(ProxyRole::Helper));
                servers.push(self.join(builder, MemoryStore::leecher(size, piece_size)).await?);
            }
            let builder = self.builder().proxy(Some(ProxyRole::Coordinator));
            downloaders.push(self.join(builder, MemoryStore::leecher(size, piece_size)).await?);
        }
        for _ in 0..self.args.peers {
            let engine = self
                .join(self.builder(), MemoryStore::leecher(size, piece_size))
                .await?;
            downloaders.push(engine);
        }
        let servers: Vec<EngineTask> = servers.into_iter().map(|e| tokio::spawn(e.run())).collect();
        let downloaders: Vec<EngineTask> =
            downloaders.into_iter().map(|e| tokio::spawn(e.run())).collect();

        let mut reports = Vec::new();
        for task in downloaders {
            reports.push(task.await??);
        }
        info!("every downloader stopped");
        self.pool.terminate().await;
        for task in servers {
            reports.push(task.await??);
        }

        let incomplete = reports.iter().filter(|r| !r.is_complete()).count();
        if incomplete > 0 {
            warn!("{incomplete} engines stopped without the whole file");
        }
        Ok(reports)
    }
}
