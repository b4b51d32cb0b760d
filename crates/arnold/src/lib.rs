//! A peer and piece scheduling engine for cooperative content distribution.
//!
//! A file is split into pieces, pieces into chunks. Every node of a pool
//! runs an [`engine::Engine`] that decides which neighbors it talks to, which
//! pieces it downloads from whom, and whose chunk requests it serves. The
//! decisions live in a [`scheduler::Scheduler`], the decision of when to
//! leave in a [`personality::Personality`].
//!
//! Proxy mode lets a coordinator download through helpers that fetch a share
//! of the pieces each, see [`proxy`].
//!
//! # Example
//!
//! A seeder and a leecher in one process:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use arnold::{config::Config, engine::EngineBuilder, peer::PeerId,
//! #     store::MemoryStore, transport::LocalPool};
//! # async fn run() -> Result<(), arnold::error::Error> {
//! let config = Arc::new(Config::default());
//! let pool = LocalPool::new(config.received_queue_capacity);
//! let builder = EngineBuilder::new(config.clone());
//!
//! let size = config.piece_size() * 10;
//! let seeder = builder.build(
//!     pool.join(PeerId::from([1; 20])).await?,
//!     Box::new(MemoryStore::seeder(size, config.piece_size())),
//! );
//! let leecher = builder.build(
//!     pool.join(PeerId::from([2; 20])).await?,
//!     Box::new(MemoryStore::leecher(size, config.piece_size())),
//! );
//!
//! let seeder = tokio::spawn(seeder.run());
//! let report = leecher.run().await?;
//! assert!(report.is_complete());
//! pool.terminate().await;
//! seeder.await??;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod counter;
pub mod credit;
pub mod engine;
pub mod error;
pub mod outstanding;
pub mod peer;
pub mod personality;
pub mod piece_ranker;
pub mod piece_set;
pub mod proxy;
pub mod scheduler;
pub mod store;
pub mod transmitter;
pub mod transport;
pub mod utils;
pub mod watchdog;
pub mod wire;
