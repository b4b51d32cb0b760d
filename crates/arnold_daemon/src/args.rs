use std::path::PathBuf;

use arnold::{
    engine::SchedulerKind, peer::RankingPolicy, personality::PersonalityKind,
};
use clap::{Parser, ValueEnum};
use tracing::Level;

#[derive(Parser, Debug, Clone)]
#[clap(name = "Arnold Daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Leechers in the pool.
    #[clap(long, default_value_t = 4)]
    pub peers: usize,

    /// Peers that start with the whole file.
    #[clap(long, default_value_t = 1)]
    pub seeders: usize,

    /// Pieces of the shared file.
    #[clap(long, default_value_t = 64)]
    pub pieces: usize,

    #[clap(long, value_enum, default_value_t = SchedulerKind::Greedy)]
    pub scheduler: SchedulerKind,

    #[clap(long, value_enum, default_value_t = RankingPolicy::TitForTat)]
    pub ranking: RankingPolicy,

    /// Personality of the leechers, seeders are always altruistic.
    #[clap(long, value_enum, default_value_t = PersonalityKind::Greedy)]
    pub personality: PersonalityKind,

    /// Add a proxy coordinator that downloads through helpers.
    #[clap(long)]
    pub proxy: bool,

    /// Helpers available to the proxy coordinator.
    #[clap(long, default_value_t = 2)]
    pub helpers: usize,

    /// Seed of every random choice, runs with the same seed make the same
    /// decisions.
    #[clap(long, default_value_t = 0)]
    pub seed: u64,

    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Write the logs to this file instead of stdout.
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Read the configuration from this file instead of the default
    /// location.
    #[clap(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}
