//! Tunables of the engine, read from `config.toml`.
use std::{path::PathBuf, time::Duration};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::error::Error;

/// Every value that shapes the behaviour of an engine.
///
/// Missing keys in the configuration file fall back to [`Config::default`],
/// so a file only needs the values that differ from the defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Size of the unit of transfer, in bytes.
    pub chunk_size: usize,
    /// How many chunks make up a piece, the last piece may be shorter.
    pub chunks_per_piece: usize,
    /// Outstanding chunk requests per incomplete piece.
    pub chunk_requests_per_peer: usize,
    /// Pieces that may be in flight from a single peer.
    pub piece_requests_per_peer: usize,
    /// Minimum size of the neighbor set.
    pub neighbor_set_size: usize,
    /// The slotted scheduler grows its neighbor set up to this size.
    pub maximal_tracker_set_size: usize,
    pub maximal_unchoked_peers: usize,
    pub transfer_monitor_window_ms: u64,
    pub slot_update_interval_ms: u64,
    /// Download replicas allowed for a piece during endgame.
    pub maximal_endgame_replication: u32,
    /// Size of the random sample the piece ranker picks from.
    pub ranker_maximum_choices: usize,
    pub maximal_cache_replication_fraction: f64,
    pub impatient_seeding_fraction: f64,
    pub maximal_engine_sleep_ms: u64,
    pub maximal_send_retries: u32,
    pub received_queue_capacity: usize,
    pub ideal_transmitter_queue_length: usize,
    pub transmitter_shutdown_timeout_ms: u64,
    pub transmitter_idle_ms: u64,
    pub transmitter_retry_ms: u64,
    pub watchdog_interval_ms: u64,
    /// Helpers a proxy coordinator splits the wanted pieces over.
    pub proxy_maximal_helpers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 1 << 14,
            chunks_per_piece: 1 << 4,
            chunk_requests_per_peer: 8,
            piece_requests_per_peer: 2,
            neighbor_set_size: 20,
            maximal_tracker_set_size: 35,
            maximal_unchoked_peers: 8,
            transfer_monitor_window_ms: 800,
            slot_update_interval_ms: 3 * 800,
            maximal_endgame_replication: 2,
            ranker_maximum_choices: 30,
            maximal_cache_replication_fraction: 0.4,
            impatient_seeding_fraction: 0.5,
            maximal_engine_sleep_ms: 2500,
            maximal_send_retries: 5,
            received_queue_capacity: 50,
            ideal_transmitter_queue_length: 3,
            transmitter_shutdown_timeout_ms: 30_000,
            transmitter_idle_ms: 5000,
            transmitter_retry_ms: 100,
            watchdog_interval_ms: 10_000,
            proxy_maximal_helpers: 4,
        }
    }
}

impl Config {
    pub fn piece_size(&self) -> usize {
        self.chunk_size * self.chunks_per_piece
    }

    pub fn transfer_window(&self) -> Duration {
        Duration::from_millis(self.transfer_monitor_window_ms)
    }

    pub fn slot_update_interval(&self) -> Duration {
        Duration::from_millis(self.slot_update_interval_ms)
    }

    pub fn engine_sleep(&self) -> Duration {
        Duration::from_millis(self.maximal_engine_sleep_ms)
    }

    pub fn transmitter_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.transmitter_shutdown_timeout_ms)
    }

    pub fn transmitter_idle(&self) -> Duration {
        Duration::from_millis(self.transmitter_idle_ms)
    }

    pub fn transmitter_retry(&self) -> Duration {
        Duration::from_millis(self.transmitter_retry_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Returns the configuration fs File and it's path,
    ///
    /// If it doesn't exist, we try to create a default configuration file
    /// at the user's config folder, which we get from their environmental
    /// variables.
    ///
    /// # Errors
    ///
    /// This fn can fail if the program does not have access to the config
    /// dir, or to the file inside of it.
    pub async fn config_file() -> Result<(File, PathBuf), Error> {
        // errors if the user does not have a home folder
        let dotfile =
            ProjectDirs::from("", "", "Arnold").ok_or(Error::HomeInvalid)?;
        let mut config_path = dotfile.config_dir().to_path_buf();

        if !config_path.exists() {
            create_dir_all(&config_path).await.map_err(|_| {
                Error::FolderOpenError(config_path.display().to_string())
            })?;
        }

        config_path.push("config.toml");

        let mut config_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config_path)
            .await?;

        // an empty or invalid file gets the default configuration.
        let mut dst = String::new();
        config_file.read_to_string(&mut dst).await?;

        if toml::from_str::<Config>(&dst).is_err() {
            let config_str = toml::to_string(&Config::default())?;
            let mut config_file = File::create(&config_path).await?;
            config_file.write_all(config_str.as_bytes()).await?;
        }

        let config_file =
            OpenOptions::new().read(true).open(&config_path).await?;

        Ok((config_file, config_path))
    }

    /// Load the configuration file and transform it into Self.
    /// If the file does not exist, it tries to create the file
    /// with the default configurations.
    pub async fn load() -> Result<Self, Error> {
        let (mut file, _p) = Self::config_file().await?;

        let mut config_str = String::new();
        file.read_to_string(&mut config_str).await?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let config = toml::from_str::<Config>(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 || self.chunks_per_piece == 0 {
            return Err(Error::ConfigError(
                "chunk_size and chunks_per_piece must be positive".into(),
            ));
        }
        if self.maximal_unchoked_peers == 0 {
            return Err(Error::ConfigError(
                "maximal_unchoked_peers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
