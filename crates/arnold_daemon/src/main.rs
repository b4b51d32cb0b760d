use std::fs::OpenOptions;

use arnold::config::Config;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod args;
mod error;
mod simulation;

use args::Args;
use error::Error;
use simulation::Simulation;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let level: Level = args.log_level.into();

    // keeps the log file writer alive until we return
    let _guard = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|_| Error::LogFile(path.display().to_string()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(writer)
                .with_ansi(false)
                .without_time()
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Logger(e.to_string()))?;
            Some(guard)
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .without_time()
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Logger(e.to_string()))?;
            None
        }
    };

    let config = match &args.config {
        Some(path) => {
            let s = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::ConfigRead(path.display().to_string(), e))?;
            Config::from_toml(&s)?
        }
        None => Config::load().await?,
    };

    let reports = Simulation::new(config, args)?.run().await?;
    info!("simulation done, {} engines", reports.len());
    for report in &reports {
        println!("{report}");
    }
    Ok(())
}
