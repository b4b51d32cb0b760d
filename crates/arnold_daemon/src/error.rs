use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Engine(#[from] arnold::error::Error),
    #[error("Could not read the config file `{0}`: {1}")]
    ConfigRead(String, std::io::Error),
    #[error("Could not open the log file `{0}`")]
    LogFile(String),
    #[error("Could not install the logger: {0}")]
    Logger(String),
    #[error("An engine task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
    #[error("The pool needs at least one seeder and one leecher")]
    EmptyPool,
}
