use std::io;

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinError};

use crate::{
    engine::EngineMsg,
    peer::PeerId,
    transmitter::TransmitterMsg,
    wire::Chunk,
};

impl From<mpsc::error::SendError<EngineMsg>> for Error {
    fn from(value: mpsc::error::SendError<EngineMsg>) -> Self {
        Self::SendEngineError(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format: {0}"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error("Could not serialize the configuration: {0}")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),

    #[error("Unknown message id `{0}`")]
    UnknownMessageId(u8),

    #[error("Message of {0} bytes exceeds the maximum frame size")]
    MessageTooLarge(usize),

    #[error("Malformed message: {0}")]
    MalformedMessage(&'static str),

    #[error("Piece {0} is out of range")]
    PieceOutOfRange(usize),

    #[error("{0} is out of the bounds of its piece")]
    ChunkOutOfBounds(Chunk),

    #[error("Piece {0} is not available in the store")]
    PieceNotValid(usize),

    #[error("Piece {piece} should have {expected} bytes but has {got}")]
    PieceSizeMismatch {
        piece: usize,
        expected: usize,
        got: usize,
    },

    #[error("The given peer id was not found: {0}")]
    PeerNotFound(PeerId),

    #[error("The peer {0} is no longer reachable")]
    PeerGone(PeerId),

    #[error("Could not deliver a message to {0}")]
    SendFailed(PeerId),

    #[error("Peer {0} sent {1}, which we never requested")]
    UnsolicitedChunk(PeerId, Chunk),

    #[error("Peer {0} sent {1} twice")]
    DuplicateChunk(PeerId, Chunk),

    #[error("Peer {0} sent {1} for a download that is no longer running")]
    StaleChunk(PeerId, Chunk),

    #[error("The engine has already stopped")]
    EngineStopped,

    #[error("Could not send message to Engine: {0}")]
    SendEngineError(String),

    #[error("Could not send message to Transmitter")]
    SendErrorTransmitter(#[from] mpsc::error::SendError<TransmitterMsg>),

    #[error("A background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("The transmitter took too long to drain its queues")]
    TransmitterTimeout,
}
