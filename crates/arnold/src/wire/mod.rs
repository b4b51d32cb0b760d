//! Messages exchanged between peers.
//!
//! The catalog is small on purpose: state announcements (catalog, have,
//! interested, choke), the data path (request, cancel, piece), the proxy
//! protocol (ask-for-help, join, resign, stop, request-pieces) and the
//! connection teardown.
mod codec;

pub use codec::*;

use std::fmt;

use bytes::Bytes;
use tokio::io;

use crate::{credit::CreditValue, piece_set::PieceSet};

/// A byte range of a piece, the unit of transfer and of request/cancel
/// bookkeeping. Equality and hashing are by value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk {
    pub piece: usize,
    pub offset: usize,
    pub len: usize,
}

impl Chunk {
    pub fn new(piece: usize, offset: usize, len: usize) -> Self {
        Self { piece, offset, len }
    }

    /// Offset of the first byte after this chunk.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk[pc={},off={:#x},sz={:#x}]",
            self.piece, self.offset, self.len
        )
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Messages of [`MessageCodec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// The full set of pieces the sender owns.
    ///
    /// <len=5+bytes><id=1><piece_count: u32><bitfield>
    Catalog(PieceSet),
    /// The sender completed a piece.
    ///
    /// <len=5><id=2><piece: u32>
    Have(usize),
    /// Whether the sender wants data from the receiver.
    ///
    /// <len=2><id=3><flag: u8>
    Interested(bool),
    /// Whether the sender will serve chunk requests of the receiver, the
    /// reason is only there for diagnostics.
    ///
    /// <len=2+reason><id=4><flag: u8><reason>
    Choke { choked: bool, reason: String },
    /// Ask for a chunk, with the credit of the sender.
    ///
    /// <len=29><id=5><piece><offset><len><credit>
    Request { chunk: Chunk, credit: CreditValue },
    /// Withdraw a request.
    ///
    /// <len=13><id=6><piece><offset><len>
    Cancel(Chunk),
    /// The bytes of a chunk, with the credit of the sender.
    ///
    /// <len=29+data><id=7><piece><offset><len><credit><data>
    Piece {
        chunk: Chunk,
        data: Bytes,
        credit: CreditValue,
    },
    /// A coordinator asks the receiver to become its helper.
    AskForHelp,
    /// The receiver accepted to help.
    JoinHelpers,
    /// The sender will not (or no longer) help.
    ResignAsHelper,
    /// A coordinator releases its helper.
    StopHelping,
    /// A coordinator hands a share of the pieces it wants to a helper.
    ///
    /// <len=5+bytes><id=12><piece_count: u32><bitfield>
    RequestPieces(PieceSet),
    /// The sender will not talk to the receiver anymore.
    CloseConnection,
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Catalog(_) => MessageId::Catalog,
            Message::Have(_) => MessageId::Have,
            Message::Interested(_) => MessageId::Interested,
            Message::Choke { .. } => MessageId::Choke,
            Message::Request { .. } => MessageId::Request,
            Message::Cancel(_) => MessageId::Cancel,
            Message::Piece { .. } => MessageId::Piece,
            Message::AskForHelp => MessageId::AskForHelp,
            Message::JoinHelpers => MessageId::JoinHelpers,
            Message::ResignAsHelper => MessageId::ResignAsHelper,
            Message::StopHelping => MessageId::StopHelping,
            Message::RequestPieces(_) => MessageId::RequestPieces,
            Message::CloseConnection => MessageId::CloseConnection,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    Catalog = 1,
    Have = 2,
    Interested = 3,
    Choke = 4,
    Request = 5,
    Cancel = 6,
    Piece = 7,
    AskForHelp = 8,
    JoinHelpers = 9,
    ResignAsHelper = 10,
    StopHelping = 11,
    RequestPieces = 12,
    CloseConnection = 13,
}

impl MessageId {
    pub const ALL: [MessageId; 13] = [
        MessageId::Catalog,
        MessageId::Have,
        MessageId::Interested,
        MessageId::Choke,
        MessageId::Request,
        MessageId::Cancel,
        MessageId::Piece,
        MessageId::AskForHelp,
        MessageId::JoinHelpers,
        MessageId::ResignAsHelper,
        MessageId::StopHelping,
        MessageId::RequestPieces,
        MessageId::CloseConnection,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MessageId::Catalog => "catalog",
            MessageId::Have => "have",
            MessageId::Interested => "interested",
            MessageId::Choke => "choke",
            MessageId::Request => "request",
            MessageId::Cancel => "cancel",
            MessageId::Piece => "piece",
            MessageId::AskForHelp => "ask-for-help",
            MessageId::JoinHelpers => "join-helpers",
            MessageId::ResignAsHelper => "resign-as-helper",
            MessageId::StopHelping => "stop-helping",
            MessageId::RequestPieces => "request-pieces",
            MessageId::CloseConnection => "close-connection",
        }
    }
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        MessageId::ALL
            .iter()
            .find(|id| **id as u8 == k)
            .copied()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "Unknown message id")
            })
    }
}
