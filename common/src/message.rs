//! Peer protocol messages as seen by the harness.
//!
//! Framing and wire encoding belong to the transport; everything above it
//! exchanges these already-decoded values.

use std::{fmt, sync::Arc};

use crate::{
    hash::{BlockHash, Hash},
    object::{Block, BlockHeader, Transaction},
};

/// Default capacity of a single `inv` message.
pub const MAX_INV_ELEMENTS: usize = 50_000;

/// Maximum number of headers returned for one `getheaders`.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InvKind {
    Tx,
    Block,
}

/// An inventory vector: announces or requests one object by hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Inventory {
    pub kind: InvKind,
    pub hash: Hash,
}

impl Inventory {
    pub fn block(hash: BlockHash) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash) -> Self {
        Self {
            kind: InvKind::Tx,
            hash,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub protocol_version: u32,
    pub user_agent: String,
    pub start_height: u32,
    pub nonce: u64,
}

/// Which kind of message a `reject` refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectKind {
    Block,
    Tx,
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reject {
    pub message: RejectKind,
    pub code: u8,
    pub reason: Vec<u8>,
    pub data: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version(VersionInfo),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    GetHeaders { locator: Vec<BlockHash>, stop: BlockHash },
    Headers(Vec<BlockHeader>),
    Block(Arc<Block>),
    Tx(Arc<Transaction>),
    Mempool,
    Reject(Reject),
}

impl Message {
    /// Wire command name, used in logs and protocol-violation reports.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Mempool => "mempool",
            Message::Reject(_) => "reject",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                write!(f, "{}({} items)", self.command(), items.len())
            }
            Message::Headers(headers) => write!(f, "headers({})", headers.len()),
            Message::Ping(nonce) | Message::Pong(nonce) => write!(f, "{}({nonce})", self.command()),
            Message::Block(block) => write!(f, "block({})", block.hash()),
            Message::Tx(tx) => write!(f, "tx({})", tx.hash()),
            Message::Reject(reject) => write!(
                f,
                "reject({:?}, {}, {})",
                reject.message,
                reject.code,
                String::from_utf8_lossy(&reject.reason)
            ),
            _ => f.write_str(self.command()),
        }
    }
}

/// What a transport delivers to the harness for one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Message(Message),
    /// The transport received a frame it could not decode.
    Malformed { command: String, reason: String },
    /// The remote side went away; nothing follows this event.
    Closed,
}
