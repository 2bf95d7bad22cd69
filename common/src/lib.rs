// Lockstep common library - protocol types shared by the harness, store and nodes

pub mod connection;
pub mod controller;
pub mod hash;
pub mod message;
pub mod object;

// Flattened re-exports
pub use self::connection::{ConnectionError, PeerConnection, RemoteEnd};
pub use self::controller::NodeController;
pub use self::hash::{BlockHash, Hash, TxHash};
pub use self::message::{
    InvKind, Inventory, Message, PeerEvent, Reject, RejectKind, VersionInfo, MAX_HEADERS_RESULTS,
    MAX_INV_ELEMENTS,
};
pub use self::object::{Block, BlockHeader, Transaction};
