//! Lockstep object store module.
//!
//! Repository of everything the harness has announced to the nodes under
//! test, so that peer handlers can answer `getdata` and `getheaders` at any
//! time, including while the orchestrator is still inserting.

mod block_store;
mod tx_store;

use std::sync::Arc;

use lockstep_common::{Block, BlockHash, BlockHeader, Inventory, Message, Transaction};

pub use crate::{block_store::BlockStore, tx_store::TxStore};

/// Block store and transaction store shared between the orchestrator
/// (writer) and every peer handler (readers).
#[derive(Default)]
pub struct ObjectStore {
    blocks: BlockStore,
    transactions: TxStore,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`BlockStore::add_block`].
    pub fn add_block(&self, block: Arc<Block>) -> bool {
        self.blocks.add_block(block)
    }

    pub fn add_header(&self, header: BlockHeader) {
        self.blocks.add_header(header)
    }

    pub fn add_transaction(&self, tx: Arc<Transaction>) {
        self.transactions.add_transaction(tx)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<Arc<Block>> {
        self.blocks.get_block(hash)
    }

    /// Payload messages answering one `getdata`: blocks first, then
    /// transactions. Hashes we do not hold are skipped.
    pub fn objects_for(&self, inventory: &[Inventory]) -> Vec<Message> {
        let mut out = self.blocks.blocks_for(inventory);
        out.extend(self.transactions.transactions_for(inventory));
        out
    }

    pub fn headers_for(&self, locator: &[BlockHash], stop: BlockHash) -> Option<Vec<BlockHeader>> {
        self.blocks.headers_for(locator, stop)
    }

    pub fn locator_for(&self, tip: Option<BlockHash>) -> Vec<BlockHash> {
        self.blocks.locator_for(tip)
    }

    /// Drop everything; called once all peers have disconnected.
    pub fn clear(&self) {
        self.blocks.clear();
        self.transactions.clear();
    }
}
