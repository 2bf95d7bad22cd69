use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use lockstep_common::{Block, BlockHash, BlockHeader, InvKind, Inventory, MAX_HEADERS_RESULTS, Message};
use tracing::trace;

/// Blocks and headers announced by the harness, keyed by hash.
///
/// Readers (peer request handlers) may run while the orchestrator inserts.
/// The most recently added block or header is the store's current tip and
/// anchors header-range answers.
#[derive(Default)]
pub struct BlockStore {
    blocks: DashMap<BlockHash, Arc<Block>>,
    headers: DashMap<BlockHash, BlockHeader>,
    current_tip: RwLock<Option<BlockHash>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `block` and makes it the current tip. Returns `true` when this
    /// is the first time a block with this hash has been stored.
    pub fn add_block(&self, block: Arc<Block>) -> bool {
        let hash = block.hash();
        self.headers.insert(hash, block.header.clone());
        let first = self.blocks.insert(hash, block).is_none();
        self.set_tip(hash);
        trace!(%hash, first, "stored block");
        first
    }

    pub fn add_header(&self, header: BlockHeader) {
        let hash = header.hash();
        self.headers.insert(hash, header);
        self.set_tip(hash);
    }

    pub fn contains_block(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<Arc<Block>> {
        self.blocks.get(hash).map(|b| b.value().clone())
    }

    pub fn get_header(&self, hash: &BlockHash) -> Option<BlockHeader> {
        self.headers.get(hash).map(|h| h.value().clone())
    }

    pub fn current_tip(&self) -> Option<BlockHash> {
        *self.current_tip.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_tip(&self, hash: BlockHash) {
        *self.current_tip.write().unwrap_or_else(PoisonError::into_inner) = Some(hash);
    }

    /// `block` messages for every requested block we hold.
    pub fn blocks_for(&self, inventory: &[Inventory]) -> Vec<Message> {
        inventory
            .iter()
            .filter(|inv| inv.kind == InvKind::Block)
            .filter_map(|inv| self.get_block(&inv.hash))
            .map(Message::Block)
            .collect()
    }

    /// Answer a `getheaders`: walk back from the current tip until a locator
    /// entry (or the start of the known chain) is reached, then return the
    /// headers oldest first, cut after `stop` if it is on that path.
    pub fn headers_for(&self, locator: &[BlockHash], stop: BlockHash) -> Option<Vec<BlockHeader>> {
        let tip = self.current_tip()?;
        let header = self.get_header(&tip)?;

        let mut path = vec![(tip, header)];
        loop {
            let (hash, header) = &path[path.len() - 1];
            if locator.contains(hash) {
                break;
            }
            let prev = header.prev_block;
            match self.get_header(&prev) {
                Some(parent) => path.push((prev, parent)),
                None => break,
            }
        }
        path.reverse();
        path.truncate(MAX_HEADERS_RESULTS);

        if let Some(index) = path.iter().position(|(hash, _)| *hash == stop) {
            path.truncate(index + 1);
        }
        Some(path.into_iter().map(|(_, header)| header).collect())
    }

    /// Sparse block locator starting at the parent of `tip` (or of the current
    /// tip): ten consecutive ancestors, then doubling gaps. Only full blocks
    /// are walked, so a header-only tip yields an empty locator.
    pub fn locator_for(&self, tip: Option<BlockHash>) -> Vec<BlockHash> {
        let Some(tip) = tip.or_else(|| self.current_tip()) else {
            return vec![];
        };

        let mut locator = vec![];
        let mut step = 1usize;
        let mut counter = 0usize;
        let mut cursor = self.get_block(&tip);
        while let Some(block) = cursor {
            locator.push(block.prev_block());
            let mut next = Some(block);
            for _ in 0..step {
                next = next.and_then(|b| self.get_block(&b.prev_block()));
                if next.is_none() {
                    break;
                }
            }
            cursor = next;
            counter += 1;
            if counter > 10 {
                step *= 2;
            }
        }
        locator
    }

    pub fn clear(&self) {
        self.blocks.clear();
        self.headers.clear();
        *self.current_tip.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
