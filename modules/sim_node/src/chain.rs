//! Block tree with a most-work (here: longest) active chain.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use lockstep_common::{Block, BlockHash, BlockHeader, Hash, MAX_HEADERS_RESULTS};
use tracing::debug;

use crate::rules::{Admission, REJECT_INVALID, ValidationRules};

/// What happened to one block while a submission was processed. A single
/// submission can resolve orphans, so it may yield several.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockEvent {
    Connected { hash: BlockHash, height: u64 },
    Orphaned(BlockHash),
    Rejected {
        hash: BlockHash,
        code: u8,
        reason: String,
    },
    Ignored(BlockHash),
}

#[derive(Default)]
pub struct Chain {
    headers: HashMap<BlockHash, BlockHeader>,
    blocks: HashMap<BlockHash, Arc<Block>>,
    heights: HashMap<BlockHash, u64>,
    invalid: HashSet<BlockHash>,
    /// Blocks waiting for their parent, keyed by that parent.
    orphans: HashMap<BlockHash, Vec<Arc<Block>>>,
    orphan_hashes: HashSet<BlockHash>,
    /// Active chain by height; the first block built on the zero hash is
    /// height 0.
    active: Vec<BlockHash>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<BlockHash> {
        self.active.last().copied()
    }

    pub fn height(&self) -> Option<u64> {
        self.tip().and_then(|tip| self.heights.get(&tip).copied())
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<Arc<Block>> {
        self.blocks.get(hash).cloned()
    }

    /// True if the block body has been seen, whatever became of it.
    pub fn knows_block(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
            || self.invalid.contains(hash)
            || self.orphan_hashes.contains(hash)
    }

    pub fn is_invalid(&self, hash: &BlockHash) -> bool {
        self.invalid.contains(hash)
    }

    pub fn add_header(&mut self, header: BlockHeader) -> BlockHash {
        let hash = header.hash();
        self.headers.entry(hash).or_insert(header);
        hash
    }

    pub fn submit_block(&mut self, block: Arc<Block>, rules: &dyn ValidationRules) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        let mut queue = vec![block];

        while let Some(block) = queue.pop() {
            let hash = block.hash();
            if self.blocks.contains_key(&hash) || self.invalid.contains(&hash) {
                continue;
            }

            match rules.check_block(&block) {
                Admission::Accept => {}
                Admission::Ignore => {
                    events.push(BlockEvent::Ignored(hash));
                    continue;
                }
                Admission::Reject { code, reason } => {
                    self.mark_invalid(hash, &mut queue);
                    events.push(BlockEvent::Rejected { hash, code, reason });
                    continue;
                }
            }

            let prev = block.prev_block();
            let height = if prev == Hash::ZERO {
                0
            } else if self.invalid.contains(&prev) {
                self.mark_invalid(hash, &mut queue);
                events.push(BlockEvent::Rejected {
                    hash,
                    code: REJECT_INVALID,
                    reason: "bad-prevblk".to_string(),
                });
                continue;
            } else if let Some(parent_height) = self.heights.get(&prev) {
                parent_height + 1
            } else {
                if self.orphan_hashes.insert(hash) {
                    debug!(%hash, parent = %prev, "holding orphan block");
                    self.orphans.entry(prev).or_default().push(block);
                    events.push(BlockEvent::Orphaned(hash));
                }
                continue;
            };

            self.connect(hash, height, block);
            events.push(BlockEvent::Connected { hash, height });
            self.release_orphans(hash, &mut queue);
        }
        events
    }

    fn connect(&mut self, hash: BlockHash, height: u64, block: Arc<Block>) {
        self.headers.insert(hash, block.header.clone());
        self.blocks.insert(hash, block);
        self.heights.insert(hash, height);

        let extends = match self.height() {
            None => true,
            Some(tip_height) => height > tip_height,
        };
        if extends {
            self.activate(hash);
        }
    }

    /// Rebuild the active chain ending at `tip`.
    fn activate(&mut self, tip: BlockHash) {
        let mut chain = vec![tip];
        let mut cursor = tip;
        while let Some(block) = self.blocks.get(&cursor) {
            let prev = block.prev_block();
            if !self.blocks.contains_key(&prev) {
                break;
            }
            chain.push(prev);
            cursor = prev;
        }
        chain.reverse();
        debug!(%tip, height = chain.len() - 1, "new tip");
        self.active = chain;
    }

    fn mark_invalid(&mut self, hash: BlockHash, queue: &mut Vec<Arc<Block>>) {
        self.invalid.insert(hash);
        // Descendants waiting on this block are now known bad as well.
        self.release_orphans(hash, queue);
    }

    fn release_orphans(&mut self, parent: BlockHash, queue: &mut Vec<Arc<Block>>) {
        if let Some(children) = self.orphans.remove(&parent) {
            for child in children {
                self.orphan_hashes.remove(&child.hash());
                queue.push(child);
            }
        }
    }

    /// Headers on the active chain after the first locator entry found on
    /// it, or from height 0 if none is. Capped, and cut after `stop`.
    pub fn headers_after(&self, locator: &[BlockHash], stop: BlockHash) -> Vec<BlockHeader> {
        let start = locator
            .iter()
            .find_map(|hash| {
                let height = *self.heights.get(hash)? as usize;
                (self.active.get(height) == Some(hash)).then_some(height + 1)
            })
            .unwrap_or(0);

        let mut headers = Vec::new();
        for hash in self.active.iter().skip(start).take(MAX_HEADERS_RESULTS) {
            if let Some(header) = self.headers.get(hash) {
                headers.push(header.clone());
            }
            if *hash == stop {
                break;
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::DefaultRules;
    use lockstep_common::Transaction;

    fn block(prev: BlockHash, n: u32) -> Arc<Block> {
        Arc::new(Block::new(prev, n, vec![Transaction::new(n.to_le_bytes().to_vec())]))
    }

    fn chain_of(len: u32) -> Vec<Arc<Block>> {
        let mut prev = Hash::ZERO;
        (0..len)
            .map(|n| {
                let b = block(prev, n);
                prev = b.hash();
                b
            })
            .collect()
    }

    #[test]
    fn connects_in_order() {
        let mut chain = Chain::new();
        let rules = DefaultRules::default();
        for (n, b) in chain_of(3).into_iter().enumerate() {
            let hash = b.hash();
            assert_eq!(
                chain.submit_block(b, &rules),
                vec![BlockEvent::Connected {
                    hash,
                    height: n as u64
                }]
            );
        }
        assert_eq!(chain.height(), Some(2));
    }

    #[test]
    fn orphans_connect_once_parent_arrives() {
        let mut chain = Chain::new();
        let rules = DefaultRules::default();
        let blocks = chain_of(3);

        assert_eq!(
            chain.submit_block(blocks[2].clone(), &rules),
            vec![BlockEvent::Orphaned(blocks[2].hash())]
        );
        assert_eq!(
            chain.submit_block(blocks[1].clone(), &rules),
            vec![BlockEvent::Orphaned(blocks[1].hash())]
        );
        assert!(chain.knows_block(&blocks[2].hash()));
        assert_eq!(chain.tip(), None);

        let events = chain.submit_block(blocks[0].clone(), &rules);
        assert_eq!(events.len(), 3);
        assert_eq!(chain.tip(), Some(blocks[2].hash()));
    }

    #[test]
    fn children_of_invalid_blocks_are_rejected() {
        let mut chain = Chain::new();
        let rules = DefaultRules::default();
        let genesis = block(Hash::ZERO, 0);
        let empty = Arc::new(Block::new(genesis.hash(), 1, vec![]));
        let child = block(empty.hash(), 2);

        chain.submit_block(genesis.clone(), &rules);
        chain.submit_block(child.clone(), &rules);
        let events = chain.submit_block(empty.clone(), &rules);

        assert_eq!(
            events,
            vec![
                BlockEvent::Rejected {
                    hash: empty.hash(),
                    code: 16,
                    reason: "bad-blk-length".to_string()
                },
                BlockEvent::Rejected {
                    hash: child.hash(),
                    code: 16,
                    reason: "bad-prevblk".to_string()
                },
            ]
        );
        assert!(chain.is_invalid(&child.hash()));
        assert_eq!(chain.tip(), Some(genesis.hash()));
    }

    #[test]
    fn longer_fork_takes_over() {
        let mut chain = Chain::new();
        let rules = DefaultRules::default();
        let main = chain_of(2);
        for b in &main {
            chain.submit_block(b.clone(), &rules);
        }
        let fork1 = block(main[0].hash(), 100);
        let fork2 = block(fork1.hash(), 101);
        let fork3 = block(fork2.hash(), 102);

        chain.submit_block(fork1.clone(), &rules);
        assert_eq!(chain.tip(), Some(main[1].hash()));
        chain.submit_block(fork2.clone(), &rules);
        chain.submit_block(fork3.clone(), &rules);
        assert_eq!(chain.tip(), Some(fork3.hash()));
        assert_eq!(
            chain.headers_after(&[Hash::ZERO], Hash::ZERO).len(),
            4,
            "headers follow the new active chain"
        );
    }

    #[test]
    fn headers_after_locator_and_stop() {
        let mut chain = Chain::new();
        let rules = DefaultRules::default();
        let blocks = chain_of(5);
        for b in &blocks {
            chain.submit_block(b.clone(), &rules);
        }

        let headers = chain.headers_after(&[blocks[1].hash(), blocks[0].hash()], Hash::ZERO);
        let hashes: Vec<_> = headers.iter().map(BlockHeader::hash).collect();
        assert_eq!(hashes, vec![blocks[2].hash(), blocks[3].hash(), blocks[4].hash()]);

        let headers = chain.headers_after(&[], blocks[1].hash());
        assert_eq!(headers.len(), 2);

        let unknown = Hash::from([7u8; 32]);
        assert_eq!(chain.headers_after(&[unknown], Hash::ZERO).len(), 5);
    }

    #[test]
    fn tip_locator_returns_nothing_new() {
        let mut chain = Chain::new();
        let rules = DefaultRules::default();
        let blocks = chain_of(2);
        for b in &blocks {
            chain.submit_block(b.clone(), &rules);
        }
        assert!(chain.headers_after(&[blocks[1].hash()], Hash::ZERO).is_empty());
    }
}
