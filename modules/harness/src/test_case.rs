//! Test cases: ordered objects with expected outcomes and sync flags.

use std::{sync::Arc, time::Duration};

use lockstep_common::{Block, BlockHash, BlockHeader, Transaction};

use crate::outcome::{Outcome, RejectResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestObject {
    /// Seeds the store and is pushed directly; never synced or checked.
    Header(BlockHeader),
    Block(Arc<Block>),
    Transaction(Arc<Transaction>),
}

impl From<BlockHeader> for TestObject {
    fn from(header: BlockHeader) -> Self {
        TestObject::Header(header)
    }
}

impl From<Block> for TestObject {
    fn from(block: Block) -> Self {
        TestObject::Block(Arc::new(block))
    }
}

impl From<Arc<Block>> for TestObject {
    fn from(block: Arc<Block>) -> Self {
        TestObject::Block(block)
    }
}

impl From<Transaction> for TestObject {
    fn from(tx: Transaction) -> Self {
        TestObject::Transaction(Arc::new(tx))
    }
}

impl From<Arc<Transaction>> for TestObject {
    fn from(tx: Arc<Transaction>) -> Self {
        TestObject::Transaction(tx)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCaseEntry {
    object: TestObject,
    outcome: Outcome,
    tip: Option<BlockHash>,
}

impl TestCaseEntry {
    pub fn new(object: impl Into<TestObject>, outcome: impl Into<Outcome>) -> Self {
        Self {
            object: object.into(),
            outcome: outcome.into(),
            tip: None,
        }
    }

    pub fn header(header: BlockHeader) -> Self {
        Self::new(header, Outcome::Unconstrained)
    }

    /// Compare peers' tips against `tip` instead of the block's own hash.
    /// Ignored for anything but blocks.
    pub fn with_tip(mut self, tip: BlockHash) -> Self {
        if matches!(self.object, TestObject::Block(_)) {
            self.tip = Some(tip);
        }
        self
    }

    pub fn object(&self) -> &TestObject {
        &self.object
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// The hash peers' tips are checked against; blocks only.
    pub fn expected_tip(&self) -> Option<BlockHash> {
        match &self.object {
            TestObject::Block(block) => Some(self.tip.unwrap_or_else(|| block.hash())),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TestCase {
    entries: Vec<TestCaseEntry>,
    sync_every_block: bool,
    sync_every_tx: bool,
    sync_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl TestCase {
    pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(entries: Vec<TestCaseEntry>) -> Self {
        Self {
            entries,
            sync_every_block: true,
            sync_every_tx: false,
            sync_timeout: Self::DEFAULT_SYNC_TIMEOUT,
            request_timeout: None,
        }
    }

    /// A single block expected to become every peer's tip.
    pub fn accepted(block: impl Into<Arc<Block>>) -> Self {
        let block: Arc<Block> = block.into();
        Self::new(vec![TestCaseEntry::new(block, true)])
    }

    /// A single block expected not to become the tip, optionally with a
    /// specific reject code and reason prefix.
    pub fn rejected(block: impl Into<Arc<Block>>, reject: Option<RejectResult>) -> Self {
        let block: Arc<Block> = block.into();
        let outcome = reject.map_or(Outcome::Accepted(false), Outcome::Rejected);
        Self::new(vec![TestCaseEntry::new(block, outcome)])
    }

    pub fn sync_every_block(mut self, sync: bool) -> Self {
        self.sync_every_block = sync;
        self
    }

    pub fn sync_every_tx(mut self, sync: bool) -> Self {
        self.sync_every_tx = sync;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Floor for how long nodes get to request an announced block.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn entries(&self) -> &[TestCaseEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn syncs_every_block(&self) -> bool {
        self.sync_every_block
    }

    pub fn syncs_every_tx(&self) -> bool {
        self.sync_every_tx
    }

    pub fn block_sync_timeout(&self) -> Duration {
        self.sync_timeout
    }

    pub fn block_request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_common::Hash;

    fn block() -> Block {
        Block::new(Hash::ZERO, 0, vec![Transaction::new(b"cb".to_vec())])
    }

    #[test]
    fn tip_defaults_to_block_hash() {
        let block = block();
        let entry = TestCaseEntry::new(block.clone(), true);
        assert_eq!(entry.expected_tip(), Some(block.hash()));

        let other = Hash::from([9u8; 32]);
        assert_eq!(entry.with_tip(other).expected_tip(), Some(other));
    }

    #[test]
    fn tip_override_ignored_for_non_blocks() {
        let entry = TestCaseEntry::new(Transaction::new(b"tx".to_vec()), true)
            .with_tip(Hash::from([9u8; 32]));
        assert_eq!(entry.expected_tip(), None);
        assert_eq!(TestCaseEntry::header(block().header).expected_tip(), None);
    }

    #[test]
    fn default_sync_settings() {
        let case = TestCase::new(vec![]);
        assert!(case.syncs_every_block());
        assert!(!case.syncs_every_tx());
        assert_eq!(case.block_sync_timeout(), Duration::from_secs(300));
        assert_eq!(case.block_request_timeout(), None);
        assert!(case.is_empty());
    }

    #[test]
    fn rejected_without_reason_means_not_accepted() {
        let case = TestCase::rejected(Arc::new(block()), None);
        assert_eq!(case.entries()[0].outcome(), &Outcome::Accepted(false));

        let case = TestCase::rejected(Arc::new(block()), Some(RejectResult::new(16, b"bad".to_vec())));
        assert_eq!(case.entries()[0].outcome(), &Outcome::rejected(16, b"bad".to_vec()));
    }
}
