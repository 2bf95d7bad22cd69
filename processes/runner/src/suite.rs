//! Built-in comparison suite, generated one test case at a time.

use std::sync::Arc;

use lockstep_common::{Block, BlockHash, Hash, Transaction};
use lockstep_module_harness::{Outcome, RejectResult, TestCase, TestCaseEntry};

use crate::RunnerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Extend(usize),
    Batch,
    EmptyBlock,
    Transactions,
    Confirm,
    Done,
}

/// Extends one chain through several sync modes, then exercises the mempool.
pub struct TestGenerator {
    blocks: usize,
    transactions: usize,
    max_tx_size: usize,
    stage: Stage,
    tip: BlockHash,
    height: u32,
    mempool: Vec<Transaction>,
}

impl TestGenerator {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            blocks: config.blocks,
            transactions: config.transactions,
            max_tx_size: config.max_tx_size,
            stage: Stage::Extend(0),
            tip: Hash::ZERO,
            height: 0,
            mempool: Vec::new(),
        }
    }

    /// Next block on the tip. Does not move the tip.
    fn build_block(&self, mut transactions: Vec<Transaction>) -> Block {
        let coinbase = Transaction::new(format!("coinbase {}", self.height).into_bytes());
        transactions.insert(0, coinbase);
        Block::new(self.tip, self.height, transactions)
    }

    fn advance(&mut self, block: &Block) {
        self.tip = block.hash();
        self.height += 1;
    }

    fn extend(&mut self) -> TestCase {
        let block = Arc::new(self.build_block(vec![]));
        self.advance(&block);
        TestCase::accepted(block)
    }

    fn batch(&mut self) -> TestCase {
        let entries = (0..self.blocks)
            .map(|_| {
                let block = self.build_block(vec![]);
                self.advance(&block);
                TestCaseEntry::new(block, true)
            })
            .collect();
        TestCase::new(entries).sync_every_block(false)
    }

    fn empty_block(&self) -> TestCase {
        let block = Block::new(self.tip, self.height, vec![]);
        TestCase::rejected(Arc::new(block), Some(RejectResult::new(16, b"bad-blk".to_vec())))
    }

    fn transactions(&mut self) -> TestCase {
        let mut entries = Vec::new();
        for n in 0..self.transactions {
            let tx = Transaction::new(format!("payment {n}").into_bytes());
            self.mempool.push(tx.clone());
            entries.push(TestCaseEntry::new(tx, true));
        }

        let non_final = Transaction {
            lock_time: self.height + 100,
            ..Transaction::new(b"time-locked payment".to_vec())
        };
        entries.push(TestCaseEntry::new(non_final, Outcome::rejected(64, b"non-final".to_vec())));

        let oversized = Transaction::new(vec![0x55; self.max_tx_size + 1]);
        entries.push(TestCaseEntry::new(oversized, Outcome::Discarded));

        TestCase::new(entries).sync_every_tx(true)
    }

    /// Mine the accepted transactions; afterwards the mempools must agree.
    fn confirm(&mut self) -> TestCase {
        let mempool = std::mem::take(&mut self.mempool);
        let block = self.build_block(mempool);
        self.advance(&block);
        let trailing = Transaction::new(b"after confirmation".to_vec());
        TestCase::new(vec![
            TestCaseEntry::new(block, true),
            TestCaseEntry::new(trailing, Outcome::Unconstrained),
        ])
    }
}

impl Iterator for TestGenerator {
    type Item = TestCase;

    fn next(&mut self) -> Option<TestCase> {
        let (test, next) = match self.stage {
            Stage::Extend(done) if done < self.blocks => (self.extend(), Stage::Extend(done + 1)),
            Stage::Extend(_) | Stage::Batch => (self.batch(), Stage::EmptyBlock),
            Stage::EmptyBlock => (self.empty_block(), Stage::Transactions),
            Stage::Transactions => (self.transactions(), Stage::Confirm),
            Stage::Confirm => (self.confirm(), Stage::Done),
            Stage::Done => return None,
        };
        self.stage = next;
        Some(test)
    }
}
