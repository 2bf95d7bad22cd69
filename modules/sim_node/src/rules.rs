//! Context-free admission rules for blocks and transactions.

use lockstep_common::{Block, Transaction};

/// What a node does with an object after checking it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Refuse it and tell the sender with a `reject` message.
    Reject { code: u8, reason: String },
    /// Drop it without telling anyone.
    Ignore,
}

impl Admission {
    pub fn reject(code: u8, reason: impl Into<String>) -> Self {
        Admission::Reject {
            code,
            reason: reason.into(),
        }
    }
}

/// Reject codes as carried in the `reject` message.
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_NONSTANDARD: u8 = 0x40;

pub trait ValidationRules: Send + Sync + 'static {
    /// Checks that need nothing but the block itself. Chain context (parent
    /// known, parent valid) is the node's business.
    fn check_block(&self, block: &Block) -> Admission;

    fn check_tx(&self, tx: &Transaction) -> Admission;
}

#[derive(Clone, Debug)]
pub struct DefaultRules {
    /// Transactions with a larger payload are dropped without a reject.
    pub max_tx_size: usize,
}

impl Default for DefaultRules {
    fn default() -> Self {
        Self { max_tx_size: 100_000 }
    }
}

impl ValidationRules for DefaultRules {
    fn check_block(&self, block: &Block) -> Admission {
        if block.transactions.is_empty() {
            return Admission::reject(REJECT_INVALID, "bad-blk-length");
        }
        for tx in &block.transactions {
            if tx.payload.is_empty() {
                return Admission::reject(REJECT_INVALID, "bad-txns-vout-empty");
            }
            if tx.lock_time != 0 {
                return Admission::reject(REJECT_INVALID, "bad-txns-nonfinal");
            }
        }
        Admission::Accept
    }

    fn check_tx(&self, tx: &Transaction) -> Admission {
        if tx.payload.is_empty() {
            Admission::reject(REJECT_INVALID, "bad-txns-vout-empty")
        } else if tx.lock_time != 0 {
            Admission::reject(REJECT_NONSTANDARD, "non-final")
        } else if tx.payload.len() > self.max_tx_size {
            Admission::Ignore
        } else {
            Admission::Accept
        }
    }
}
