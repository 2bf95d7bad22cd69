//! Expected results of submitting one object, and how each is judged against
//! what a peer observed.

use std::fmt;

use lockstep_common::{BlockHash, TxHash};

use crate::test_peer::PeerView;

/// A `reject` code plus reason. As an expectation the reason is a prefix;
/// as an observation it is the full reason the node sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectResult {
    pub code: u8,
    pub reason: Vec<u8>,
}

impl RejectResult {
    pub fn new(code: u8, reason: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Codes equal and `actual`'s reason starts with ours.
    pub fn matches(&self, actual: &RejectResult) -> bool {
        self.code == actual.code && actual.reason.starts_with(&self.reason)
    }
}

impl fmt::Display for RejectResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}:*", self.code)
        } else {
            write!(f, "{}:{}", self.code, String::from_utf8_lossy(&self.reason))
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Outcome {
    /// No fixed expectation; all peers must agree with the first one.
    #[default]
    Unconstrained,
    /// The object must (or must not) become the tip / enter the mempool.
    Accepted(bool),
    /// The object must be rejected with a matching code and reason prefix.
    Rejected(RejectResult),
    /// Transactions only: dropped without a reject and without being relayed.
    Discarded,
}

impl Outcome {
    pub fn rejected(code: u8, reason: impl Into<Vec<u8>>) -> Self {
        Outcome::Rejected(RejectResult::new(code, reason))
    }

    /// Only a positive expectation goes through the announce/request path;
    /// everything else is pushed directly.
    pub fn expects_acceptance(&self) -> bool {
        matches!(self, Outcome::Accepted(true))
    }

    /// Judge one peer's view of a block. `tip` is the hash the peer's best
    /// tip is compared with; `reference` is peer 0's view.
    pub fn evaluate_block(&self, tip: &BlockHash, view: &PeerView, reference: &PeerView) -> Verdict {
        match self {
            Outcome::Unconstrained => {
                if view.best_tip == reference.best_tip {
                    Verdict::Pass
                } else {
                    Verdict::Fail(format!(
                        "tip {} differs from first peer's {}",
                        display_tip(view.best_tip),
                        display_tip(reference.best_tip)
                    ))
                }
            }
            Outcome::Accepted(want) => {
                if (view.best_tip == Some(*tip)) == *want {
                    Verdict::Pass
                } else if *want {
                    Verdict::Fail(format!(
                        "tip is {} instead of expected {tip}",
                        display_tip(view.best_tip)
                    ))
                } else {
                    Verdict::Fail(format!("block {tip} became the tip"))
                }
            }
            Outcome::Rejected(expected) => {
                if view.best_tip == Some(*tip) {
                    return Verdict::Fail(format!("Block was not rejected: {tip}"));
                }
                match view.rejected_blocks.get(tip) {
                    None => Verdict::Pending(format!("Block not in reject map: {tip}")),
                    Some(actual) if !expected.matches(actual) => Verdict::Fail(format!(
                        "Block rejected with {actual} instead of expected {expected}: {tip}"
                    )),
                    Some(_) => Verdict::Pass,
                }
            }
            Outcome::Discarded => {
                Verdict::Fail(format!("discard outcome is only defined for transactions: {tip}"))
            }
        }
    }

    /// Judge one peer's view of a transaction after a mempool refresh.
    pub fn evaluate_tx(&self, hash: &TxHash, view: &PeerView, reference: &PeerView) -> Verdict {
        let announced = view.last_inv.contains(hash);
        match self {
            Outcome::Unconstrained => {
                if view.last_inv == reference.last_inv {
                    Verdict::Pass
                } else {
                    Verdict::Fail(format!(
                        "mempool of {} entries differs from first peer's {} entries",
                        view.last_inv.len(),
                        reference.last_inv.len()
                    ))
                }
            }
            Outcome::Accepted(want) => {
                if announced == *want {
                    Verdict::Pass
                } else if *want {
                    Verdict::Fail(format!("Tx not in mempool: {hash}"))
                } else {
                    Verdict::Fail(format!("Tx unexpectedly in mempool: {hash}"))
                }
            }
            Outcome::Rejected(expected) => {
                if announced {
                    return Verdict::Fail(format!("Tx was not rejected: {hash}"));
                }
                match view.rejected_txs.get(hash) {
                    None => Verdict::Fail(format!("Tx not in reject map: {hash}")),
                    Some(actual) if !expected.matches(actual) => Verdict::Fail(format!(
                        "Tx rejected with {actual} instead of expected {expected}: {hash}"
                    )),
                    Some(_) => Verdict::Pass,
                }
            }
            Outcome::Discarded => {
                if view.rejected_txs.contains_key(hash) {
                    Verdict::Fail(format!("Tx in reject map: {hash}"))
                } else if announced {
                    Verdict::Fail(format!("Tx was relayed: {hash}"))
                } else {
                    Verdict::Pass
                }
            }
        }
    }
}

impl From<bool> for Outcome {
    fn from(accepted: bool) -> Self {
        Outcome::Accepted(accepted)
    }
}

impl From<RejectResult> for Outcome {
    fn from(reject: RejectResult) -> Self {
        Outcome::Rejected(reject)
    }
}

impl From<Option<bool>> for Outcome {
    fn from(expectation: Option<bool>) -> Self {
        expectation.map_or(Outcome::Unconstrained, Outcome::Accepted)
    }
}

/// Result of judging one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Not satisfied yet, but the missing piece may still arrive.
    Pending(String),
    Fail(String),
}

fn display_tip(tip: Option<BlockHash>) -> String {
    tip.map_or_else(|| "<none>".to_string(), |hash| hash.to_string())
}
