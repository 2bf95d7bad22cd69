//! Failure taxonomy. Every variant is fatal for the run; the only retrying
//! happens inside the block reject check before an `OutcomeMismatch` is
//! produced.

use std::time::Duration;

use lockstep_common::ConnectionError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The node sent something the harness cannot reconcile (unknown pong
    /// nonce, undecodable payload).
    #[error("protocol violation from {peer}: {detail}")]
    ProtocolViolation { peer: String, detail: String },

    #[error("timed out after {timeout:?} waiting for {predicate}")]
    SyncTimeout {
        predicate: &'static str,
        timeout: Duration,
    },

    #[error("outcome mismatch: {0}")]
    OutcomeMismatch(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("node controller for {peer} failed: {detail}")]
    Controller { peer: String, detail: String },

    /// Wraps any of the above with the 1-based index of the failing test case.
    #[error("test {index} failed: {source}")]
    TestFailed {
        index: usize,
        #[source]
        source: Box<HarnessError>,
    },
}

impl HarnessError {
    /// The underlying cause, looking through `TestFailed`.
    pub fn cause(&self) -> &HarnessError {
        match self {
            HarnessError::TestFailed { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Index of the failing test case, if the error came from one.
    pub fn test_index(&self) -> Option<usize> {
        match self {
            HarnessError::TestFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}
