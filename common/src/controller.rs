use async_trait::async_trait;

/// Control-plane access to a node under test.
///
/// Pongs only prove that a node has read everything sent before the ping;
/// validation can still be running asynchronously behind them. Nodes that can
/// report their in-flight block/transaction work implement this so the
/// harness can wait for it to drain. Connections without a controller skip
/// that part of the barrier.
#[async_trait]
pub trait NodeController: Send + Sync {
    /// Number of blocks and transactions still being processed.
    async fn pending_work_count(&self) -> anyhow::Result<u64>;
}
