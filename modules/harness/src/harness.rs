//! Lockstep comparison harness module.
//!
//! Feeds N nodes the same ordered stream of headers, blocks and transactions
//! over their peer connections and checks that they all end up agreeing, or
//! that each object meets its declared [`Outcome`].
//!
//! The orchestrator is the only owner of every per-peer view. Inbound traffic
//! is queued per connection and applied whenever the orchestrator polls, so no
//! state is shared between peers and no lock is held across a send or a wait.

mod configuration;
mod error;
mod outcome;
mod sync;
mod test_case;
mod test_peer;

use std::sync::Arc;

use lockstep_common::{Block, Inventory, Message, PeerConnection, Transaction, VersionInfo};
use lockstep_module_object_store::ObjectStore;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub use crate::{
    configuration::HarnessConfig,
    error::HarnessError,
    outcome::{Outcome, RejectResult, Verdict},
    test_case::{TestCase, TestCaseEntry, TestObject},
    test_peer::{PeerView, TestPeer},
};

/// Protocol version advertised in our `version` message.
pub const PROTOCOL_VERSION: u32 = 70_015;

const USER_AGENT: &str = concat!("/lockstep:", env!("CARGO_PKG_VERSION"), "/");

/// Summary of a run in which every test case passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub tests_passed: usize,
}

pub struct Harness {
    config: HarnessConfig,
    store: Arc<ObjectStore>,
    peers: Vec<TestPeer>,
    next_ping_nonce: u64,
}

impl Harness {
    pub fn new(config: HarnessConfig, connections: impl IntoIterator<Item = PeerConnection>) -> Self {
        let store = Arc::new(ObjectStore::new());
        let peers = connections
            .into_iter()
            .map(|connection| TestPeer::new(connection, store.clone()))
            .collect();
        Self {
            config,
            store,
            peers,
            next_ping_nonce: 1,
        }
    }

    pub fn peers(&self) -> &[TestPeer] {
        &self.peers
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Drop the current peers and adopt a fresh set of connections. The next
    /// [`run`](Self::run) performs the handshake with them.
    pub fn restart_network(&mut self, connections: impl IntoIterator<Item = PeerConnection>) {
        for peer in &mut self.peers {
            peer.disconnect();
        }
        self.peers = connections
            .into_iter()
            .map(|connection| TestPeer::new(connection, self.store.clone()))
            .collect();
        info!(peers = self.peers.len(), "network restarted");
    }

    /// Run every test case in order, stopping at the first failure, then
    /// tear down all connections. The first failure is what gets reported,
    /// even if teardown fails as well.
    pub async fn run(
        &mut self,
        tests: impl IntoIterator<Item = TestCase>,
    ) -> Result<RunReport, HarnessError> {
        let result = self.run_tests(tests).await;
        let teardown = self.shutdown().await;
        match (result, teardown) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), teardown) => {
                if let Err(teardown) = teardown {
                    warn!("teardown after failed run: {teardown}");
                }
                Err(e)
            }
        }
    }

    async fn run_tests(
        &mut self,
        tests: impl IntoIterator<Item = TestCase>,
    ) -> Result<RunReport, HarnessError> {
        self.handshake().await?;

        let mut tests_passed = 0;
        for (index, test) in (1..).zip(tests) {
            let span = info_span!("harness.test", index);
            if let Err(e) = self.run_test_case(&test).instrument(span).await {
                error!("Test {index}: FAIL: {e}");
                return Err(HarnessError::TestFailed {
                    index,
                    source: Box::new(e),
                });
            }
            info!("Test {index}: PASS");
            tests_passed += 1;
        }
        Ok(RunReport { tests_passed })
    }

    async fn handshake(&mut self) -> Result<(), HarnessError> {
        let version = VersionInfo {
            protocol_version: PROTOCOL_VERSION,
            user_agent: USER_AGENT.to_string(),
            start_height: 0,
            nonce: rand::random(),
        };
        for peer in &self.peers {
            peer.send_version(version.clone())?;
        }
        self.wait_until("verack received", self.config.verack_timeout(), |peers| {
            peers.iter().all(|peer| peer.view().verack_received)
        })
        .await?;
        debug!(peers = self.peers.len(), "handshake complete");
        Ok(())
    }

    async fn run_test_case(&mut self, test: &TestCase) -> Result<(), HarnessError> {
        let mut pending_inv: Vec<Inventory> = Vec::new();
        let mut last_block = None;
        let mut last_tx = None;

        for entry in test.entries() {
            match entry.object() {
                TestObject::Header(header) => {
                    self.store.add_header(header.clone());
                    for peer in &self.peers {
                        peer.send_header(header.clone())?;
                    }
                }

                TestObject::Block(block) => {
                    let hash = block.hash();
                    let tip = entry.expected_tip().unwrap_or(hash);
                    self.store_block(block.clone())?;

                    if test.syncs_every_block() {
                        if entry.outcome().expects_acceptance() {
                            self.broadcast_inv(vec![Inventory::block(hash)])?;
                            self.sync_blocks(
                                hash,
                                1,
                                test.block_sync_timeout(),
                                test.block_request_timeout(),
                            )
                            .await?;
                        } else {
                            // Pushed as-is, without an inv/getdata round trip.
                            self.broadcast(Message::Block(block.clone()))?;
                            self.ping_barrier(self.config.ping_timeout()).await?;
                        }
                        self.check_block_outcome(&tip, entry.outcome()).await?;
                    } else {
                        pending_inv.push(Inventory::block(hash));
                        last_block = Some((hash, tip, entry.outcome()));
                    }
                }

                TestObject::Transaction(tx) => {
                    let hash = tx.hash();
                    self.store_transaction(tx.clone())?;

                    if test.syncs_every_tx() {
                        self.broadcast_inv(vec![Inventory::tx(hash)])?;
                        self.sync_transaction(hash, 1).await?;
                        self.check_mempool(&hash, entry.outcome())?;
                    } else {
                        pending_inv.push(Inventory::tx(hash));
                        last_tx = Some((hash, entry.outcome()));
                    }
                }
            }

            if pending_inv.len() >= self.config.max_inv_elements {
                self.broadcast_inv(std::mem::take(&mut pending_inv))?;
            }
        }

        if !pending_inv.is_empty() {
            self.broadcast_inv(pending_inv)?;
        }

        if let Some((hash, tip, outcome)) = last_block {
            self.sync_blocks(
                hash,
                test.len(),
                test.block_sync_timeout(),
                test.block_request_timeout(),
            )
            .await?;
            self.check_block_outcome(&tip, outcome).await?;
        }
        if let Some((hash, outcome)) = last_tx {
            self.sync_transaction(hash, test.len()).await?;
            self.check_mempool(&hash, outcome)?;
        }
        Ok(())
    }

    /// Add `block` to the store. A node that asked for this hash before we
    /// had it will not ask again, so hand it over now; everyone else gets
    /// their request flag reset so the next request can be told apart.
    fn store_block(&mut self, block: Arc<Block>) -> Result<(), HarnessError> {
        self.process_all_events()?;

        let hash = block.hash();
        let first = self.store.add_block(block.clone());
        for peer in &mut self.peers {
            if first && peer.view().block_requested(&hash) {
                debug!(peer = peer.name(), %hash, "delivering block requested earlier");
                peer.send(Message::Block(block.clone()))?;
            } else {
                peer.view_mut().requested_blocks.insert(hash, false);
            }
        }
        Ok(())
    }

    /// Add `tx` to the store and reset every peer's request flag, after
    /// applying any request that was already queued.
    fn store_transaction(&mut self, tx: Arc<Transaction>) -> Result<(), HarnessError> {
        self.process_all_events()?;

        let hash = tx.hash();
        self.store.add_transaction(tx);
        for peer in &mut self.peers {
            peer.view_mut().requested_txs.insert(hash, false);
        }
        Ok(())
    }

    fn broadcast(&self, message: Message) -> Result<(), HarnessError> {
        for peer in &self.peers {
            peer.send(message.clone())?;
        }
        Ok(())
    }

    fn broadcast_inv(&self, inventory: Vec<Inventory>) -> Result<(), HarnessError> {
        debug!(items = inventory.len(), "announcing inventory");
        for peer in &self.peers {
            peer.send_inv(inventory.clone())?;
        }
        Ok(())
    }

    fn process_all_events(&mut self) -> Result<(), HarnessError> {
        for peer in &mut self.peers {
            peer.process_events()?;
        }
        Ok(())
    }

    /// Disconnect every peer and wait for each to report closed, then
    /// release the store.
    pub async fn shutdown(&mut self) -> Result<(), HarnessError> {
        for peer in &mut self.peers {
            peer.disconnect();
        }
        let closed = self
            .wait_until("connections closed", self.config.disconnect_timeout(), |peers| {
                peers.iter().all(|peer| peer.view().connection_closed)
            })
            .await;
        self.store.clear();
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_common::{BlockHash, Hash, PeerEvent, RemoteEnd};

    fn harness_with_remote() -> (Harness, RemoteEnd) {
        let (connection, remote) = PeerConnection::pair("scripted");
        (Harness::new(HarnessConfig::default(), [connection]), remote)
    }

    fn block(prev: BlockHash) -> Arc<Block> {
        Arc::new(Block::new(prev, 1, vec![Transaction::new(b"coinbase".to_vec())]))
    }

    #[test]
    fn earlier_request_is_answered_when_block_arrives() {
        let (mut harness, mut remote) = harness_with_remote();
        let block = block(Hash::ZERO);
        remote
            .events
            .send(PeerEvent::Message(Message::GetData(vec![Inventory::block(block.hash())])))
            .unwrap();

        harness.store_block(block.clone()).unwrap();
        assert_eq!(remote.commands.try_recv().ok(), Some(Message::Block(block)));
    }

    #[test]
    fn resubmitting_block_does_not_push_again() {
        let (mut harness, mut remote) = harness_with_remote();
        let block = block(Hash::ZERO);

        harness.store_block(block.clone()).unwrap();
        harness.store_block(block.clone()).unwrap();

        assert!(remote.commands.try_recv().is_err());
        assert!(!harness.peers()[0].view().block_requested(&block.hash()));
    }

    #[test]
    fn resubmitting_requested_block_resets_request_flag() {
        let (mut harness, mut remote) = harness_with_remote();
        let block = block(Hash::ZERO);
        harness.store_block(block.clone()).unwrap();
        remote
            .events
            .send(PeerEvent::Message(Message::GetData(vec![Inventory::block(block.hash())])))
            .unwrap();
        harness.process_all_events().unwrap();
        assert_eq!(remote.commands.try_recv().ok(), Some(Message::Block(block.clone())));

        harness.store_block(block.clone()).unwrap();
        assert!(remote.commands.try_recv().is_err());
        assert!(!harness.peers()[0].view().block_requested(&block.hash()));
    }

    #[test]
    fn queued_tx_request_is_applied_before_reset() {
        let (mut harness, remote) = harness_with_remote();
        let tx = Arc::new(Transaction::new(b"payment".to_vec()));
        remote
            .events
            .send(PeerEvent::Message(Message::GetData(vec![Inventory::tx(tx.hash())])))
            .unwrap();

        harness.store_transaction(tx.clone()).unwrap();
        harness.process_all_events().unwrap();
        assert!(!harness.peers()[0].view().tx_requested(&tx.hash()));
    }

    #[test]
    fn ping_nonces_increase_across_barriers() {
        let (mut harness, _remote) = harness_with_remote();
        assert_eq!(harness.next_nonce(), 1);
        assert_eq!(harness.next_nonce(), 2);
        assert_eq!(harness.next_nonce(), 3);
    }

    #[tokio::test]
    async fn run_with_no_peers_passes_trivially() {
        let mut harness = Harness::new(HarnessConfig::default(), Vec::<PeerConnection>::new());
        let report = harness
            .run([TestCase::accepted(block(Hash::ZERO))])
            .await
            .unwrap();
        assert_eq!(report.tests_passed, 1);
    }
}
