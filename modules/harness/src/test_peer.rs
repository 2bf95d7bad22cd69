//! The harness side of one connection: answers the node's requests from the
//! object store and records everything needed to judge outcomes.
//!
//! A `TestPeer` is only touched by the orchestrator, which drains the
//! connection's inbound queue through [`TestPeer::process_events`]. No state
//! is shared between peers.

use std::{collections::HashMap, sync::Arc};

use lockstep_common::{
    BlockHash, BlockHeader, Hash, InvKind, Inventory, Message, PeerConnection, PeerEvent, Reject,
    RejectKind, TxHash, VersionInfo,
};
use lockstep_module_object_store::ObjectStore;
use tracing::{debug, trace};

use crate::{error::HarnessError, outcome::RejectResult};

/// What one node has shown us so far.
#[derive(Clone, Debug, Default)]
pub struct PeerView {
    /// Last header of the most recent non-empty `headers` message.
    pub best_tip: Option<BlockHash>,
    /// `true` once the node has asked for the block since it was (re)stored.
    pub requested_blocks: HashMap<BlockHash, bool>,
    pub requested_txs: HashMap<TxHash, bool>,
    pub rejected_blocks: HashMap<BlockHash, RejectResult>,
    pub rejected_txs: HashMap<TxHash, RejectResult>,
    /// Hashes from the most recent `inv`, replaced wholesale on each one.
    pub last_inv: Vec<Hash>,
    pub outstanding_ping: Option<u64>,
    pub verack_received: bool,
    pub connection_closed: bool,
}

impl PeerView {
    pub fn block_requested(&self, hash: &BlockHash) -> bool {
        self.requested_blocks.get(hash).copied().unwrap_or(false)
    }

    pub fn tx_requested(&self, hash: &TxHash) -> bool {
        self.requested_txs.get(hash).copied().unwrap_or(false)
    }

    pub fn received_ping_response(&self, nonce: u64) -> bool {
        self.outstanding_ping != Some(nonce)
    }
}

pub struct TestPeer {
    connection: PeerConnection,
    store: Arc<ObjectStore>,
    view: PeerView,
}

impl TestPeer {
    pub fn new(connection: PeerConnection, store: Arc<ObjectStore>) -> Self {
        Self {
            connection,
            store,
            view: PeerView::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.connection.address
    }

    pub fn view(&self) -> &PeerView {
        &self.view
    }

    pub(crate) fn view_mut(&mut self) -> &mut PeerView {
        &mut self.view
    }

    pub(crate) fn connection(&self) -> &PeerConnection {
        &self.connection
    }

    /// Apply every queued inbound event.
    pub fn process_events(&mut self) -> Result<(), HarnessError> {
        while let Some(event) = self.connection.try_recv() {
            self.handle_event(event)?;
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: PeerEvent) -> Result<(), HarnessError> {
        match event {
            PeerEvent::Closed => {
                debug!(peer = self.name(), "connection closed");
                self.view.connection_closed = true;
                Ok(())
            }
            // Once we have hung up, whatever the node still had queued is moot.
            PeerEvent::Message(_) | PeerEvent::Malformed { .. }
                if self.connection.is_disconnecting() =>
            {
                Ok(())
            }
            PeerEvent::Malformed { command, reason } => Err(HarnessError::ProtocolViolation {
                peer: self.name().to_string(),
                detail: format!("malformed {command} payload: {reason}"),
            }),
            PeerEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<(), HarnessError> {
        trace!(peer = self.name(), "received {message}");
        match message {
            Message::Version(_) => self.send(Message::Verack),
            Message::Verack => {
                self.view.verack_received = true;
                Ok(())
            }
            Message::Ping(nonce) => self.send(Message::Pong(nonce)),
            Message::Pong(nonce) => self.on_pong(nonce),
            Message::Headers(headers) => {
                self.on_headers(&headers);
                Ok(())
            }
            Message::GetHeaders { locator, stop } => self.on_get_headers(&locator, stop),
            Message::GetData(inventory) => self.on_get_data(&inventory),
            Message::Inv(inventory) => {
                self.view.last_inv = inventory.into_iter().map(|inv| inv.hash).collect();
                Ok(())
            }
            Message::Reject(reject) => {
                self.on_reject(reject);
                Ok(())
            }
            Message::NotFound(_)
            | Message::Block(_)
            | Message::Tx(_)
            | Message::Mempool => Ok(()),
        }
    }

    fn on_headers(&mut self, headers: &[BlockHeader]) {
        if let Some(best) = headers.last() {
            self.view.best_tip = Some(best.hash());
        }
    }

    fn on_get_headers(&self, locator: &[BlockHash], stop: BlockHash) -> Result<(), HarnessError> {
        match self.store.headers_for(locator, stop) {
            Some(headers) => self.send(Message::Headers(headers)),
            None => Ok(()),
        }
    }

    fn on_get_data(&mut self, inventory: &[Inventory]) -> Result<(), HarnessError> {
        for message in self.store.objects_for(inventory) {
            self.send(message)?;
        }
        // Record the request even if we could not serve it yet: the block may
        // only be added to the store later, and the node will not ask twice.
        for inv in inventory {
            match inv.kind {
                InvKind::Tx => self.view.requested_txs.insert(inv.hash, true),
                InvKind::Block => self.view.requested_blocks.insert(inv.hash, true),
            };
        }
        Ok(())
    }

    fn on_pong(&mut self, nonce: u64) -> Result<(), HarnessError> {
        if self.view.outstanding_ping == Some(nonce) {
            self.view.outstanding_ping = None;
            Ok(())
        } else {
            Err(HarnessError::ProtocolViolation {
                peer: self.name().to_string(),
                detail: format!("pong for unknown ping nonce {nonce}"),
            })
        }
    }

    fn on_reject(&mut self, reject: Reject) {
        let result = RejectResult::new(reject.code, reject.reason);
        match reject.message {
            RejectKind::Block => {
                debug!(peer = self.name(), hash = %reject.data, "block rejected with {result}");
                self.view.rejected_blocks.insert(reject.data, result);
            }
            RejectKind::Tx => {
                debug!(peer = self.name(), hash = %reject.data, "tx rejected with {result}");
                self.view.rejected_txs.insert(reject.data, result);
            }
            RejectKind::Other(command) => {
                debug!(peer = self.name(), "ignoring reject of {command} message");
            }
        }
    }

    pub fn send(&self, message: Message) -> Result<(), HarnessError> {
        trace!(peer = self.name(), "sending {message}");
        Ok(self.connection.send(message)?)
    }

    pub fn send_version(&self, version: VersionInfo) -> Result<(), HarnessError> {
        self.send(Message::Version(version))
    }

    pub fn send_inv(&self, inventory: Vec<Inventory>) -> Result<(), HarnessError> {
        self.send(Message::Inv(inventory))
    }

    pub fn send_header(&self, header: BlockHeader) -> Result<(), HarnessError> {
        self.send(Message::Headers(vec![header]))
    }

    /// Ask for headers from our last known tip of this node.
    pub fn send_getheaders(&self) -> Result<(), HarnessError> {
        let locator = self.store.locator_for(self.view.best_tip);
        self.send(Message::GetHeaders {
            locator,
            stop: Hash::ZERO,
        })
    }

    pub fn send_ping(&mut self, nonce: u64) -> Result<(), HarnessError> {
        if let Some(outstanding) = self.view.outstanding_ping {
            return Err(HarnessError::ProtocolViolation {
                peer: self.name().to_string(),
                detail: format!("ping {nonce} sent while {outstanding} is still outstanding"),
            });
        }
        self.view.outstanding_ping = Some(nonce);
        self.send(Message::Ping(nonce))
    }

    /// Request the node's mempool; the answer arrives as an `inv`.
    pub fn send_mempool(&mut self) -> Result<(), HarnessError> {
        self.view.last_inv.clear();
        self.send(Message::Mempool)
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_common::{Block, RemoteEnd, Transaction};

    fn peer() -> (TestPeer, RemoteEnd, Arc<ObjectStore>) {
        let store = Arc::new(ObjectStore::new());
        let (conn, remote) = PeerConnection::pair("node0");
        (TestPeer::new(conn, store.clone()), remote, store)
    }

    fn deliver(remote: &RemoteEnd, message: Message) {
        remote.events.send(PeerEvent::Message(message)).unwrap();
    }

    fn block(prev: BlockHash, n: u8) -> Arc<Block> {
        Arc::new(Block::new(prev, n as u32, vec![Transaction::new(vec![n])]))
    }

    #[test]
    fn headers_update_best_tip_only_when_non_empty() {
        let (mut peer, remote, _) = peer();
        let b = block(Hash::ZERO, 1);
        deliver(&remote, Message::Headers(vec![b.header.clone()]));
        deliver(&remote, Message::Headers(vec![]));
        peer.process_events().unwrap();
        assert_eq!(peer.view().best_tip, Some(b.hash()));
    }

    #[test]
    fn getdata_marks_requests_even_when_store_lacks_object() {
        let (mut peer, mut remote, store) = peer();
        let known = block(Hash::ZERO, 1);
        let unknown = block(known.hash(), 2);
        store.add_block(known.clone());

        deliver(
            &remote,
            Message::GetData(vec![Inventory::block(known.hash()), Inventory::block(unknown.hash())]),
        );
        peer.process_events().unwrap();

        assert!(peer.view().block_requested(&known.hash()));
        assert!(peer.view().block_requested(&unknown.hash()));
        assert_eq!(remote.commands.try_recv().ok(), Some(Message::Block(known)));
        assert!(remote.commands.try_recv().is_err());
    }

    #[test]
    fn getheaders_answered_from_store() {
        let (mut peer, mut remote, store) = peer();
        let first = block(Hash::ZERO, 1);
        let second = block(first.hash(), 2);
        store.add_block(first.clone());
        store.add_block(second.clone());

        deliver(
            &remote,
            Message::GetHeaders {
                locator: vec![first.hash()],
                stop: Hash::ZERO,
            },
        );
        peer.process_events().unwrap();
        assert_eq!(
            remote.commands.try_recv().ok(),
            Some(Message::Headers(vec![first.header.clone(), second.header.clone()]))
        );
    }

    #[test]
    fn getheaders_with_empty_store_is_silent() {
        let (mut peer, mut remote, _) = peer();
        deliver(
            &remote,
            Message::GetHeaders {
                locator: vec![],
                stop: Hash::ZERO,
            },
        );
        peer.process_events().unwrap();
        assert!(remote.commands.try_recv().is_err());
    }

    #[test]
    fn inv_replaces_previous_announcement() {
        let (mut peer, remote, _) = peer();
        let a = Hash::from([1u8; 32]);
        let b = Hash::from([2u8; 32]);
        deliver(&remote, Message::Inv(vec![Inventory::tx(a), Inventory::tx(b)]));
        deliver(&remote, Message::Inv(vec![Inventory::tx(b)]));
        peer.process_events().unwrap();
        assert_eq!(peer.view().last_inv, vec![b]);
    }

    #[test]
    fn matching_pong_clears_outstanding_ping() {
        let (mut peer, remote, _) = peer();
        peer.send_ping(7).unwrap();
        assert!(!peer.view().received_ping_response(7));
        deliver(&remote, Message::Pong(7));
        peer.process_events().unwrap();
        assert!(peer.view().received_ping_response(7));
    }

    #[test]
    fn unknown_pong_is_a_protocol_violation() {
        let (mut peer, remote, _) = peer();
        peer.send_ping(7).unwrap();
        deliver(&remote, Message::Pong(8));
        let err = peer.process_events().unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation { .. }));
    }

    #[test]
    fn malformed_payload_is_a_protocol_violation() {
        let (mut peer, remote, _) = peer();
        remote
            .events
            .send(PeerEvent::Malformed {
                command: "headers".to_string(),
                reason: "empty payload".to_string(),
            })
            .unwrap();
        assert!(matches!(
            peer.process_events(),
            Err(HarnessError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn rejects_are_recorded_by_kind() {
        let (mut peer, remote, _) = peer();
        let hash = Hash::from([5u8; 32]);
        deliver(
            &remote,
            Message::Reject(Reject {
                message: RejectKind::Tx,
                code: 64,
                reason: b"non-final".to_vec(),
                data: hash,
            }),
        );
        deliver(
            &remote,
            Message::Reject(Reject {
                message: RejectKind::Other("version".to_string()),
                code: 17,
                reason: b"obsolete".to_vec(),
                data: Hash::ZERO,
            }),
        );
        peer.process_events().unwrap();
        assert_eq!(
            peer.view().rejected_txs.get(&hash),
            Some(&RejectResult::new(64, b"non-final".to_vec()))
        );
        assert!(peer.view().rejected_blocks.is_empty());
    }

    #[test]
    fn version_and_ping_from_node_are_answered() {
        let (mut peer, mut remote, _) = peer();
        deliver(
            &remote,
            Message::Version(VersionInfo {
                protocol_version: 70015,
                user_agent: "/node/".to_string(),
                start_height: 0,
                nonce: 1,
            }),
        );
        deliver(&remote, Message::Ping(99));
        deliver(&remote, Message::Verack);
        peer.process_events().unwrap();
        assert_eq!(remote.commands.try_recv().ok(), Some(Message::Verack));
        assert_eq!(remote.commands.try_recv().ok(), Some(Message::Pong(99)));
        assert!(peer.view().verack_received);
    }

    #[test]
    fn close_is_recorded() {
        let (mut peer, remote, _) = peer();
        drop(remote);
        peer.process_events().unwrap();
        assert!(peer.view().connection_closed);
    }

    #[test]
    fn mempool_request_clears_last_inv() {
        let (mut peer, mut remote, _) = peer();
        peer.view_mut().last_inv = vec![Hash::from([1u8; 32])];
        peer.send_mempool().unwrap();
        assert!(peer.view().last_inv.is_empty());
        assert_eq!(remote.commands.try_recv().ok(), Some(Message::Mempool));
    }
}
