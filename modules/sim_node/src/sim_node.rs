//! Lockstep simulated node module.
//!
//! A small in-process node that speaks the gossip protocol over the channel
//! pair of a [`PeerConnection`]. It keeps a block tree and a mempool, runs
//! blocks and transactions through pluggable [`ValidationRules`], and exposes
//! its in-flight work through [`NodeController`] so the harness idle check has
//! something real to wait on.

mod chain;
mod rules;

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use lockstep_common::{
    Block, BlockHash, BlockHeader, Hash, InvKind, Inventory, Message, NodeController,
    PeerConnection, PeerEvent, Reject, RejectKind, Transaction, TxHash, VersionInfo,
};
use tokio::{
    select,
    sync::{mpsc, watch},
    time::sleep,
};
use tracing::{debug, info, trace, warn};

pub use crate::{
    chain::{BlockEvent, Chain},
    rules::{Admission, DefaultRules, REJECT_INVALID, REJECT_NONSTANDARD, ValidationRules},
};

const PROTOCOL_VERSION: u32 = 70_015;

#[derive(Clone, Debug)]
pub struct SimNodeOptions {
    /// Hold every received block this long before validating it.
    pub validation_delay: Option<Duration>,
    pub user_agent: String,
}

impl Default for SimNodeOptions {
    fn default() -> Self {
        Self {
            validation_delay: None,
            user_agent: "/lockstep-sim:0.1.0/".to_string(),
        }
    }
}

/// Observation and control-plane access to a running node.
pub struct SimNodeHandle {
    name: String,
    pending: AtomicU64,
    tip: watch::Sender<Option<BlockHash>>,
    received: DashMap<&'static str, u64>,
}

impl SimNodeHandle {
    fn new(name: String) -> Self {
        let (tip, _) = watch::channel(None);
        Self {
            name,
            pending: AtomicU64::new(0),
            tip,
            received: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tip(&self) -> Option<BlockHash> {
        *self.tip.borrow()
    }

    pub fn subscribe_tip(&self) -> watch::Receiver<Option<BlockHash>> {
        self.tip.subscribe()
    }

    /// How many messages with this command the node has received.
    pub fn received(&self, command: &str) -> u64 {
        self.received.get(command).map_or(0, |count| *count)
    }

    pub fn pending_work(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    fn record(&self, command: &'static str) {
        *self.received.entry(command).or_default() += 1;
    }
}

#[async_trait]
impl NodeController for SimNodeHandle {
    async fn pending_work_count(&self) -> Result<u64> {
        Ok(self.pending_work())
    }
}

pub struct SimNode;

impl SimNode {
    /// Start a node task and return the harness side of its connection, with
    /// the node's handle already attached as its controller.
    pub fn spawn(
        name: impl Into<String>,
        rules: impl ValidationRules,
        options: SimNodeOptions,
    ) -> (PeerConnection, Arc<SimNodeHandle>) {
        let name = name.into();
        let (connection, remote) = PeerConnection::pair(name.clone());
        let handle = Arc::new(SimNodeHandle::new(name.clone()));

        let worker = NodeWorker {
            name,
            rules: Box::new(rules),
            options,
            chain: Chain::new(),
            mempool: BTreeMap::new(),
            seen_txs: HashSet::new(),
            in_flight: HashSet::new(),
            handle: handle.clone(),
            events: remote.events,
        };
        tokio::spawn(worker.run(remote.commands));

        (connection.with_controller(handle.clone()), handle)
    }
}

struct NodeWorker {
    name: String,
    rules: Box<dyn ValidationRules>,
    options: SimNodeOptions,
    chain: Chain,
    mempool: BTreeMap<TxHash, Arc<Transaction>>,
    /// Every transaction processed, whatever the verdict.
    seen_txs: HashSet<TxHash>,
    /// Hashes we have sent `getdata` for and not yet received.
    in_flight: HashSet<Hash>,
    handle: Arc<SimNodeHandle>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl NodeWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Message>) {
        info!(node = self.name, "started");
        let (deferred_tx, mut deferred_rx) = mpsc::unbounded_channel::<Arc<Block>>();

        loop {
            let result = select! {
                message = commands.recv() => match message {
                    Some(message) => self.handle_message(message, &deferred_tx),
                    None => break,
                },
                Some(block) = deferred_rx.recv() => {
                    let result = self.process_block(block);
                    self.handle.pending.fetch_sub(1, Ordering::SeqCst);
                    result
                }
            };
            if let Err(e) = result {
                warn!(node = self.name, "{e:#}");
                break;
            }
        }

        let _ = self.events.send(PeerEvent::Closed);
        info!(node = self.name, "stopped");
    }

    fn send(&self, message: Message) -> Result<()> {
        trace!(node = self.name, "sending {message}");
        if self.events.send(PeerEvent::Message(message)).is_err() {
            bail!("harness side of the connection is gone");
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        message: Message,
        deferred: &mpsc::UnboundedSender<Arc<Block>>,
    ) -> Result<()> {
        self.handle.record(message.command());
        trace!(node = self.name, "received {message}");

        match message {
            Message::Version(version) => {
                debug!(node = self.name, agent = version.user_agent, "peer version");
                self.send(Message::Version(VersionInfo {
                    protocol_version: PROTOCOL_VERSION,
                    user_agent: self.options.user_agent.clone(),
                    start_height: start_height(self.chain.height()),
                    nonce: 0,
                }))?;
                self.send(Message::Verack)
            }
            Message::Ping(nonce) => self.send(Message::Pong(nonce)),
            Message::Verack | Message::Pong(_) => Ok(()),
            Message::Inv(inventory) => self.on_inv(&inventory),
            Message::GetData(inventory) => self.on_get_data(&inventory),
            Message::NotFound(inventory) => {
                for inv in inventory {
                    self.in_flight.remove(&inv.hash);
                }
                Ok(())
            }
            Message::GetHeaders { locator, stop } => {
                let headers = self.chain.headers_after(&locator, stop);
                self.send(Message::Headers(headers))
            }
            Message::Headers(headers) => self.on_headers(headers),
            Message::Block(block) => {
                self.in_flight.remove(&block.hash());
                self.handle.pending.fetch_add(1, Ordering::SeqCst);
                match self.options.validation_delay {
                    Some(delay) => {
                        let deferred = deferred.clone();
                        tokio::spawn(async move {
                            sleep(delay).await;
                            let _ = deferred.send(block);
                        });
                        Ok(())
                    }
                    None => {
                        let result = self.process_block(block);
                        self.handle.pending.fetch_sub(1, Ordering::SeqCst);
                        result
                    }
                }
            }
            Message::Tx(tx) => {
                self.in_flight.remove(&tx.hash());
                self.process_tx(tx)
            }
            Message::Mempool => {
                if self.mempool.is_empty() {
                    return Ok(());
                }
                let inventory = self.mempool.keys().copied().map(Inventory::tx).collect();
                self.send(Message::Inv(inventory))
            }
            Message::Reject(reject) => {
                debug!(node = self.name, "peer rejected our {:?}", reject.message);
                Ok(())
            }
        }
    }

    fn knows(&self, inv: &Inventory) -> bool {
        match inv.kind {
            InvKind::Block => self.chain.knows_block(&inv.hash),
            InvKind::Tx => self.seen_txs.contains(&inv.hash),
        }
    }

    /// Request every announced object we neither have nor already asked for.
    fn on_inv(&mut self, inventory: &[Inventory]) -> Result<()> {
        let wanted: Vec<Inventory> = inventory
            .iter()
            .filter(|inv| !self.knows(inv))
            .copied()
            .collect();
        self.request(wanted)
    }

    fn on_headers(&mut self, headers: Vec<BlockHeader>) -> Result<()> {
        let mut wanted = Vec::new();
        for header in headers {
            let hash = self.chain.add_header(header);
            if !self.chain.knows_block(&hash) {
                wanted.push(Inventory::block(hash));
            }
        }
        self.request(wanted)
    }

    fn request(&mut self, wanted: Vec<Inventory>) -> Result<()> {
        let wanted: Vec<Inventory> = wanted
            .into_iter()
            .filter(|inv| self.in_flight.insert(inv.hash))
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }
        self.send(Message::GetData(wanted))
    }

    fn on_get_data(&self, inventory: &[Inventory]) -> Result<()> {
        let mut missing = Vec::new();
        for inv in inventory {
            let found = match inv.kind {
                InvKind::Block => self.chain.get_block(&inv.hash).map(Message::Block),
                InvKind::Tx => self.mempool.get(&inv.hash).cloned().map(Message::Tx),
            };
            match found {
                Some(message) => self.send(message)?,
                None => missing.push(*inv),
            }
        }
        if !missing.is_empty() {
            self.send(Message::NotFound(missing))?;
        }
        Ok(())
    }

    fn process_block(&mut self, block: Arc<Block>) -> Result<()> {
        for event in self.chain.submit_block(block, self.rules.as_ref()) {
            match event {
                BlockEvent::Connected { hash, height } => {
                    debug!(node = self.name, %hash, height, "block connected");
                    if let Some(block) = self.chain.get_block(&hash) {
                        for tx in &block.transactions {
                            let txid = tx.hash();
                            self.mempool.remove(&txid);
                            self.seen_txs.insert(txid);
                        }
                    }
                }
                BlockEvent::Orphaned(hash) => debug!(node = self.name, %hash, "block orphaned"),
                BlockEvent::Ignored(hash) => debug!(node = self.name, %hash, "block ignored"),
                BlockEvent::Rejected { hash, code, reason } => {
                    info!(node = self.name, %hash, code, reason, "block rejected");
                    self.send(Message::Reject(Reject {
                        message: RejectKind::Block,
                        code,
                        reason: reason.into_bytes(),
                        data: hash,
                    }))?;
                }
            }
        }

        let tip = self.chain.tip();
        if self.handle.tip() != tip {
            self.handle.tip.send_replace(tip);
        }
        Ok(())
    }

    fn process_tx(&mut self, tx: Arc<Transaction>) -> Result<()> {
        let hash = tx.hash();
        if !self.seen_txs.insert(hash) {
            return Ok(());
        }
        match self.rules.check_tx(&tx) {
            Admission::Accept => {
                debug!(node = self.name, %hash, "tx accepted to mempool");
                self.mempool.insert(hash, tx);
                Ok(())
            }
            Admission::Ignore => {
                debug!(node = self.name, %hash, "tx ignored");
                Ok(())
            }
            Admission::Reject { code, reason } => {
                info!(node = self.name, %hash, code, reason, "tx rejected");
                self.send(Message::Reject(Reject {
                    message: RejectKind::Tx,
                    code,
                    reason: reason.into_bytes(),
                    data: hash,
                }))
            }
        }
    }
}

/// Number of blocks on the active chain, as advertised in `version`.
fn start_height(tip_height: Option<u64>) -> u32 {
    tip_height.map_or(0, |h| u32::try_from(h.saturating_add(1)).unwrap_or(u32::MAX))
}
