use std::sync::Arc;

use dashmap::DashMap;
use lockstep_common::{InvKind, Inventory, Message, Transaction, TxHash};

/// Transactions announced by the harness, keyed by hash.
#[derive(Default)]
pub struct TxStore {
    transactions: DashMap<TxHash, Arc<Transaction>>,
}

impl TxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&self, tx: Arc<Transaction>) {
        self.transactions.insert(tx.hash(), tx);
    }

    pub fn get_transaction(&self, hash: &TxHash) -> Option<Arc<Transaction>> {
        self.transactions.get(hash).map(|tx| tx.value().clone())
    }

    /// `tx` messages for every requested transaction we hold.
    pub fn transactions_for(&self, inventory: &[Inventory]) -> Vec<Message> {
        inventory
            .iter()
            .filter(|inv| inv.kind == InvKind::Tx)
            .filter_map(|inv| self.get_transaction(&inv.hash))
            .map(Message::Tx)
            .collect()
    }

    pub fn clear(&self) {
        self.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_only_known_transactions() {
        let store = TxStore::new();
        let known = Arc::new(Transaction::new(b"known".to_vec()));
        let unknown = Transaction::new(b"unknown".to_vec());
        store.add_transaction(known.clone());

        let inv = [
            Inventory::tx(known.hash()),
            Inventory::tx(unknown.hash()),
            Inventory::block(known.hash()),
        ];
        assert_eq!(store.transactions_for(&inv), vec![Message::Tx(known)]);
        assert!(store.get_transaction(&unknown.hash()).is_none());
    }
}
