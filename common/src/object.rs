//! Protocol objects relayed between peers: headers, blocks and transactions.

use crate::hash::{BlockHash, Hash, TxHash};

/// Block header: the metadata needed to extend a chain of headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: BlockHash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Canonical 80-byte little-endian serialisation.
    pub fn serialise(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(80);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(self.prev_block.as_ref());
        out.extend_from_slice(self.merkle_root.as_ref());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> BlockHash {
        Hash::sha256d(&self.serialise())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub lock_time: u32,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            version: 1,
            lock_time: 0,
            payload: payload.into(),
        }
    }

    pub fn serialise(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.payload.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn hash(&self) -> TxHash {
        Hash::sha256d(&self.serialise())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block on top of `prev_block`, committing to `transactions`.
    pub fn new(prev_block: BlockHash, time: u32, transactions: Vec<Transaction>) -> Self {
        let merkle_root = merkle_root(&transactions);
        Self {
            header: BlockHeader {
                version: 1,
                prev_block,
                merkle_root,
                time,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn prev_block(&self) -> BlockHash {
        self.header.prev_block
    }
}

/// Merkle root over the transaction hashes, duplicating the last entry of odd
/// levels. An empty list commits to the zero hash.
pub fn merkle_root(transactions: &[Transaction]) -> Hash {
    let mut level: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
    if level.is_empty() {
        return Hash::ZERO;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut joined = Vec::with_capacity(64);
                joined.extend_from_slice(pair[0].as_ref());
                joined.extend_from_slice(right.as_ref());
                Hash::sha256d(&joined)
            })
            .collect();
    }
    level[0]
}
