use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{fmt, ops::Deref, str::FromStr};

/// 32-byte content hash identifying a header, block or transaction.
///
/// Objects are identified by the double SHA-256 of their canonical
/// serialisation. The textual form follows the gossip protocol convention of
/// printing the digest in reversed byte order, so a hash shown in logs matches
/// what a node reports through its own tooling.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

/// Hash of a block (identical to the hash of its header).
pub type BlockHash = Hash;

/// Hash of a transaction.
pub type TxHash = Hash;

impl Hash {
    /// The all-zero hash, used as the parent of a genesis header and as the
    /// "no stop" marker in `getheaders`.
    pub const ZERO: Hash = Hash([0u8; 32]);

    #[inline]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Double SHA-256 of `data`.
    pub fn sha256d(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        Self(second.into())
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    #[inline]
    pub fn into_inner(self) -> [u8; 32] {
        self.0
    }

    fn reversed(&self) -> [u8; 32] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl From<[u8; 32]> for Hash {
    #[inline]
    fn from(bytes: [u8; 32]) -> Self {
        Self::new(bytes)
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let hash: [u8; 32] = value.try_into()?;
        Ok(Self::new(hash))
    }
}

impl AsRef<[u8]> for Hash {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Hash {
    type Target = [u8; 32];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&hex::encode(self.reversed())).finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.reversed()))
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    /// Parses the reversed-byte-order hex form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Self::new(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
