//! Core protocol types: transactions, block headers, outpoints, block stamps.
//!
//! All monetary values are in atoms (1 coin = 10^8 atoms).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::script::Script;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3) and block header hashes (double SHA-256).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a hash from a byte slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    /// Encoded size of an outpoint key: txid || index(BE).
    pub const KEY_LEN: usize = 36;

    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }

    /// Fixed-width key encoding that sorts by txid, then output index.
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..32].copy_from_slice(self.txid.as_bytes());
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }

    /// Decode an outpoint from the first [`KEY_LEN`](Self::KEY_LEN) bytes of `key`.
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() < Self::KEY_LEN {
            return None;
        }
        let txid = Hash256::from_slice(&key[..32])?;
        let index = u32::from_be_bytes(key[32..36].try_into().ok()?);
        Some(Self { txid, index })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking script. Carries the height marker for coinbase inputs.
    pub signature_script: Vec<u8>,
    /// Segregated witness stack. Excluded from the txid.
    pub witness: Vec<Vec<u8>>,
    /// Input sequence number.
    pub sequence: u32,
}

impl TxInput {
    /// An unsigned input spending `previous_output`.
    pub fn unsigned(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            signature_script: Vec::new(),
            witness: Vec::new(),
            sequence: u32::MAX,
        }
    }
}

/// A transaction output, creating a new spendable coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in atoms.
    pub value: u64,
    /// Locking script.
    pub pk_script: Script,
}

/// A transaction transferring value between scripts.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u32,
}

impl Transaction {
    /// Compute the transaction ID: BLAKE3 over a fixed, witness-free layout.
    ///
    /// Layout: version || n_in || (txid || index || len || script || sequence)* ||
    /// n_out || (value || len || script)* || lock_time, integers little-endian.
    pub fn txid(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.previous_output.txid.as_bytes());
            hasher.update(&input.previous_output.index.to_le_bytes());
            hasher.update(&(input.signature_script.len() as u64).to_le_bytes());
            hasher.update(&input.signature_script);
            hasher.update(&input.sequence.to_le_bytes());
        }
        hasher.update(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            hasher.update(&output.value.to_le_bytes());
            hasher.update(&(output.pk_script.len() as u64).to_le_bytes());
            hasher.update(output.pk_script.as_bytes());
        }
        hasher.update(&self.lock_time.to_le_bytes());
        Hash256(hasher.finalize().into())
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Whether any input carries witness data.
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Canonical bincode encoding of the full transaction (witness included).
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode a transaction from its canonical bincode encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (tx, _): (Self, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(tx)
    }
}

/// Block header as supplied by the chain source.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Compact difficulty bits.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing.
    const HASH_SIZE: usize = 4 + 2 * 32 + 8 + 4 + 4;

    /// Compute the block header hash (double SHA-256).
    ///
    /// Uses an explicit fixed byte layout: version || prev_hash || merkle_root ||
    /// timestamp || bits || nonce, all little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Ordered list of transactions. First transaction is the coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

/// A block identified by height and hash.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockStamp {
    pub height: u32,
    pub hash: Hash256,
}

impl fmt::Display for BlockStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

/// A block stamp plus the block timestamp.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockMeta {
    pub stamp: BlockStamp,
    /// Unix timestamp of the block header.
    pub time: i64,
}

impl BlockMeta {
    pub fn new(height: u32, hash: Hash256, time: i64) -> Self {
        Self {
            stamp: BlockStamp { height, hash },
            time,
        }
    }

    pub fn height(&self) -> u32 {
        self.stamp.height
    }

    pub fn hash(&self) -> Hash256 {
        self.stamp.hash
    }
}

/// Number of confirmations of an output mined at `height` when the tip is `tip`.
///
/// Unmined outputs (`None`) and outputs above the tip have zero confirmations.
pub fn confirmations(height: Option<u32>, tip: u32) -> u32 {
    match height {
        Some(h) if h <= tip => tip - h + 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;

    fn sample_script() -> Script {
        Script::from_bytes(vec![0x00, 0x14, 0xAA, 0xAA, 0xAA])
    }

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Hash256([0x11; 32]), 0),
                signature_script: vec![0u8; 64],
                witness: vec![],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                pk_script: sample_script(),
            }],
            lock_time: 0,
        }
    }

    fn sample_coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature_script: 7u32.to_le_bytes().to_vec(),
                witness: vec![],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                pk_script: sample_script(),
            }],
            lock_time: 7,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 0,
        }
    }

    #[test]
    fn hash256_zero_is_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert_eq!(Hash256::ZERO, Hash256::default());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn hash256_display_hex() {
        let s = format!("{}", Hash256([0xAB; 32]));
        assert_eq!(s.len(), 64);
        assert_eq!(&s[0..2], "ab");
    }

    #[test]
    fn hash256_from_slice_rejects_wrong_length() {
        assert!(Hash256::from_slice(&[0u8; 31]).is_none());
        assert_eq!(Hash256::from_slice(&[7u8; 32]), Some(Hash256([7; 32])));
    }

    #[test]
    fn outpoint_null_detection() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new(Hash256([1; 32]), 0).is_null());
    }

    #[test]
    fn outpoint_key_sorts_by_txid_then_index() {
        let a = OutPoint::new(Hash256([1; 32]), 300);
        let b = OutPoint::new(Hash256([1; 32]), 2);
        let c = OutPoint::new(Hash256([2; 32]), 0);
        assert!(b.to_key() < a.to_key());
        assert!(a.to_key() < c.to_key());
        assert_eq!(OutPoint::from_key(&a.to_key()), Some(a));
    }

    #[test]
    fn outpoint_display() {
        let op = OutPoint::new(Hash256([0xFF; 32]), 3);
        assert!(format!("{op}").ends_with(":3"));
    }

    #[test]
    fn coinbase_detection() {
        assert!(sample_coinbase().is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn txid_deterministic_and_sensitive() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.txid());
        let mut other = sample_tx();
        other.lock_time = 1;
        assert_ne!(tx.txid(), other.txid());
    }

    #[test]
    fn txid_ignores_witness() {
        let tx = sample_tx();
        let mut witnessed = sample_tx();
        witnessed.inputs[0].witness = vec![vec![1, 2, 3]];
        assert_eq!(tx.txid(), witnessed.txid());
        assert!(witnessed.has_witness());
    }

    #[test]
    fn total_output_value_overflow_returns_none() {
        let mut tx = sample_tx();
        tx.outputs.push(TxOutput { value: u64::MAX, pk_script: sample_script() });
        assert_eq!(tx.total_output_value(), None);
    }

    #[test]
    fn block_header_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
        assert!(!h1.hash().is_zero());
    }

    #[test]
    fn transaction_bytes_decode_back() {
        let tx = sample_coinbase();
        let bytes = tx.to_bytes().unwrap();
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
        assert!(Transaction::from_bytes(&bytes[..3]).is_err());
    }

    #[test]
    fn confirmations_counts_inclusive() {
        assert_eq!(confirmations(Some(10), 12), 3);
        assert_eq!(confirmations(Some(12), 12), 1);
        assert_eq!(confirmations(Some(13), 12), 0);
        assert_eq!(confirmations(None, 12), 0);
    }
}
