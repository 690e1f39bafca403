//! Fixed-width big-endian key layouts.
//!
//! Keys sort by txid, then height, then index, so every row belonging to a
//! transaction is reachable with a txid prefix scan.

use sluice_core::types::{Hash256, OutPoint};

use crate::error::LedgerError;

pub const HEIGHT_LEN: usize = 4;
/// txid || height
pub const TX_KEY_LEN: usize = 32 + HEIGHT_LEN;
/// txid || height || index
pub const INDEXED_KEY_LEN: usize = TX_KEY_LEN + 4;

pub fn height_key(height: u32) -> [u8; HEIGHT_LEN] {
    height.to_be_bytes()
}

pub fn decode_height(key: &[u8]) -> Result<u32, LedgerError> {
    let bytes: [u8; HEIGHT_LEN] = key
        .get(..HEIGHT_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| LedgerError::Corrupt(format!("height key of {} bytes", key.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Key of a mined transaction record.
pub fn tx_key(txid: &Hash256, height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(TX_KEY_LEN);
    key.extend_from_slice(txid.as_bytes());
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Key of a mined credit (output index) or debit (input index).
pub fn indexed_key(txid: &Hash256, height: u32, index: u32) -> Vec<u8> {
    let mut key = tx_key(txid, height);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Split an indexed key into (txid, height, index).
pub fn decode_indexed_key(key: &[u8]) -> Result<(Hash256, u32, u32), LedgerError> {
    if key.len() != INDEXED_KEY_LEN {
        return Err(LedgerError::Corrupt(format!("indexed key of {} bytes", key.len())));
    }
    let txid = Hash256::from_slice(&key[..32])
        .ok_or_else(|| LedgerError::Corrupt("bad txid in key".into()))?;
    let height = decode_height(&key[32..])?;
    let index = decode_height(&key[TX_KEY_LEN..])?;
    Ok((txid, height, index))
}

/// Height suffix of a mined tx key.
pub fn tx_key_height(key: &[u8]) -> Result<u32, LedgerError> {
    if key.len() != TX_KEY_LEN {
        return Err(LedgerError::Corrupt(format!("tx key of {} bytes", key.len())));
    }
    decode_height(&key[32..])
}

pub fn outpoint_key(outpoint: &OutPoint) -> Vec<u8> {
    outpoint.to_key().to_vec()
}

pub fn decode_outpoint(key: &[u8]) -> Result<OutPoint, LedgerError> {
    OutPoint::from_key(key)
        .ok_or_else(|| LedgerError::Corrupt(format!("outpoint key of {} bytes", key.len())))
}

/// Key of an unmined-input entry: spent outpoint || spender txid.
pub fn unmined_input_key(outpoint: &OutPoint, spender: &Hash256) -> Vec<u8> {
    let mut key = outpoint_key(outpoint);
    key.extend_from_slice(spender.as_bytes());
    key
}

/// Spender txid of an unmined-input key.
pub fn unmined_input_spender(key: &[u8]) -> Result<Hash256, LedgerError> {
    key.get(OutPoint::KEY_LEN..)
        .and_then(Hash256::from_slice)
        .ok_or_else(|| LedgerError::Corrupt(format!("unmined input key of {} bytes", key.len())))
}

/// bincode-encode a stored value.
pub fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, LedgerError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| LedgerError::Database(e.to_string()))
}

/// bincode-decode a stored value.
pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, LedgerError> {
    let (value, _): (T, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_key_decodes() {
        let txid = Hash256([4; 32]);
        let key = indexed_key(&txid, 70_000, 3);
        assert_eq!(decode_indexed_key(&key).unwrap(), (txid, 70_000, 3));
        assert!(decode_indexed_key(&key[1..]).is_err());
    }

    #[test]
    fn heights_sort_numerically() {
        assert!(height_key(255) < height_key(256));
        assert!(tx_key(&Hash256([1; 32]), 9) < tx_key(&Hash256([1; 32]), 10));
    }

    #[test]
    fn unmined_input_key_layout() {
        let op = OutPoint::new(Hash256([1; 32]), 2);
        let spender = Hash256([9; 32]);
        let key = unmined_input_key(&op, &spender);
        assert!(key.starts_with(&op.to_key()));
        assert_eq!(unmined_input_spender(&key).unwrap(), spender);
        assert_eq!(decode_outpoint(&key).unwrap(), op);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode::<u64>(&[]), Err(LedgerError::Corrupt(_))));
        assert!(decode_height(&[1, 2]).is_err());
    }
}
