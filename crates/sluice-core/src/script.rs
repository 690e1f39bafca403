//! Locking scripts and the closed set of script kinds the wallet understands.
//!
//! A raw `pk_script` is classified once into a [`ScriptKind`]; everything
//! downstream (address filters, segwit caps, spendability) asks the variant
//! instead of re-parsing bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Raw locking script bytes.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct Script(pub Vec<u8>);

impl Script {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Classify this script.
    pub fn kind(&self) -> ScriptKind {
        ScriptKind::classify(&self.0)
    }

    /// Standard locking script paying to `address`.
    pub fn pay_to(address: &Address) -> Self {
        let mut s = Vec::with_capacity(34);
        match address {
            Address::PubKeyHash(h) => {
                s.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
                s.extend_from_slice(h);
                s.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            }
            Address::ScriptHash(h) => {
                s.extend_from_slice(&[OP_HASH160, 20]);
                s.extend_from_slice(h);
                s.push(OP_EQUAL);
            }
            Address::WitnessPubKeyHash(h) => {
                s.extend_from_slice(&[OP_0, 20]);
                s.extend_from_slice(h);
            }
            Address::WitnessScriptHash(h) => {
                s.extend_from_slice(&[OP_0, 32]);
                s.extend_from_slice(h);
            }
            Address::PubKey(pk) => {
                s.push(pk.len() as u8);
                s.extend_from_slice(pk);
                s.push(OP_CHECKSIG);
            }
        }
        Self(s)
    }

    /// Provably unspendable data carrier script.
    pub fn null_data(data: &[u8]) -> Self {
        let mut s = vec![OP_RETURN];
        if !data.is_empty() {
            s.push(data.len().min(75) as u8);
            s.extend_from_slice(&data[..data.len().min(75)]);
        }
        Self(s)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A payment destination extracted from a script.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub enum Address {
    PubKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    WitnessPubKeyHash([u8; 20]),
    WitnessScriptHash([u8; 32]),
    /// Bare public key (compressed or uncompressed).
    PubKey(Vec<u8>),
}

impl Address {
    /// Whether spending this destination uses a witness.
    pub fn is_witness(&self) -> bool {
        matches!(self, Self::WitnessPubKeyHash(_) | Self::WitnessScriptHash(_))
    }

    pub fn script(&self) -> Script {
        Script::pay_to(self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PubKeyHash(h) => write!(f, "pkh:{}", hex::encode(h)),
            Self::ScriptHash(h) => write!(f, "sh:{}", hex::encode(h)),
            Self::WitnessPubKeyHash(h) => write!(f, "wpkh:{}", hex::encode(h)),
            Self::WitnessScriptHash(h) => write!(f, "wsh:{}", hex::encode(h)),
            Self::PubKey(pk) => write!(f, "pk:{}", hex::encode(pk)),
        }
    }
}

/// Closed set of recognised locking-script templates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    PubKey(Vec<u8>),
    PubKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    WitnessPubKeyHash([u8; 20]),
    WitnessScriptHash([u8; 32]),
    /// `required`-of-`keys.len()` bare multisig.
    MultiSig { required: u8, keys: Vec<Vec<u8>> },
    NullData,
    NonStandard,
}

impl ScriptKind {
    /// Classify raw script bytes.
    pub fn classify(s: &[u8]) -> Self {
        match s {
            [OP_DUP, OP_HASH160, 20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
                Self::PubKeyHash(to_array(hash))
            }
            [OP_HASH160, 20, hash @ .., OP_EQUAL] if hash.len() == 20 => {
                Self::ScriptHash(to_array(hash))
            }
            [OP_0, 20, hash @ ..] if hash.len() == 20 => Self::WitnessPubKeyHash(to_array(hash)),
            [OP_0, 32, hash @ ..] if hash.len() == 32 => Self::WitnessScriptHash(to_array(hash)),
            [len, key @ .., OP_CHECKSIG]
                if (*len == 33 || *len == 65) && key.len() == *len as usize =>
            {
                Self::PubKey(key.to_vec())
            }
            [OP_RETURN, ..] => Self::NullData,
            [m, .., n, OP_CHECKMULTISIG] if is_small_int(*m) && is_small_int(*n) => {
                parse_multisig(s).unwrap_or(Self::NonStandard)
            }
            _ => Self::NonStandard,
        }
    }

    /// Destinations paid by this script. Empty for data and non-standard scripts.
    pub fn addresses(&self) -> Vec<Address> {
        match self {
            Self::PubKey(pk) => vec![Address::PubKey(pk.clone())],
            Self::PubKeyHash(h) => vec![Address::PubKeyHash(*h)],
            Self::ScriptHash(h) => vec![Address::ScriptHash(*h)],
            Self::WitnessPubKeyHash(h) => vec![Address::WitnessPubKeyHash(*h)],
            Self::WitnessScriptHash(h) => vec![Address::WitnessScriptHash(*h)],
            Self::MultiSig { keys, .. } => keys.iter().cloned().map(Address::PubKey).collect(),
            Self::NullData | Self::NonStandard => Vec::new(),
        }
    }

    /// Whether spending this output places signatures in the witness.
    pub fn is_segwit(&self) -> bool {
        matches!(self, Self::WitnessPubKeyHash(_) | Self::WitnessScriptHash(_))
    }

    /// Whether a wallet owning the addresses accepted by `owns` can sign for this script.
    ///
    /// Multisig needs at least `required` owned keys. Data and non-standard
    /// scripts are never spendable.
    pub fn is_spendable_by(&self, owns: impl Fn(&Address) -> bool) -> bool {
        match self {
            Self::MultiSig { required, .. } => {
                let owned = self.addresses().iter().filter(|a| owns(a)).count();
                owned >= *required as usize
            }
            Self::NullData | Self::NonStandard => false,
            _ => self.addresses().iter().any(owns),
        }
    }

    /// Approximate serialized size of an input spending this script, in bytes.
    /// Witness bytes are counted at a quarter weight.
    pub fn estimated_input_size(&self) -> usize {
        match self {
            Self::PubKeyHash(_) => 148,
            Self::PubKey(_) => 114,
            Self::ScriptHash(_) => 298,
            Self::WitnessPubKeyHash(_) => 68,
            Self::WitnessScriptHash(_) => 104,
            Self::MultiSig { required, .. } => 41 + 73 * (*required as usize),
            Self::NullData | Self::NonStandard => 148,
        }
    }
}

fn is_small_int(op: u8) -> bool {
    (OP_1..=OP_16).contains(&op)
}

fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn parse_multisig(s: &[u8]) -> Option<ScriptKind> {
    let required = s[0] - OP_1 + 1;
    let total = s[s.len() - 2] - OP_1 + 1;
    let mut keys = Vec::new();
    let mut pos = 1;
    let end = s.len() - 2;
    while pos < end {
        let len = s[pos] as usize;
        if len != 33 && len != 65 {
            return None;
        }
        let key = s.get(pos + 1..pos + 1 + len)?;
        keys.push(key.to_vec());
        pos += 1 + len;
    }
    if pos != end || keys.len() != total as usize || required > total {
        return None;
    }
    Some(ScriptKind::MultiSig { required, keys })
}

/// Build a bare `m`-of-`keys.len()` multisig script.
pub fn multisig_script(required: u8, keys: &[Vec<u8>]) -> Script {
    let mut s = vec![OP_1 + required - 1];
    for key in keys {
        s.push(key.len() as u8);
        s.extend_from_slice(key);
    }
    s.push(OP_1 + keys.len() as u8 - 1);
    s.push(OP_CHECKMULTISIG);
    Script(s)
}
