//! Transaction assembly from a coin selection, with size-based fees.
//!
//! 1. Add outputs (a single zero-value output sweeps everything selected)
//! 2. Build an unsigned transaction from a [`Selection`] and a change script
//! 3. Sign every input through the [`AddressOracle`], collecting per-input failures

use rand::Rng;
use tracing::debug;

use sluice_core::script::Script;
use sluice_core::types::{Transaction, TxInput, TxOutput};
use sluice_ledger::Credit;

use crate::coin_selection::Selection;
use crate::config::{DEFAULT_DUST_LIMIT, DEFAULT_FEE_PER_KB};
use crate::error::{InputSignError, SelectError, WalletError};
use crate::keys::AddressOracle;

/// Version, counts and lock time.
pub const TX_OVERHEAD: usize = 10;
/// Value plus script length prefix.
const OUTPUT_OVERHEAD: usize = 9;

/// A transaction with empty unlocking data, plus what it spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    /// Spent credits, parallel to `tx.inputs`.
    pub inputs: Vec<Credit>,
    pub fee: u64,
    pub change_index: Option<u32>,
}

impl UnsignedTransaction {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|c| c.amount).sum()
    }

    /// Move the change output to a random position.
    pub fn randomize_change_position(&mut self, rng: &mut impl Rng) {
        let Some(current) = self.change_index else {
            return;
        };
        let target = rng.gen_range(0..self.tx.outputs.len());
        self.tx.outputs.swap(current as usize, target);
        self.change_index = Some(target as u32);
    }
}

/// Builder for unsigned transactions.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    outputs: Vec<TxOutput>,
    fee_per_kb: u64,
    dust_limit: u64,
    lock_time: u32,
}

impl TransactionBuilder {
    pub fn new(fee_per_kb: u64, dust_limit: u64) -> Self {
        Self { outputs: Vec::new(), fee_per_kb, dust_limit, lock_time: 0 }
    }

    pub fn add_output(&mut self, pk_script: Script, value: u64) -> &mut Self {
        self.outputs.push(TxOutput { value, pk_script });
        self
    }

    pub fn set_lock_time(&mut self, lock_time: u32) -> &mut Self {
        self.lock_time = lock_time;
        self
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    /// A single zero-value output sends everything selected.
    pub fn is_sweep(&self) -> bool {
        matches!(self.outputs.as_slice(), [only] if only.value == 0)
    }

    /// Sum of requested output values. Zero for a sweep.
    pub fn send_total(&self) -> Result<u64, WalletError> {
        if self.outputs.is_empty() {
            return Err(WalletError::InvalidAmount("no outputs".into()));
        }
        if self.is_sweep() {
            return Ok(0);
        }
        let mut total: u64 = 0;
        for (i, out) in self.outputs.iter().enumerate() {
            if out.value == 0 {
                return Err(WalletError::InvalidAmount(format!("output {i} has zero value")));
            }
            if out.value < self.dust_limit {
                return Err(WalletError::InvalidAmount(format!(
                    "output {i} value {} is below the dust limit {}",
                    out.value, self.dust_limit
                )));
            }
            total = total
                .checked_add(out.value)
                .ok_or_else(|| WalletError::InvalidAmount("total amount overflow".into()))?;
        }
        Ok(total)
    }

    /// Estimated serialized size spending `inputs`, with an optional change output.
    pub fn estimate_size(&self, inputs: &[Credit], change: Option<&Script>) -> usize {
        let inputs: usize = inputs.iter().map(|c| c.pk_script.kind().estimated_input_size()).sum();
        let outputs: usize = self
            .outputs
            .iter()
            .map(|o| &o.pk_script)
            .chain(change)
            .map(|s| OUTPUT_OVERHEAD + s.len())
            .sum();
        TX_OVERHEAD + inputs + outputs
    }

    /// Fee for `size` bytes, rounded up.
    pub fn fee_for_size(&self, size: usize) -> u64 {
        (size as u64).saturating_mul(self.fee_per_kb).div_ceil(1000)
    }

    pub fn estimate_fee(&self, inputs: &[Credit], change: Option<&Script>) -> u64 {
        self.fee_for_size(self.estimate_size(inputs, change))
    }

    /// Assemble the outputs and change for `selection`.
    ///
    /// Change below the dust limit is added to the fee. Fails with
    /// [`SelectError::InsufficientFunds`] when the selection does not cover
    /// the outputs plus the fee it implies.
    pub fn build(
        &self,
        selection: &Selection,
        change_script: &Script,
    ) -> Result<UnsignedTransaction, WalletError> {
        let send = self.send_total()?;
        let inputs = selection.credits.clone();
        if inputs.is_empty() {
            return Err(WalletError::Build("no inputs selected".into()));
        }
        let total = selection.total;
        let unconfirmed = selection.exclusions.unconfirmed;
        let mut outputs = self.outputs.clone();

        let (fee, change_index) = if self.is_sweep() {
            let fee = self.estimate_fee(&inputs, None);
            let value = total.saturating_sub(fee);
            if value < self.dust_limit {
                return Err(SelectError::InsufficientFunds {
                    have: total,
                    need: fee + self.dust_limit,
                    unconfirmed,
                }
                .into());
            }
            outputs[0].value = value;
            (fee, None)
        } else {
            let bare_fee = self.estimate_fee(&inputs, None);
            let need = send.saturating_add(bare_fee);
            if total < need {
                return Err(SelectError::InsufficientFunds { have: total, need, unconfirmed }.into());
            }
            let change_fee = self.estimate_fee(&inputs, Some(change_script));
            let change = total.saturating_sub(send).saturating_sub(change_fee);
            if change >= self.dust_limit {
                outputs.push(TxOutput { value: change, pk_script: change_script.clone() });
                (change_fee, Some(outputs.len() as u32 - 1))
            } else {
                (total - send, None)
            }
        };

        debug!(inputs = inputs.len(), total, fee, change = change_index.is_some(), "built transaction");
        let tx = Transaction {
            version: 1,
            inputs: inputs.iter().map(|c| TxInput::unsigned(c.outpoint)).collect(),
            outputs,
            lock_time: self.lock_time,
        };
        Ok(UnsignedTransaction { tx, inputs, fee, change_index })
    }

    /// Sign every input. Inputs the oracle cannot sign stay empty and are
    /// reported individually.
    pub fn sign(
        unsigned: &UnsignedTransaction,
        oracle: &dyn AddressOracle,
    ) -> (Transaction, Vec<InputSignError>) {
        let mut tx = unsigned.tx.clone();
        let mut errors = Vec::new();
        for (index, spent) in unsigned.inputs.iter().enumerate() {
            match oracle.sign_input(&unsigned.tx, index, spent) {
                Ok(sig) => {
                    tx.inputs[index].signature_script = sig.signature_script;
                    tx.inputs[index].witness = sig.witness;
                }
                Err(reason) => errors.push(InputSignError { index, outpoint: spent.outpoint, reason }),
            }
        }
        (tx, errors)
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_FEE_PER_KB, DEFAULT_DUST_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin_selection::Exclusions;
    use crate::testing::MemoryKeys;
    use rand::SeedableRng;
    use sluice_core::constants::NetworkType;
    use sluice_core::script::Address;
    use sluice_core::types::{BlockStamp, Hash256, OutPoint};

    fn credit(id: u8, amount: u64, script: &Script) -> Credit {
        Credit {
            outpoint: OutPoint::new(Hash256([id; 32]), 0),
            amount,
            pk_script: script.clone(),
            block: Some(BlockStamp { height: 1, hash: Hash256::ZERO }),
            from_coinbase: false,
            is_change: false,
        }
    }

    fn selection(credits: Vec<Credit>) -> Selection {
        let total = credits.iter().map(|c| c.amount).sum();
        Selection {
            credits,
            total,
            single_group: true,
            exclusions: Exclusions::default(),
            overflow_count: 0,
            overflow_value: 0,
        }
    }

    fn dest() -> Script {
        Address::PubKeyHash([7; 20]).script()
    }

    #[test]
    fn size_estimate_counts_inputs_and_outputs() {
        let mut builder = TransactionBuilder::default();
        builder.add_output(dest(), 10_000);
        let legacy = credit(1, 1, &Address::PubKeyHash([1; 20]).script());
        let segwit = credit(2, 1, &Address::WitnessPubKeyHash([1; 20]).script());
        let change = Address::PubKeyHash([2; 20]).script();

        let base = builder.estimate_size(&[], None);
        assert_eq!(base, TX_OVERHEAD + OUTPUT_OVERHEAD + dest().len());
        assert_eq!(builder.estimate_size(&[legacy.clone()], None), base + 148);
        assert_eq!(builder.estimate_size(&[segwit], None), base + 68);
        assert_eq!(
            builder.estimate_size(&[legacy], Some(&change)),
            base + 148 + OUTPUT_OVERHEAD + change.len()
        );
        assert_eq!(builder.fee_for_size(250), 250);
        assert_eq!(TransactionBuilder::new(1500, 0).fee_for_size(3), 5);
    }

    #[test]
    fn change_output_appended() {
        let mut builder = TransactionBuilder::default();
        builder.add_output(dest(), 50_000);
        let script = Address::PubKeyHash([1; 20]).script();
        let change = Address::PubKeyHash([2; 20]).script();
        let sel = selection(vec![credit(1, 100_000, &script)]);

        let unsigned = builder.build(&sel, &change).unwrap();
        assert_eq!(unsigned.change_index, Some(1));
        assert_eq!(unsigned.tx.outputs.len(), 2);
        let out_total: u64 = unsigned.tx.outputs.iter().map(|o| o.value).sum();
        assert_eq!(out_total + unsigned.fee, 100_000);
        assert_eq!(unsigned.fee, builder.estimate_fee(&sel.credits, Some(&change)));
        assert_eq!(unsigned.tx.inputs[0].previous_output, sel.credits[0].outpoint);
    }

    #[test]
    fn dust_change_folds_into_fee() {
        let mut builder = TransactionBuilder::default();
        let script = Address::PubKeyHash([1; 20]).script();
        let sel = selection(vec![credit(1, 100_000, &script)]);
        let bare_fee = builder.estimate_fee(&sel.credits, None);
        builder.add_output(dest(), 100_000 - bare_fee - 100);

        let unsigned = builder.build(&sel, &Address::PubKeyHash([2; 20]).script()).unwrap();
        assert_eq!(unsigned.change_index, None);
        assert_eq!(unsigned.tx.outputs.len(), 1);
        assert_eq!(unsigned.fee, bare_fee + 100);
    }

    #[test]
    fn sweep_sends_everything_minus_fee() {
        let mut builder = TransactionBuilder::default();
        builder.add_output(dest(), 0);
        assert!(builder.is_sweep());
        let script = Address::PubKeyHash([1; 20]).script();
        let sel = selection(vec![credit(1, 30_000, &script), credit(2, 20_000, &script)]);

        let unsigned = builder.build(&sel, &script).unwrap();
        assert_eq!(unsigned.tx.outputs.len(), 1);
        assert_eq!(unsigned.tx.outputs[0].value + unsigned.fee, 50_000);
        assert_eq!(unsigned.change_index, None);
    }

    #[test]
    fn selection_short_of_fee_is_insufficient() {
        let mut builder = TransactionBuilder::default();
        builder.add_output(dest(), 100_000);
        let script = Address::PubKeyHash([1; 20]).script();
        let sel = selection(vec![credit(1, 100_000, &script)]);
        let err = builder.build(&sel, &script).unwrap_err();
        assert!(matches!(err, WalletError::Select(SelectError::InsufficientFunds { have: 100_000, .. })));
    }

    #[test]
    fn invalid_outputs_rejected() {
        assert!(TransactionBuilder::default().send_total().unwrap_err().is_input());

        let mut builder = TransactionBuilder::default();
        builder.add_output(dest(), 1000).add_output(dest(), 0);
        assert!(builder.send_total().unwrap_err().is_input());

        let mut builder = TransactionBuilder::default();
        builder.add_output(dest(), 10);
        assert!(builder.send_total().unwrap_err().is_input());

        let mut builder = TransactionBuilder::new(1000, 0);
        builder.add_output(dest(), u64::MAX).add_output(dest(), 1);
        assert!(builder.send_total().unwrap_err().is_input());
    }

    #[test]
    fn randomized_change_stays_tracked() {
        let mut builder = TransactionBuilder::default();
        builder.add_output(dest(), 10_000).add_output(dest(), 20_000);
        let script = Address::PubKeyHash([1; 20]).script();
        let change = Address::PubKeyHash([2; 20]).script();
        let sel = selection(vec![credit(1, 100_000, &script)]);
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        for _ in 0..10 {
            let mut unsigned = builder.build(&sel, &change).unwrap();
            unsigned.randomize_change_position(&mut rng);
            let index = unsigned.change_index.unwrap() as usize;
            assert_eq!(unsigned.tx.outputs[index].pk_script, change);
        }
    }

    #[test]
    fn sign_collects_per_input_failures() {
        let keys = MemoryKeys::new([4; 32], NetworkType::Regtest);
        let mine = keys.next_address().script();
        let foreign = Address::PubKeyHash([9; 20]).script();
        let mut builder = TransactionBuilder::default();
        builder.add_output(dest(), 10_000);
        let sel = selection(vec![credit(1, 30_000, &mine), credit(2, 30_000, &foreign)]);

        let unsigned = builder.build(&sel, &mine).unwrap();
        let (tx, errors) = TransactionBuilder::sign(&unsigned, &keys);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].index, 1);
        assert_eq!(errors[0].outpoint, sel.credits[1].outpoint);
        assert!(!tx.inputs[0].signature_script.is_empty());
        assert!(tx.inputs[1].signature_script.is_empty());
        assert_ne!(tx.txid(), unsigned.tx.txid());
    }
}
