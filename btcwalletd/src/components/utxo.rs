//! The per-account unspent-output set.

use bitcoin::{Address, Amount, OutPoint, ScriptBuf};

/// A transaction output owned by an account and not yet spent.
///
/// Each output is exclusively owned by exactly one account's store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    /// The transaction output being referenced.
    pub outpoint: OutPoint,
    /// The output's value.
    pub value: Amount,
    /// The account address the output pays.
    pub address: Address,
    /// The output script, kept for signature-hash computation when the
    /// output is spent.
    pub script_pubkey: ScriptBuf,
    /// Height of the block containing the output's transaction, or `None`
    /// while it is unmined.
    pub height: Option<i32>,
}

impl Utxo {
    /// Number of confirmations at the given chain height.
    ///
    /// Unmined outputs have zero confirmations.
    pub fn confirmations(&self, best_height: i32) -> i32 {
        match self.height {
            Some(height) if height <= best_height => best_height - height + 1,
            _ => 0,
        }
    }
}

/// An ordered collection of an account's unspent outputs.
#[derive(Debug, Default)]
pub struct UtxoStore {
    utxos: Vec<Utxo>,
    dirty: bool,
}

impl UtxoStore {
    /// Creates a store from previously persisted outputs.
    pub fn new(utxos: Vec<Utxo>) -> Self {
        Self {
            utxos,
            dirty: false,
        }
    }

    /// Whether the in-memory set has diverged from its on-disk state.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the dirty flag after a successful write to disk.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// The outputs, in store order.
    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.iter()
    }

    /// Outputs spendable at the given confirmation depth, in store order.
    pub fn eligible(&self, min_confirmations: u32, best_height: i32) -> Vec<Utxo> {
        self.utxos
            .iter()
            .filter(|u| u.confirmations(best_height) >= min_confirmations as i32)
            .cloned()
            .collect()
    }

    /// Sum of outputs with at least `min_confirmations` confirmations.
    pub fn confirmed_balance(&self, min_confirmations: u32, best_height: i32) -> Amount {
        self.utxos
            .iter()
            .filter(|u| u.confirmations(best_height) >= min_confirmations as i32)
            .map(|u| u.value)
            .sum()
    }

    /// Sum of all outputs, mined or not.
    pub fn total_balance(&self) -> Amount {
        self.utxos.iter().map(|u| u.value).sum()
    }

    /// Appends an output and marks the store dirty.
    pub fn push(&mut self, utxo: Utxo) {
        self.utxos.push(utxo);
        self.dirty = true;
    }

    /// Removes the output referencing `outpoint`, marking the store dirty if
    /// one was present.
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let index = self.utxos.iter().position(|u| &u.outpoint == outpoint)?;
        self.dirty = true;
        Some(self.utxos.remove(index))
    }

    /// Number of outputs in the store.
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    /// Whether the store holds no outputs.
    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}
