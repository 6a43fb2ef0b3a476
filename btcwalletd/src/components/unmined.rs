//! Locally broadcast transactions awaiting block inclusion.

use std::collections::HashMap;

use bitcoin::{Address, Txid};
use tokio::sync::Mutex;

use crate::components::utxo::Utxo;

/// A transaction built by the send pipeline.
///
/// Held by the broadcast reply handler until the node accepts or rejects the
/// transaction; on acceptance the consumed inputs and change output are
/// applied to the owning account's unspent-output store and the transaction
/// moves into the [`UnminedPool`].
#[derive(Clone, Debug)]
pub(crate) struct CreatedTx {
    /// The serialized signed transaction.
    pub(crate) raw: Vec<u8>,
    /// The transaction's id.
    pub(crate) txid: Txid,
    /// Outputs the transaction spends, to be removed from the account.
    pub(crate) consumed: Vec<Utxo>,
    /// The change output paying back into the account, if the selected
    /// inputs exceeded the payment plus fee.
    pub(crate) change: Option<Utxo>,
    /// The address receiving the change output.
    pub(crate) change_address: Option<Address>,
    /// Frontend-supplied transaction comment. Stored for later retrieval;
    /// no query surface exists yet.
    pub(crate) comment: Option<String>,
    /// Frontend-supplied recipient comment, as for `comment`.
    pub(crate) comment_to: Option<String>,
}

/// Broadcast transactions the node has accepted but no block contains yet,
/// keyed by transaction id.
///
/// Entries are retained so the embedding transport can rebroadcast them
/// after the node link drops and reconnects. By the time a transaction is
/// inserted its inputs have already been removed from the owning account and
/// any change output appended there.
#[derive(Default)]
pub(crate) struct UnminedPool {
    entries: Mutex<HashMap<Txid, CreatedTx>>,
}

impl UnminedPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records an accepted transaction.
    pub(crate) async fn insert(&self, tx: CreatedTx) {
        self.entries.lock().await.insert(tx.txid, tx);
    }

    /// Whether `txid` is awaiting inclusion.
    pub(crate) async fn contains(&self, txid: &Txid) -> bool {
        self.entries.lock().await.contains_key(txid)
    }

    /// The raw form of every pending transaction, for rebroadcast after a
    /// node reconnect.
    pub(crate) async fn raw_transactions(&self) -> Vec<Vec<u8>> {
        self.entries
            .lock()
            .await
            .values()
            .map(|tx| tx.raw.clone())
            .collect()
    }

    /// Number of pending transactions.
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
