//! The miner-fee setting for wallet-built transactions.

use bitcoin::Amount;
use tokio::sync::Mutex;

/// The fee attached to transactions the wallet builds.
///
/// Owned by the dispatcher and handed by reference into send operations;
/// mutated only by `settxfee`, and read at the moment each send is priced
/// rather than snapshotted.
pub(crate) struct FeeSetting {
    amount: Mutex<Amount>,
}

impl FeeSetting {
    pub(crate) fn new(amount: Amount) -> Self {
        Self {
            amount: Mutex::new(amount),
        }
    }

    pub(crate) async fn get(&self) -> Amount {
        *self.amount.lock().await
    }

    pub(crate) async fn set(&self, amount: Amount) {
        *self.amount.lock().await = amount;
    }
}
