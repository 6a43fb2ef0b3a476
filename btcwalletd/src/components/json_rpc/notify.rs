//! Account notifications for frontends.
//!
//! Notifications are formatted as reply envelopes whose identifier is a
//! distinguished string literal per notification kind, with the payload
//! wrapped in an `{account, notification}` envelope. They can target one
//! frontend or fan out to every connected frontend via the master broadcast
//! channel. Notifications never fail: serialization errors and sends with
//! nobody listening are silently dropped.

use bitcoin::Amount;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use super::FrontendHandle;

/// Identifier of wallet lock-state notifications; payload is `true` when
/// the wallet locked.
pub const NTFN_LOCK_STATE: &str = "btcwallet:newwalletlockstate";
/// Identifier of confirmed-balance notifications.
pub const NTFN_BALANCE: &str = "btcwallet:accountbalance";
/// Identifier of unconfirmed-balance notifications; payload is the
/// difference between total and confirmed balance.
pub const NTFN_BALANCE_UNCONFIRMED: &str = "btcwallet:accountbalanceunconfirmed";

/// Formats and fans out account notifications.
#[derive(Clone)]
pub(crate) struct Notifier {
    master: broadcast::Sender<Vec<u8>>,
}

impl Notifier {
    /// Wraps the master channel every connected frontend listens on.
    pub(crate) fn new(master: broadcast::Sender<Vec<u8>>) -> Self {
        Self { master }
    }

    /// Tells every frontend that `account` locked or unlocked.
    pub(crate) fn broadcast_lock_state(&self, account: &str, locked: bool) {
        self.broadcast(envelope(NTFN_LOCK_STATE, account, json!(locked)));
    }

    /// Tells every frontend the confirmed balance of `account`.
    pub(crate) fn broadcast_balance(&self, account: &str, confirmed: Amount) {
        self.broadcast(envelope(NTFN_BALANCE, account, json!(confirmed.to_btc())));
    }

    /// Tells every frontend the unconfirmed balance of `account`.
    pub(crate) fn broadcast_balance_unconfirmed(&self, account: &str, unconfirmed: Amount) {
        self.broadcast(envelope(
            NTFN_BALANCE_UNCONFIRMED,
            account,
            json!(unconfirmed.to_btc()),
        ));
    }

    /// Tells one frontend the confirmed balance of `account`.
    pub(crate) async fn send_balance(
        &self,
        frontend: &FrontendHandle,
        account: &str,
        confirmed: Amount,
    ) {
        if let Some(bytes) = envelope(NTFN_BALANCE, account, json!(confirmed.to_btc())) {
            frontend.send(bytes).await;
        }
    }

    /// Tells one frontend the unconfirmed balance of `account`.
    pub(crate) async fn send_balance_unconfirmed(
        &self,
        frontend: &FrontendHandle,
        account: &str,
        unconfirmed: Amount,
    ) {
        if let Some(bytes) = envelope(NTFN_BALANCE_UNCONFIRMED, account, json!(unconfirmed.to_btc()))
        {
            frontend.send(bytes).await;
        }
    }

    fn broadcast(&self, bytes: Option<Vec<u8>>) {
        if let Some(bytes) = bytes {
            // Err means no frontend is connected right now.
            let _ = self.master.send(bytes);
        }
    }
}

/// Builds a notification envelope, or `None` if it cannot be encoded.
fn envelope(id: &str, account: &str, notification: Value) -> Option<Vec<u8>> {
    serde_json::to_vec(&json!({
        "result": {
            "account": account,
            "notification": notification,
        },
        "error": Value::Null,
        "id": id,
    }))
    .ok()
}
