//! The send pipeline.
//!
//! A send runs in three phases:
//!
//! 1. **Build** (local): select unspent outputs, construct and sign a
//!    transaction paying the recipients, with change to a freshly allocated
//!    account address when the inputs overshoot.
//! 2. **Broadcast** (deferred): wrap the raw transaction in a
//!    `sendrawtransaction` call to the node, with a reply callback installed
//!    under a fresh correlation number.
//! 3. **Post-accept** (local, from the callback): apply the spend to the
//!    account's unspent-output store, retain the transaction for
//!    rebroadcast, persist, notify balances, and finally answer the
//!    originating frontend with the transaction id.
//!
//! The frontend sees nothing between phases; its reply is produced only by
//! the callback, with whatever error the node returned on rejection.

use std::fmt;
use std::sync::Arc;

use bitcoin::{
    Address, Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Witness,
    absolute::LockTime,
    hashes::Hash,
    script::{Builder, PushBytesBuf},
    secp256k1::{Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
};
use serde_json::{Value, json};
use tracing::warn;

use crate::components::{
    account::Account,
    keystore::KeyStoreError,
    unmined::CreatedTx,
    utxo::Utxo,
};

use super::{
    FrontendHandle,
    correlate::rewrite_id,
    error::{LegacyCode, RpcError, RpcResult},
    methods::{RpcImpl, persist_with},
    reply_bytes,
    utils::{invalid_account, unlock_needed},
};

/// The unified input of `sendfrom` and `sendmany`; `sendfrom` is the
/// single-recipient special case.
pub(crate) struct SendRequest {
    pub(crate) from_account: String,
    pub(crate) recipients: Vec<(Address, Amount)>,
    pub(crate) min_confirmations: u32,
    pub(crate) comment: Option<String>,
    pub(crate) comment_to: Option<String>,
}

/// Failures while constructing a transaction.
#[derive(Debug)]
pub(crate) enum BuildError {
    /// A recipient amount was zero (negative amounts never reach the build).
    NonPositiveAmount,
    /// No combination of eligible outputs covers the payment plus fee.
    InsufficientFunds,
    /// The payment or fee total does not fit in an amount.
    ValueOutOfRange,
    /// Allocating the change address failed.
    ChangeAddress(KeyStoreError),
    /// Producing an input signature failed.
    Signing(KeyStoreError),
    /// Computing a signature hash failed.
    Sighash(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveAmount => write!(f, "amount must be positive"),
            Self::InsufficientFunds => write!(f, "insufficient funds"),
            Self::ValueOutOfRange => write!(f, "amount out of range"),
            Self::ChangeAddress(e) => write!(f, "failed to allocate change address: {e}"),
            Self::Signing(e) => write!(f, "failed to sign transaction: {e}"),
            Self::Sighash(e) => write!(f, "failed to hash transaction: {e}"),
        }
    }
}

impl BuildError {
    /// The error surfaced to the frontend when the build fails.
    pub(crate) fn into_rpc(self) -> RpcError {
        match self {
            Self::NonPositiveAmount => {
                LegacyCode::InvalidParameter.with_static("Invalid parameter, amount must be positive.")
            }
            Self::InsufficientFunds => LegacyCode::Internal.with_static("insufficient funds"),
            Self::ValueOutOfRange => {
                LegacyCode::InvalidParameter.with_static("Invalid parameter, amount out of range.")
            }
            Self::Signing(KeyStoreError::Locked) | Self::ChangeAddress(KeyStoreError::Locked) => {
                unlock_needed()
            }
            other => LegacyCode::Internal.with_message(other.to_string()),
        }
    }
}

/// Runs the build and broadcast phases for a send request.
///
/// On success the frontend owes its reply to the installed callback; an
/// error return means nothing was broadcast and the caller replies with it.
pub(crate) async fn submit(
    rpc: &RpcImpl,
    request: SendRequest,
    frontend: &FrontendHandle,
    id: &Value,
) -> RpcResult<()> {
    let account = rpc
        .accounts
        .get(&request.from_account)
        .await
        .ok_or_else(|| invalid_account(&request.from_account))?;

    if account.is_locked().await {
        return Err(unlock_needed());
    }

    // The fee is read here, at pricing time, not snapshotted earlier.
    let fee = rpc.fee.get().await;
    let best_height = rpc.node.best_height().await.unwrap_or(0);

    let created = build_transaction(&account, &request, fee, best_height)
        .await
        .map_err(BuildError::into_rpc)?;

    if let Some(change_address) = &created.change_address {
        // The change address left the pool: persist the allocation and have
        // the node report transactions paying it from now on.
        rpc.persist(&account).await?;
        rpc.node
            .track_addresses(account.notif_seq, std::slice::from_ref(change_address))
            .await;
    }

    broadcast(rpc, account, created, frontend, id).await;
    Ok(())
}

/// Builds and signs a transaction spending the account's eligible outputs.
pub(crate) async fn build_transaction(
    account: &Account,
    request: &SendRequest,
    fee: Amount,
    best_height: i32,
) -> Result<CreatedTx, BuildError> {
    if request.recipients.iter().any(|(_, amount)| *amount == Amount::ZERO) {
        return Err(BuildError::NonPositiveAmount);
    }

    let paid: Amount = request
        .recipients
        .iter()
        .try_fold(Amount::ZERO, |acc, (_, amount)| acc.checked_add(*amount))
        .ok_or(BuildError::ValueOutOfRange)?;
    let target = paid.checked_add(fee).ok_or(BuildError::ValueOutOfRange)?;

    // Greedy selection in store order until the target is covered.
    let eligible = account
        .utxos()
        .lock()
        .await
        .eligible(request.min_confirmations, best_height);
    let mut selected = Vec::new();
    let mut selected_total = Amount::ZERO;
    for utxo in eligible {
        if selected_total >= target {
            break;
        }
        selected_total = selected_total
            .checked_add(utxo.value)
            .ok_or(BuildError::ValueOutOfRange)?;
        selected.push(utxo);
    }
    if selected_total < target {
        return Err(BuildError::InsufficientFunds);
    }

    let change_value = selected_total - target;
    let change_address = if change_value > Amount::ZERO {
        let address = account
            .keystore()
            .write()
            .await
            .next_address()
            .map_err(BuildError::ChangeAddress)?;
        Some(address)
    } else {
        None
    };

    let mut tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: request
            .recipients
            .iter()
            .map(|(address, amount)| TxOut {
                value: *amount,
                script_pubkey: address.script_pubkey(),
            })
            .chain(change_address.iter().map(|address| TxOut {
                value: change_value,
                script_pubkey: address.script_pubkey(),
            }))
            .collect(),
    };

    // Sign every input before any signature is attached; the signature hash
    // of a legacy input covers the empty script slots.
    let secp = Secp256k1::new();
    let keystore = account.keystore().read().await;
    let mut script_sigs = Vec::with_capacity(selected.len());
    {
        let cache = SighashCache::new(&tx);
        for (index, utxo) in selected.iter().enumerate() {
            let sighash = cache
                .legacy_signature_hash(index, &utxo.script_pubkey, EcdsaSighashType::All.to_u32())
                .map_err(|e| BuildError::Sighash(e.to_string()))?;
            let key = keystore
                .signing_key(&utxo.address)
                .map_err(BuildError::Signing)?;
            let signature = secp.sign_ecdsa(
                &Message::from_digest(sighash.to_byte_array()),
                &key.inner,
            );

            let mut signature_bytes = signature.serialize_der().to_vec();
            signature_bytes.push(EcdsaSighashType::All as u8);
            let signature_push =
                PushBytesBuf::try_from(signature_bytes).expect("DER signatures fit in a push");
            script_sigs.push(
                Builder::new()
                    .push_slice(signature_push)
                    .push_key(&key.public_key(&secp))
                    .into_script(),
            );
        }
    }
    drop(keystore);
    for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
        input.script_sig = script_sig;
    }

    let txid = tx.compute_txid();
    let change = change_address.as_ref().map(|address| Utxo {
        outpoint: OutPoint::new(txid, request.recipients.len() as u32),
        value: change_value,
        script_pubkey: address.script_pubkey(),
        address: address.clone(),
        height: None,
    });

    Ok(CreatedTx {
        raw: bitcoin::consensus::encode::serialize(&tx),
        txid,
        consumed: selected,
        change,
        change_address,
        comment: request.comment.clone(),
        comment_to: request.comment_to.clone(),
    })
}

/// Sends the built transaction to the node and installs the post-accept
/// callback under a fresh correlation number.
async fn broadcast(
    rpc: &RpcImpl,
    account: Arc<Account>,
    created: CreatedTx,
    frontend: &FrontendHandle,
    id: &Value,
) {
    let n = rpc.correlator.next_seq();
    let request = json!({
        "method": "sendrawtransaction",
        "params": [hex::encode(&created.raw)],
        "id": rewrite_id(n, &Value::Null),
    });

    let state = PostAccept {
        account,
        notifier: rpc.notifier.clone(),
        unmined: Arc::clone(&rpc.unmined),
        node: Arc::clone(&rpc.node),
        correlator: Arc::clone(&rpc.correlator),
        storage: Arc::clone(&rpc.storage),
        require_sync: rpc.require_sync,
        frontend: frontend.clone(),
        id: id.clone(),
    };
    let mut created = Some(created);
    rpc.correlator
        .install_handler(
            n,
            Box::new(move |result, error| {
                let state = state.clone();
                let created = created.take();
                Box::pin(async move {
                    match created {
                        Some(created) => state.run(created, result, error).await,
                        None => true,
                    }
                })
            }),
        )
        .await;

    match serde_json::to_vec(&request) {
        Ok(bytes) => rpc.node.enqueue(bytes).await,
        Err(e) => warn!(%e, "failed to encode sendrawtransaction request"),
    }
}

/// Everything the post-accept callback needs once the node has answered.
#[derive(Clone)]
struct PostAccept {
    account: Arc<Account>,
    notifier: super::notify::Notifier,
    unmined: Arc<crate::components::unmined::UnminedPool>,
    node: Arc<crate::components::chain::NodeLink>,
    correlator: Arc<super::correlate::Correlator>,
    storage: Arc<crate::components::storage::Storage>,
    require_sync: bool,
    frontend: FrontendHandle,
    id: Value,
}

impl PostAccept {
    async fn run(self, created: CreatedTx, result: Option<Value>, error: Option<RpcError>) -> bool {
        if let Some(error) = error {
            self.frontend
                .send(reply_bytes(None, Some(error), &self.id))
                .await;
            return true;
        }

        // The node answers a successful broadcast with the txid string;
        // echo its value back to the frontend.
        let txid_result = result.unwrap_or_else(|| Value::String(created.txid.to_string()));

        {
            let mut utxos = self.account.utxos().lock().await;
            for spent in &created.consumed {
                utxos.remove(&spent.outpoint);
            }
            if let Some(change) = &created.change {
                utxos.push(change.clone());
            }
        }

        if let Some(change) = &created.change {
            self.node
                .notify_spent(&self.correlator, change.outpoint)
                .await;
        }

        // Both the spend and the pool entry must be visible before any
        // balance notification goes out, so a frontend reacting to the
        // notification reads the new state.
        self.unmined.insert(created).await;

        if let Err(error) = persist_with(&self.storage, self.require_sync, &self.account).await {
            self.frontend
                .send(reply_bytes(None, Some(error), &self.id))
                .await;
            return true;
        }

        let best_height = self.node.best_height().await.unwrap_or(0);
        let confirmed = self.account.confirmed_balance(1, best_height).await;
        let total = self.account.total_balance().await;
        self.notifier.broadcast_balance(&self.account.name, confirmed);
        self.notifier.broadcast_balance_unconfirmed(
            &self.account.name,
            total.checked_sub(confirmed).unwrap_or(Amount::ZERO),
        );

        self.frontend
            .send(reply_bytes(Some(txid_result), None, &self.id))
            .await;
        true
    }
}
