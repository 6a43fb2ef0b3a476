use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;

use crate::components::{
    account::DEFAULT_ACCOUNT,
    json_rpc::{
        error::{LegacyCode, RpcResult},
        utils::{invalid_account, str_param, u64_param},
    },
    keystore::{self, KeyStoreError},
};

use super::RpcImpl;

/// Response to a `walletpassphrase` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// Empty result indicating success.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub(crate) struct ResultType(());

/// Stores the wallet decryption key in memory for `timeout` seconds.
///
/// Unlocking currently operates on the default account only; per-account
/// unlocking would take the account as a third parameter here and in
/// `walletlock`.
///
/// Every call schedules its own auto-lock; whichever deadline comes first
/// relocks the wallet, and timers that fire after an explicit or automatic
/// relock do nothing.
pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let passphrase = SecretString::from(str_param(params, 0, "passphrase")?.to_owned());
    let timeout = u64_param(params, 1, "timeout")?;

    let account = rpc
        .accounts
        .get(DEFAULT_ACCOUNT)
        .await
        .ok_or_else(|| invalid_account(DEFAULT_ACCOUNT))?;

    // scrypt key derivation is deliberately slow; run it off the async
    // worker threads, then install the result under the store's guard.
    let encrypted = account.keystore().read().await.encrypted_identity();
    let identity = tokio::task::spawn_blocking(move || {
        keystore::decrypt_identity(&encrypted, &passphrase)
    })
    .await
    .map_err(|e| LegacyCode::Internal.with_message(format!("unlock task failed: {e}")))?
    .map_err(passphrase_error)?;
    account
        .keystore()
        .write()
        .await
        .unlock_with(identity)
        .map_err(passphrase_error)?;

    rpc.notifier.broadcast_lock_state(&account.name, false);

    // The auto-lock must fire even if the requesting frontend is long gone,
    // so it runs detached and reports through the broadcast channel.
    let notifier = rpc.notifier.clone();
    let account = Arc::clone(&account);
    tokio::task::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout)).await;
        let relocked = account.keystore().write().await.lock().is_ok();
        if relocked {
            notifier.broadcast_lock_state(&account.name, true);
        }
    });

    Ok(ResultType(()))
}

fn passphrase_error(e: KeyStoreError) -> crate::components::json_rpc::error::RpcError {
    match e {
        KeyStoreError::PassphraseIncorrect => LegacyCode::WalletPassphraseIncorrect
            .with_static("Error: The wallet passphrase entered was incorrect."),
        e => LegacyCode::Wallet.with_message(e.to_string()),
    }
}
