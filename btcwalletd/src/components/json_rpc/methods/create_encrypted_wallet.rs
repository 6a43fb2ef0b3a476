use std::sync::Arc;

use bitcoin::Amount;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;

use crate::components::{
    account::Account,
    json_rpc::{
        error::{LegacyCode, RpcResult},
        utils::str_param,
    },
    keystore::KeyStore,
    storage::account_name_is_safe,
    utxo::UtxoStore,
};

use super::RpcImpl;

/// Response to a `createencryptedwallet` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// Empty result indicating success.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub(crate) struct ResultType(());

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let name = str_param(params, 0, "account")?;
    let description = str_param(params, 1, "description")?.to_owned();
    let passphrase = SecretString::from(str_param(params, 2, "passphrase")?.to_owned());

    if !account_name_is_safe(name) {
        return Err(LegacyCode::WalletInvalidAccountName
            .with_message(format!("Invalid account name: {name:?}")));
    }
    if rpc.accounts.get(name).await.is_some() {
        return Err(account_exists(name));
    }

    // The new wallet is stamped with the chain position it was created at,
    // which needs a live node.
    let created_at = rpc
        .node
        .best_block()
        .await
        .map_err(|e| LegacyCode::Internal.with_message(e.to_string()))?;

    let network = rpc.network;
    let pool_size = rpc.address_pool_size;
    let keystore = tokio::task::spawn_blocking(move || {
        KeyStore::create(network, &description, &passphrase, pool_size, created_at)
    })
    .await
    .map_err(|e| LegacyCode::Internal.with_message(format!("creation task failed: {e}")))?
    .map_err(|e| LegacyCode::Wallet.with_message(e.to_string()))?;

    let account = Arc::new(Account::new(
        name.to_owned(),
        rpc.correlator.next_seq(),
        keystore,
        UtxoStore::default(),
    ));
    // The membership check and insert are atomic under the registry guard;
    // a lost race surfaces the same error as the check above.
    rpc.accounts
        .insert(Arc::clone(&account))
        .await
        .map_err(|_| account_exists(name))?;

    rpc.track_account(&account).await;
    rpc.persist(&account).await?;

    rpc.notifier.broadcast_balance(&account.name, Amount::ZERO);
    rpc.notifier
        .broadcast_balance_unconfirmed(&account.name, Amount::ZERO);

    Ok(ResultType(()))
}

fn account_exists(name: &str) -> crate::components::json_rpc::error::RpcError {
    LegacyCode::WalletInvalidAccountName
        .with_message(format!("Invalid account name: {name:?} already exists."))
}
