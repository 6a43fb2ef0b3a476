use serde::Serialize;

use crate::components::{
    account::DEFAULT_ACCOUNT,
    json_rpc::{
        error::{LegacyCode, RpcResult},
        utils::invalid_account,
    },
};

use super::RpcImpl;

/// Response to a `walletlock` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// Empty result indicating success.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub(crate) struct ResultType(());

// Locking currently operates on the default account only; see
// `wallet_passphrase` for the matching unlock scope.
pub(crate) async fn call(rpc: &RpcImpl) -> Response {
    let account = rpc
        .accounts
        .get(DEFAULT_ACCOUNT)
        .await
        .ok_or_else(|| invalid_account(DEFAULT_ACCOUNT))?;

    account.keystore().write().await.lock().map_err(|_| {
        LegacyCode::WalletWrongEncState.with_static("Error: Wallet is already locked.")
    })?;
    rpc.notifier.broadcast_lock_state(&account.name, true);

    Ok(ResultType(()))
}
