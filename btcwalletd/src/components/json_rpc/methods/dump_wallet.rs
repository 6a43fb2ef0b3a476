use serde::Serialize;

use crate::components::{
    json_rpc::{
        error::{LegacyCode, RpcResult},
        utils::unlock_needed,
    },
    keystore::KeyStoreError,
};

use super::RpcImpl;

/// Response to a `dumpwallet` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// The WIF encodings of every key in every account.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub(crate) struct ResultType(Vec<String>);

pub(crate) async fn call(rpc: &RpcImpl) -> Response {
    let accounts = rpc.accounts.all().await;

    // No partial results: refuse up front if any account cannot export.
    for account in &accounts {
        if account.is_locked().await {
            return Err(unlock_needed());
        }
    }

    let mut keys = Vec::new();
    for account in &accounts {
        let exported = account
            .keystore()
            .read()
            .await
            .export_keys()
            .map_err(|e| match e {
                KeyStoreError::Locked => unlock_needed(),
                e => LegacyCode::Wallet.with_message(e.to_string()),
            })?;
        keys.extend(exported);
    }
    Ok(ResultType(keys))
}
