use serde_json::Value;

use crate::components::{
    json_rpc::{
        error::{LegacyCode, RpcResult},
        utils::{invalid_account, opt_str_param},
    },
    keystore::KeyStoreError,
};

use super::RpcImpl;

/// Response to a `getnewaddress` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// The newly allocated payment address.
pub(crate) type ResultType = String;

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let name = opt_str_param(params, 0, "account", "")?;

    let account = rpc
        .accounts
        .get(name)
        .await
        .ok_or_else(|| invalid_account(name))?;

    let address = account
        .keystore()
        .write()
        .await
        .next_address()
        .map_err(|e| match e {
            KeyStoreError::PoolExhausted => {
                LegacyCode::Internal.with_static("address pool exhausted")
            }
            e => LegacyCode::Internal.with_message(e.to_string()),
        })?;

    rpc.persist(&account).await?;
    rpc.node
        .track_addresses(account.notif_seq, std::slice::from_ref(&address))
        .await;

    Ok(address.to_string())
}
