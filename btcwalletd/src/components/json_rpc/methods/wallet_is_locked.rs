use serde_json::Value;

use crate::components::json_rpc::{
    error::RpcResult,
    utils::{invalid_account, opt_str_param},
};

use super::RpcImpl;

/// Response to a `walletislocked` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// `true` iff no key material is in memory for the account.
pub(crate) type ResultType = bool;

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let name = opt_str_param(params, 0, "account", "")?;

    let account = rpc
        .accounts
        .get(name)
        .await
        .ok_or_else(|| invalid_account(name))?;

    Ok(account.is_locked().await)
}
