use serde_json::Value;

use crate::components::json_rpc::{
    error::RpcResult,
    utils::{invalid_account, opt_minconf_param, opt_str_param},
};

use super::RpcImpl;

/// Response to a `getbalance` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// The account balance in BTC at the requested confirmation depth.
pub(crate) type ResultType = f64;

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let name = opt_str_param(params, 0, "account", "")?;
    let min_confirmations = opt_minconf_param(params, 1)?;

    let account = rpc
        .accounts
        .get(name)
        .await
        .ok_or_else(|| invalid_account(name))?;

    let best_height = rpc.node.best_height().await.unwrap_or(0);
    Ok(account
        .confirmed_balance(min_confirmations, best_height)
        .await
        .to_btc())
}
