use serde::Serialize;
use serde_json::Value;

use crate::components::json_rpc::{
    error::RpcResult,
    utils::{invalid_account, str_param},
};

use super::RpcImpl;

/// Response to a `getaddressesbyaccount` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// The payment addresses active for the account, in allocation order.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub(crate) struct ResultType(Vec<String>);

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let name = str_param(params, 0, "account")?;

    let account = rpc
        .accounts
        .get(name)
        .await
        .ok_or_else(|| invalid_account(name))?;

    let addresses = account
        .keystore()
        .read()
        .await
        .active_addresses()
        .iter()
        .map(|a| a.to_string())
        .collect();
    Ok(ResultType(addresses))
}
