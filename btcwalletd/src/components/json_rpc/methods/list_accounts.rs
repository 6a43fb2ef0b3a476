use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::components::json_rpc::{error::RpcResult, utils::opt_minconf_param};

use super::RpcImpl;

/// Response to a `listaccounts` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// Account names mapped to their balances in BTC.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub(crate) struct ResultType(BTreeMap<String, f64>);

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let min_confirmations = opt_minconf_param(params, 0)?;
    let best_height = rpc.node.best_height().await.unwrap_or(0);

    let mut balances = BTreeMap::new();
    for account in rpc.accounts.all().await {
        balances.insert(
            account.name.clone(),
            account
                .confirmed_balance(min_confirmations, best_height)
                .await
                .to_btc(),
        );
    }
    Ok(ResultType(balances))
}
