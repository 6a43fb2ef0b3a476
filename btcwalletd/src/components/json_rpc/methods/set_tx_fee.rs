use serde_json::Value;

use crate::components::json_rpc::{error::RpcResult, utils::amount_param};

use super::RpcImpl;

/// Response to a `settxfee` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// `true` on success.
pub(crate) type ResultType = bool;

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    // A rejected amount leaves the previous fee in place.
    let amount = amount_param(params, 0, "amount")?;
    rpc.fee.set(amount).await;
    Ok(true)
}
