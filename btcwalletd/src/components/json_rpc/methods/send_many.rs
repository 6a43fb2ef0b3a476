use serde_json::Value;

use crate::components::json_rpc::{
    FrontendHandle,
    error::{LegacyCode, RpcResult},
    send::{self, SendRequest},
    utils::{address_param, amount_from_value, opt_minconf_param, opt_str_param, str_param},
};

use super::RpcImpl;

/// Handles a `sendmany` RPC request.
///
/// Recipients arrive as a JSON object mapping addresses to amounts in BTC.
/// As with `sendfrom`, the success reply comes from the send pipeline.
pub(crate) async fn call(
    rpc: &RpcImpl,
    params: &[Value],
    frontend: &FrontendHandle,
    id: &Value,
) -> RpcResult<()> {
    let from_account = str_param(params, 0, "fromaccount")?;
    let Some(Value::Object(amounts)) = params.get(1) else {
        return Err(LegacyCode::InvalidParams
            .with_static("Invalid parameters, amounts must be an object of address: amount."));
    };
    let min_confirmations = opt_minconf_param(params, 2)?;
    let comment = opt_str_param(params, 3, "comment", "")?;

    if amounts.is_empty() {
        return Err(
            LegacyCode::InvalidParameter.with_static("Invalid parameter, amounts is empty.")
        );
    }
    let mut recipients = Vec::with_capacity(amounts.len());
    for (address, amount) in amounts {
        recipients.push((
            address_param(address, rpc.network)?,
            amount_from_value(amount, "amount")?,
        ));
    }

    send::submit(
        rpc,
        SendRequest {
            from_account: from_account.to_owned(),
            recipients,
            min_confirmations,
            comment: (!comment.is_empty()).then(|| comment.to_owned()),
            comment_to: None,
        },
        frontend,
        id,
    )
    .await
}
