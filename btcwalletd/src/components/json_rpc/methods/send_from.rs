use serde_json::Value;

use crate::components::json_rpc::{
    FrontendHandle,
    error::RpcResult,
    send::{self, SendRequest},
    utils::{address_param, amount_param, opt_minconf_param, opt_str_param, str_param},
};

use super::RpcImpl;

/// Handles a `sendfrom` RPC request: the single-recipient form of a send.
///
/// On success the reply (the transaction id) is produced by the send
/// pipeline once the node accepts the broadcast; an error return here means
/// nothing left the wallet.
pub(crate) async fn call(
    rpc: &RpcImpl,
    params: &[Value],
    frontend: &FrontendHandle,
    id: &Value,
) -> RpcResult<()> {
    let from_account = str_param(params, 0, "fromaccount")?;
    let to_address = str_param(params, 1, "toaddress")?;
    let amount = amount_param(params, 2, "amount")?;
    let min_confirmations = opt_minconf_param(params, 3)?;
    let comment = opt_str_param(params, 4, "comment", "")?;
    let comment_to = opt_str_param(params, 5, "commentto", "")?;

    let address = address_param(to_address, rpc.network)?;

    send::submit(
        rpc,
        SendRequest {
            from_account: from_account.to_owned(),
            recipients: vec![(address, amount)],
            min_confirmations,
            comment: (!comment.is_empty()).then(|| comment.to_owned()),
            comment_to: (!comment_to.is_empty()).then(|| comment_to.to_owned()),
        },
        frontend,
        id,
    )
    .await
}
