use bitcoin::PrivateKey;
use serde::Serialize;
use serde_json::Value;

use crate::components::{
    json_rpc::{
        error::{LegacyCode, RpcResult},
        utils::{invalid_account, opt_bool_param, opt_height_param, opt_str_param, str_param,
                unlock_needed},
    },
    keystore::KeyStoreError,
};

use super::RpcImpl;

/// Response to an `importprivkey` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// Empty result indicating success.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub(crate) struct ResultType(());

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let wif = str_param(params, 0, "privkey")?;
    let label = opt_str_param(params, 1, "label", "")?;
    let rescan = opt_bool_param(params, 2, "rescan", true)?;
    // Nothing is known about the key's history, so the rescan starts at the
    // worst case unless the caller can narrow it.
    let from_height = opt_height_param(params, 3, "height")?.unwrap_or(0);

    let key = PrivateKey::from_wif(wif).map_err(|_| {
        LegacyCode::InvalidAddressOrKey.with_static("Invalid private key encoding.")
    })?;

    let account = rpc
        .accounts
        .get(label)
        .await
        .ok_or_else(|| invalid_account(label))?;

    let address = account
        .keystore()
        .write()
        .await
        .import_key(key, from_height)
        .map_err(|e| match e {
            KeyStoreError::Locked => unlock_needed(),
            KeyStoreError::WrongNetwork => {
                LegacyCode::InvalidAddressOrKey.with_message(e.to_string())
            }
            e => LegacyCode::Wallet.with_message(e.to_string()),
        })?;

    rpc.persist(&account).await?;
    rpc.node
        .track_addresses(account.notif_seq, std::slice::from_ref(&address))
        .await;
    if rescan {
        rpc.node
            .rescan(&rpc.correlator, from_height, std::slice::from_ref(&address))
            .await;
    }

    Ok(ResultType(()))
}
