use serde_json::Value;

use crate::components::{
    json_rpc::{
        error::{LegacyCode, RpcResult},
        utils::{address_param, str_param, unlock_needed},
    },
    keystore::KeyStoreError,
};

use super::RpcImpl;

/// Response to a `dumpprivkey` RPC request.
pub(crate) type Response = RpcResult<ResultType>;

/// The WIF encoding of the key backing the address.
pub(crate) type ResultType = String;

pub(crate) async fn call(rpc: &RpcImpl, params: &[Value]) -> Response {
    let address = address_param(str_param(params, 0, "address")?, rpc.network)?;

    for account in rpc.accounts.all().await {
        let keystore = account.keystore().read().await;
        if !keystore.contains(&address) {
            // Not this account; try the next.
            continue;
        }
        if keystore.is_locked() {
            return Err(unlock_needed());
        }
        return keystore.wif_for_address(&address).map_err(|e| match e {
            KeyStoreError::Locked => unlock_needed(),
            e => LegacyCode::Wallet.with_message(e.to_string()),
        });
    }

    Err(LegacyCode::Wallet.with_static("address does not refer to a key"))
}
