use bitcoin::Amount;

use crate::components::json_rpc::FrontendHandle;

use super::RpcImpl;

/// Sends one confirmed- and one unconfirmed-balance notification per account
/// to the invoking frontend. Produces no RPC reply.
pub(crate) async fn call(rpc: &RpcImpl, frontend: &FrontendHandle) {
    let best_height = rpc.node.best_height().await.unwrap_or(0);

    for account in rpc.accounts.all().await {
        let confirmed = account.confirmed_balance(1, best_height).await;
        let total = account.total_balance().await;
        rpc.notifier
            .send_balance(frontend, &account.name, confirmed)
            .await;
        rpc.notifier
            .send_balance_unconfirmed(
                frontend,
                &account.name,
                total.checked_sub(confirmed).unwrap_or(Amount::ZERO),
            )
            .await;
    }
}
