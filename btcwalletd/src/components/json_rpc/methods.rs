//! The request dispatcher and its local method handlers.
//!
//! Wallet-scoped methods are enumerated here and served by one handler
//! module each; every other method is deferred to the node. Two of the
//! local methods (`getbalances`, `walletislocked`) are reserved for
//! long-lived bidirectional frontends; invoked from an ordinary frontend
//! they fall through to the defer path like any unknown method.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{
    components::{
        account::{Account, AccountRegistry},
        chain::NodeLink,
        fees::FeeSetting,
        storage::Storage,
        unmined::UnminedPool,
    },
    config::WalletdConfig,
    error::Error,
    network::Network,
};

use super::{
    FrontendHandle, NodeReply, Request,
    correlate::{Correlation, Correlator, original_id_value, parse_rewritten_id, rewrite_id},
    error::{LegacyCode, RpcResult},
    notify::Notifier,
    reply_bytes,
    utils::params_array,
};

#[cfg(test)]
mod tests;

mod create_encrypted_wallet;
mod dump_priv_key;
mod dump_wallet;
mod get_addresses_by_account;
mod get_balance;
mod get_balances;
mod get_new_address;
mod import_priv_key;
mod list_accounts;
mod send_from;
mod send_many;
mod set_tx_fee;
mod wallet_is_locked;
mod wallet_lock;
mod wallet_passphrase;

/// The dispatch core: accounts, correlation state, and the handles every
/// local method works through.
pub struct RpcImpl {
    pub(crate) network: Network,
    pub(crate) address_pool_size: usize,
    pub(crate) require_sync: bool,
    pub(crate) accounts: Arc<AccountRegistry>,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) node: Arc<NodeLink>,
    pub(crate) notifier: Notifier,
    pub(crate) unmined: Arc<UnminedPool>,
    pub(crate) fee: Arc<FeeSetting>,
    pub(crate) storage: Arc<Storage>,
}

impl RpcImpl {
    /// Opens the data directory and assembles the dispatch core.
    ///
    /// `node_outbound` carries node-bound request bytes to the embedding
    /// transport; `master` is the notification channel every connected
    /// frontend subscribes to. Persisted accounts are loaded (locked) and
    /// re-registered for node-side tracking.
    pub async fn open(
        config: &WalletdConfig,
        node_outbound: mpsc::Sender<Vec<u8>>,
        master: broadcast::Sender<Vec<u8>>,
    ) -> Result<Self, Error> {
        let storage = Storage::open(config.datadir.clone())?;
        let rpc = Self {
            network: config.network,
            address_pool_size: config.address_pool_size,
            require_sync: config.persistence.require_sync,
            accounts: Arc::new(AccountRegistry::new()),
            correlator: Arc::new(Correlator::new()),
            node: Arc::new(NodeLink::new(node_outbound)),
            notifier: Notifier::new(master),
            unmined: Arc::new(UnminedPool::new()),
            fee: Arc::new(FeeSetting::new(bitcoin::Amount::from_sat(
                config.default_fee_sat,
            ))),
            storage: Arc::new(storage),
        };

        for (name, keystore, utxos) in rpc.storage.load_accounts(config.network).await? {
            let account = Arc::new(Account::new(
                name,
                rpc.correlator.next_seq(),
                keystore,
                utxos,
            ));
            match rpc.accounts.insert(Arc::clone(&account)).await {
                Ok(()) => rpc.track_account(&account).await,
                Err(_) => warn!(name = %account.name, "duplicate wallet file ignored"),
            }
        }

        Ok(rpc)
    }

    /// The node link, for the embedding transport to report chain state on.
    pub fn node(&self) -> &NodeLink {
        &self.node
    }

    /// Raw transactions awaiting block inclusion, for rebroadcast after the
    /// node link reconnects.
    pub async fn pending_transactions(&self) -> Vec<Vec<u8>> {
        self.unmined.raw_transactions().await
    }

    /// Drops correlation routes whose frontend has disconnected, returning
    /// how many were removed. The embedding process calls this as frontends
    /// come and go.
    pub async fn prune_disconnected_frontends(&self) -> usize {
        self.correlator.prune_disconnected().await
    }

    /// Handles one raw request from a frontend.
    ///
    /// Requests that do not parse into a command at all are answered with an
    /// `invalid request` error; commands without a local handler (including
    /// channel-exclusive commands from ordinary frontends) are deferred to
    /// the node.
    pub async fn dispatch(&self, raw: &[u8], frontend: &FrontendHandle) {
        let request: Request = match serde_json::from_slice(raw) {
            Ok(request) => request,
            Err(_) => {
                let error = LegacyCode::InvalidRequest.with_static("Invalid JSON-RPC request.");
                frontend
                    .send(reply_bytes(None, Some(error), &Value::Null))
                    .await;
                return;
            }
        };
        let id = request.id.clone();
        let Some(method) = request.method.as_deref() else {
            let error = LegacyCode::InvalidRequest.with_static("Invalid JSON-RPC request.");
            frontend.send(reply_bytes(None, Some(error), &id)).await;
            return;
        };

        // Methods without a local handler are forwarded before `params` is
        // inspected, since only local handlers understand their shapes.
        let local = matches!(
            method,
            "createencryptedwallet"
                | "dumpprivkey"
                | "dumpwallet"
                | "getaddressesbyaccount"
                | "getbalance"
                | "getnewaddress"
                | "importprivkey"
                | "listaccounts"
                | "sendfrom"
                | "sendmany"
                | "settxfee"
                | "walletlock"
                | "walletpassphrase"
        ) || (frontend.is_channel() && matches!(method, "getbalances" | "walletislocked"));
        if !local {
            self.defer(raw, frontend).await;
            return;
        }

        let params = match params_array(&request.params) {
            Ok(params) => params,
            Err(error) => {
                frontend.send(reply_bytes(None, Some(error), &id)).await;
                return;
            }
        };

        match method {
            "createencryptedwallet" => {
                self.respond(create_encrypted_wallet::call(self, params).await, &id, frontend)
                    .await
            }
            "dumpprivkey" => {
                self.respond(dump_priv_key::call(self, params).await, &id, frontend)
                    .await
            }
            "dumpwallet" => {
                self.respond(dump_wallet::call(self).await, &id, frontend)
                    .await
            }
            "getaddressesbyaccount" => {
                self.respond(
                    get_addresses_by_account::call(self, params).await,
                    &id,
                    frontend,
                )
                .await
            }
            "getbalance" => {
                self.respond(get_balance::call(self, params).await, &id, frontend)
                    .await
            }
            "getbalances" => get_balances::call(self, frontend).await,
            "getnewaddress" => {
                self.respond(get_new_address::call(self, params).await, &id, frontend)
                    .await
            }
            "importprivkey" => {
                self.respond(import_priv_key::call(self, params).await, &id, frontend)
                    .await
            }
            "listaccounts" => {
                self.respond(list_accounts::call(self, params).await, &id, frontend)
                    .await
            }
            "sendfrom" => {
                if let Err(error) = send_from::call(self, params, frontend, &id).await {
                    frontend.send(reply_bytes(None, Some(error), &id)).await;
                }
            }
            "sendmany" => {
                if let Err(error) = send_many::call(self, params, frontend, &id).await {
                    frontend.send(reply_bytes(None, Some(error), &id)).await;
                }
            }
            "settxfee" => {
                self.respond(set_tx_fee::call(self, params).await, &id, frontend)
                    .await
            }
            "walletislocked" => {
                self.respond(wallet_is_locked::call(self, params).await, &id, frontend)
                    .await
            }
            "walletlock" => {
                self.respond(wallet_lock::call(self).await, &id, frontend)
                    .await
            }
            "walletpassphrase" => {
                self.respond(wallet_passphrase::call(self, params).await, &id, frontend)
                    .await
            }
            _ => unreachable!("local method table is exhaustive"),
        }
    }

    /// Forwards a request to the node, rewriting its identifier and
    /// recording where the reply should go.
    async fn defer(&self, raw: &[u8], frontend: &FrontendHandle) {
        let mut envelope: Map<String, Value> = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                // The frontend gets no reply for a request that cannot be
                // re-encoded.
                warn!(%e, "dropping undeferrable request");
                return;
            }
        };

        let original_id = envelope.get("id").cloned().unwrap_or(Value::Null);
        let n = self.correlator.next_seq();
        envelope.insert("id".into(), Value::String(rewrite_id(n, &original_id)));

        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%e, "dropping undeferrable request");
                return;
            }
        };

        self.correlator.route_to(n, frontend.clone()).await;
        self.node.enqueue(bytes).await;
    }

    /// Demultiplexes one raw reply from the node.
    ///
    /// The rewritten identifier selects the correlation record: routed
    /// replies are forwarded with the original identifier restored, and
    /// callback records run (and are kept when they report more replies are
    /// expected). Replies with no surviving record are dropped.
    pub async fn deliver_node_reply(&self, raw: &[u8]) {
        let reply: NodeReply = match serde_json::from_slice(raw) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(%e, "unparseable node message dropped");
                return;
            }
        };
        let Value::String(id) = &reply.id else {
            debug!("node message without a rewritten identifier dropped");
            return;
        };
        let Some((n, original)) = parse_rewritten_id(id) else {
            debug!(%id, "node message without a rewritten identifier dropped");
            return;
        };

        match self.correlator.take(n).await {
            None => debug!(n, "node reply without a correlation record dropped"),
            Some(Correlation::RouteTo(frontend)) => {
                let Ok(mut envelope) = serde_json::from_slice::<Map<String, Value>>(raw) else {
                    debug!(n, "unforwardable node reply dropped");
                    return;
                };
                envelope.insert("id".into(), original_id_value(original));
                if let Ok(bytes) = serde_json::to_vec(&envelope) {
                    frontend.send(bytes).await;
                }
            }
            Some(Correlation::Handler(mut handler)) => {
                let done = handler(reply.result, reply.error).await;
                if !done {
                    self.correlator
                        .reinstall(n, Correlation::Handler(handler))
                        .await;
                }
            }
        }
    }

    /// Serializes a handler's outcome and sends it to the frontend.
    async fn respond<T: Serialize>(
        &self,
        response: RpcResult<T>,
        id: &Value,
        frontend: &FrontendHandle,
    ) {
        let bytes = match response {
            Ok(result) => match serde_json::to_value(result) {
                Ok(value) => reply_bytes(Some(value), None, id),
                Err(e) => {
                    warn!(%e, "failed to encode result");
                    reply_bytes(
                        None,
                        Some(LegacyCode::Internal.with_static("Failed to encode result.")),
                        id,
                    )
                }
            },
            Err(error) => reply_bytes(None, Some(error), id),
        };
        frontend.send(bytes).await;
    }

    /// Installs the account's notification stream record and asks the node
    /// to report transactions for all of its addresses.
    pub(crate) async fn track_account(&self, account: &Arc<Account>) {
        let name = account.name.clone();
        self.correlator
            .install_handler(
                account.notif_seq,
                Box::new(move |_, error| {
                    // Transactions paying the account's addresses stream in
                    // under this record for as long as the daemon runs;
                    // block-inclusion bookkeeping attaches here.
                    if let Some(error) = &error {
                        warn!(account = %name, %error, "account tracking request failed");
                    }
                    Box::pin(async { false })
                }),
            )
            .await;

        let addresses = account.keystore().read().await.all_addresses();
        self.node
            .track_addresses(account.notif_seq, &addresses)
            .await;
    }

    /// Persists the account according to the configured policy.
    pub(crate) async fn persist(&self, account: &Account) -> RpcResult<()> {
        persist_with(&self.storage, self.require_sync, account).await
    }
}

/// Writes the account's dirty state to disk.
///
/// With `require_sync` unset this is best-effort: the in-memory effect
/// stands and the caller's operation still succeeds.
pub(crate) async fn persist_with(
    storage: &Storage,
    require_sync: bool,
    account: &Account,
) -> RpcResult<()> {
    match storage.save_account(account).await {
        Ok(()) => Ok(()),
        Err(e) if require_sync => {
            Err(LegacyCode::Wallet.with_message(format!("Failed to write wallet state: {e}")))
        }
        Err(e) => {
            warn!(account = %account.name, %e, "failed to write wallet state");
            Ok(())
        }
    }
}
