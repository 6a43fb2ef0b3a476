use std::str::FromStr;
use std::time::Duration;

use bitcoin::{Amount, OutPoint, Transaction, Txid, hashes::Hash, secp256k1::Secp256k1};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

use crate::{
    components::{
        chain::BlockStamp,
        json_rpc::{
            FrontendHandle,
            notify::{NTFN_BALANCE, NTFN_BALANCE_UNCONFIRMED, NTFN_LOCK_STATE},
        },
        utxo::Utxo,
    },
    config::WalletdConfig,
    network::Network,
};

use super::RpcImpl;

struct Harness {
    rpc: RpcImpl,
    node_rx: mpsc::Receiver<Vec<u8>>,
    notifications: broadcast::Receiver<Vec<u8>>,
    _datadir: tempfile::TempDir,
}

async fn harness_offline() -> Harness {
    let datadir = tempfile::tempdir().unwrap();
    let config = WalletdConfig {
        network: Network::Regtest,
        datadir: datadir.path().to_path_buf(),
        address_pool_size: 4,
        default_fee_sat: 10,
        ..WalletdConfig::default()
    };
    let (node_tx, node_rx) = mpsc::channel(64);
    let (master, notifications) = broadcast::channel(64);
    let rpc = RpcImpl::open(&config, node_tx, master).await.unwrap();
    Harness {
        rpc,
        node_rx,
        notifications,
        _datadir: datadir,
    }
}

async fn harness() -> Harness {
    let h = harness_offline().await;
    h.rpc
        .node()
        .set_best_block(BlockStamp {
            height: 100,
            hash: bitcoin::BlockHash::all_zeros(),
        })
        .await;
    h
}

fn frontend(channel_exclusive: bool) -> (FrontendHandle, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel(64);
    (FrontendHandle::new(tx, channel_exclusive), rx)
}

async fn dispatch(rpc: &RpcImpl, frontend: &FrontendHandle, request: Value) {
    rpc.dispatch(&serde_json::to_vec(&request).unwrap(), frontend)
        .await;
}

async fn recv_json(rx: &mut mpsc::Receiver<Vec<u8>>) -> Value {
    serde_json::from_slice(&rx.recv().await.expect("a message")).unwrap()
}

async fn recv_notification(rx: &mut broadcast::Receiver<Vec<u8>>) -> Value {
    serde_json::from_slice(&rx.recv().await.expect("a notification")).unwrap()
}

async fn create_default_account(h: &mut Harness) {
    let (fe, mut fe_rx) = frontend(false);
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "createencryptedwallet", "params": ["", "", "pw"], "id": 0}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"], Value::Null, "{reply}");

    // Drain the creation's balance notifications and tracking request.
    recv_notification(&mut h.notifications).await;
    recv_notification(&mut h.notifications).await;
    while h.node_rx.try_recv().is_ok() {}
}

async fn unlock_default_account(h: &mut Harness, timeout: u64) {
    let (fe, mut fe_rx) = frontend(false);
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "walletpassphrase", "params": ["pw", timeout], "id": "u"}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"], Value::Null, "{reply}");

    let ntfn = recv_notification(&mut h.notifications).await;
    assert_eq!(ntfn["id"], NTFN_LOCK_STATE);
    assert_eq!(ntfn["result"]["notification"], false);
}

fn seed_utxo(n: u8, address: &bitcoin::Address, value: Amount, height: Option<i32>) -> Utxo {
    Utxo {
        outpoint: OutPoint::new(Txid::from_str(&format!("{:064x}", n)).unwrap(), 0),
        value,
        script_pubkey: address.script_pubkey(),
        address: address.clone(),
        height,
    }
}

fn external_address() -> bitcoin::Address {
    let secp = Secp256k1::new();
    let key = bitcoin::PrivateKey::new(
        bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng()),
        bitcoin::Network::Regtest,
    );
    bitcoin::Address::p2pkh(key.public_key(&secp), bitcoin::Network::Regtest)
}

#[tokio::test]
async fn unknown_methods_defer_and_replies_route_back() {
    let mut h = harness().await;
    let (fe, mut fe_rx) = frontend(false);

    dispatch(&h.rpc, &fe, json!({"method": "getblockcount", "id": 7})).await;

    let outbound = recv_json(&mut h.node_rx).await;
    assert_eq!(outbound["method"], "getblockcount");
    let rewritten = outbound["id"].as_str().unwrap().to_owned();
    assert_eq!(rewritten, "btcwallet(1)-7");

    let node_reply = serde_json::to_vec(&json!({"result": 12345, "id": rewritten})).unwrap();
    h.rpc.deliver_node_reply(&node_reply).await;

    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["result"], 12345);
    assert_eq!(reply["id"], 7);

    // The record was consumed: a replayed reply goes nowhere.
    h.rpc.deliver_node_reply(&node_reply).await;
    assert!(fe_rx.try_recv().is_err());
}

#[tokio::test]
async fn unparseable_requests_are_answered_not_deferred() {
    let mut h = harness().await;
    let (fe, mut fe_rx) = frontend(false);

    h.rpc.dispatch(b"not json at all", &fe).await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"]["code"], -32600);
    assert_eq!(reply["id"], Value::Null);

    dispatch(&h.rpc, &fe, json!({"id": 3})).await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"]["code"], -32600);
    assert_eq!(reply["id"], 3);

    assert!(h.node_rx.try_recv().is_err());
}

#[tokio::test]
async fn channel_exclusive_methods_defer_for_ordinary_frontends() {
    let mut h = harness().await;
    let (ordinary, _fe_rx) = frontend(false);

    dispatch(&h.rpc, &ordinary, json!({"method": "getbalances", "id": "x"})).await;

    let outbound = recv_json(&mut h.node_rx).await;
    assert_eq!(outbound["method"], "getbalances");
    let rewritten = outbound["id"].as_str().unwrap();
    assert!(rewritten.starts_with("btcwallet("));
    // The original string identifier is embedded with its JSON quoting.
    assert!(rewritten.ends_with("-\"x\""));
}

#[tokio::test]
async fn create_encrypted_wallet_registers_and_notifies() {
    let mut h = harness().await;
    let (fe, mut fe_rx) = frontend(false);

    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "createencryptedwallet", "params": ["savings", "test wallet", "pw"], "id": 1}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["result"], Value::Null);
    assert_eq!(reply["error"], Value::Null);

    // Zero balances are broadcast to every frontend, confirmed first.
    let ntfn = recv_notification(&mut h.notifications).await;
    assert_eq!(ntfn["id"], NTFN_BALANCE);
    assert_eq!(ntfn["result"]["account"], "savings");
    assert_eq!(ntfn["result"]["notification"], 0.0);
    let ntfn = recv_notification(&mut h.notifications).await;
    assert_eq!(ntfn["id"], NTFN_BALANCE_UNCONFIRMED);
    assert_eq!(ntfn["result"]["notification"], 0.0);

    // The node is asked to watch the new wallet's address pool.
    let outbound = recv_json(&mut h.node_rx).await;
    assert_eq!(outbound["method"], "notifynewtxs");
    assert_eq!(outbound["params"][0].as_array().unwrap().len(), 4);

    // A second creation under the same name fails and changes nothing.
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "createencryptedwallet", "params": ["savings", "", "other"], "id": 2}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"]["code"], -11);

    dispatch(&h.rpc, &fe, json!({"method": "listaccounts", "id": 3})).await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["result"], json!({"savings": 0.0}));
}

#[tokio::test]
async fn create_encrypted_wallet_needs_a_live_node() {
    let h = harness_offline().await;
    let (fe, mut fe_rx) = frontend(false);

    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "createencryptedwallet", "params": ["savings", "", "pw"], "id": 1}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"]["code"], -32603);
    assert_eq!(reply["error"]["message"], "btcd disconnected");
    assert!(h.rpc.accounts.get("savings").await.is_none());
}

#[tokio::test]
async fn unlock_lock_unlock_emits_ordered_lock_state_notifications() {
    let mut h = harness().await;
    create_default_account(&mut h).await;

    unlock_default_account(&mut h, 6000).await;

    let (fe, mut fe_rx) = frontend(false);
    dispatch(&h.rpc, &fe, json!({"method": "walletlock", "id": 9})).await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"], Value::Null);
    let ntfn = recv_notification(&mut h.notifications).await;
    assert_eq!(ntfn["id"], NTFN_LOCK_STATE);
    assert_eq!(ntfn["result"]["notification"], true);

    unlock_default_account(&mut h, 6000).await;

    // Exactly three lock-state transitions were announced.
    assert!(h.notifications.try_recv().is_err());

    let (channel, mut channel_rx) = frontend(true);
    dispatch(&h.rpc, &channel, json!({"method": "walletislocked", "id": 5})).await;
    let reply = recv_json(&mut channel_rx).await;
    assert_eq!(reply["result"], false);
}

#[tokio::test]
async fn wrong_passphrase_is_rejected_without_unlocking() {
    let mut h = harness().await;
    create_default_account(&mut h).await;

    let (fe, mut fe_rx) = frontend(false);
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "walletpassphrase", "params": ["not the passphrase", 60], "id": 1}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"]["code"], -14);
    assert!(h.notifications.try_recv().is_err());

    let (channel, mut channel_rx) = frontend(true);
    dispatch(&h.rpc, &channel, json!({"method": "walletislocked", "id": 2})).await;
    let reply = recv_json(&mut channel_rx).await;
    assert_eq!(reply["result"], true);
}

#[tokio::test(start_paused = true)]
async fn auto_lock_fires_after_the_timeout() {
    let mut h = harness().await;
    create_default_account(&mut h).await;
    unlock_default_account(&mut h, 2).await;

    // The unlocking frontend is gone; the relock still happens and is
    // announced on the master channel.
    let ntfn = recv_notification(&mut h.notifications).await;
    assert_eq!(ntfn["id"], NTFN_LOCK_STATE);
    assert_eq!(ntfn["result"]["notification"], true);

    let (fe, mut fe_rx) = frontend(false);
    dispatch(&h.rpc, &fe, json!({"method": "getnewaddress", "id": 1})).await;
    let reply = recv_json(&mut fe_rx).await;
    let address = reply["result"].as_str().unwrap().to_owned();

    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "dumpprivkey", "params": [address], "id": 2}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"]["code"], -13);
}

#[tokio::test(start_paused = true)]
async fn auto_lock_is_a_no_op_after_an_explicit_relock() {
    let mut h = harness().await;
    create_default_account(&mut h).await;
    unlock_default_account(&mut h, 2).await;

    let (fe, mut fe_rx) = frontend(false);
    dispatch(&h.rpc, &fe, json!({"method": "walletlock", "id": 1})).await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"], Value::Null);
    let ntfn = recv_notification(&mut h.notifications).await;
    assert_eq!(ntfn["result"]["notification"], true);

    // Ride past the timer; the already-locked wallet stays quiet.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.notifications.try_recv().is_err());
}

#[tokio::test]
async fn send_from_applies_spend_and_notifies_after_node_accept() {
    let mut h = harness().await;
    create_default_account(&mut h).await;
    unlock_default_account(&mut h, 6000).await;

    let (fe, mut fe_rx) = frontend(false);
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "settxfee", "params": [0.0000001], "id": "fee"}),
    )
    .await;
    assert_eq!(recv_json(&mut fe_rx).await["result"], true);

    // Two confirmed 60-satoshi outputs paying the account.
    let account = h.rpc.accounts.get("").await.unwrap();
    let (first, second) = {
        let mut keystore = account.keystore().write().await;
        (
            keystore.next_address().unwrap(),
            keystore.next_address().unwrap(),
        )
    };
    {
        let mut utxos = account.utxos().lock().await;
        utxos.push(seed_utxo(1, &first, Amount::from_sat(60), Some(95)));
        utxos.push(seed_utxo(2, &second, Amount::from_sat(60), Some(96)));
    }

    let recipient = external_address();
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "sendfrom", "params": ["", recipient.to_string(), 0.000001, 1], "id": 77}),
    )
    .await;

    // No reply yet; the frontend hears back only once the node answers.
    assert!(fe_rx.try_recv().is_err());

    // The freshly allocated change address is registered for tracking,
    // then the transaction goes out.
    let outbound = recv_json(&mut h.node_rx).await;
    assert_eq!(outbound["method"], "notifynewtxs");
    let outbound = recv_json(&mut h.node_rx).await;
    assert_eq!(outbound["method"], "sendrawtransaction");

    let raw = hex::decode(outbound["params"][0].as_str().unwrap()).unwrap();
    let tx: Transaction = bitcoin::consensus::encode::deserialize(&raw).unwrap();
    assert_eq!(tx.input.len(), 2);
    assert_eq!(tx.output.len(), 2);
    assert_eq!(tx.output[0].value, Amount::from_sat(100));
    assert_eq!(tx.output[0].script_pubkey, recipient.script_pubkey());
    assert_eq!(tx.output[1].value, Amount::from_sat(10));
    let txid = tx.compute_txid();

    let node_reply =
        serde_json::to_vec(&json!({"result": txid.to_string(), "id": outbound["id"]})).unwrap();
    h.rpc.deliver_node_reply(&node_reply).await;

    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["id"], 77);
    assert_eq!(reply["result"].as_str().unwrap(), txid.to_string());

    assert!(h.rpc.unmined.contains(&txid).await);
    {
        let utxos = account.utxos().lock().await;
        assert_eq!(utxos.len(), 1);
        let change = utxos.iter().next().unwrap();
        assert_eq!(change.outpoint, OutPoint::new(txid, 1));
        assert_eq!(change.value, Amount::from_sat(10));
        assert_eq!(change.height, None);
    }

    // Confirmed and unconfirmed balances are broadcast, in that order,
    // reflecting the post-spend state.
    let ntfn = recv_notification(&mut h.notifications).await;
    assert_eq!(ntfn["id"], NTFN_BALANCE);
    assert_eq!(ntfn["result"]["notification"], 0.0);
    let ntfn = recv_notification(&mut h.notifications).await;
    assert_eq!(ntfn["id"], NTFN_BALANCE_UNCONFIRMED);
    assert_eq!(
        ntfn["result"]["notification"],
        Amount::from_sat(10).to_btc()
    );
}

#[tokio::test]
async fn failed_send_preconditions_change_nothing() {
    let mut h = harness().await;
    create_default_account(&mut h).await;

    let account = h.rpc.accounts.get("").await.unwrap();
    let address = account.keystore().write().await.next_address().unwrap();
    account
        .utxos()
        .lock()
        .await
        .push(seed_utxo(1, &address, Amount::from_sat(60), Some(95)));

    let recipient = external_address().to_string();
    let (fe, mut fe_rx) = frontend(false);

    // Locked wallet.
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "sendfrom", "params": ["", recipient, 0.0000001], "id": 1}),
    )
    .await;
    assert_eq!(recv_json(&mut fe_rx).await["error"]["code"], -13);

    // Unknown account.
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "sendfrom", "params": ["nope", recipient, 0.0000001], "id": 2}),
    )
    .await;
    assert_eq!(recv_json(&mut fe_rx).await["error"]["code"], -11);

    // Negative amount.
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "sendfrom", "params": ["", recipient, -1], "id": 3}),
    )
    .await;
    assert_eq!(recv_json(&mut fe_rx).await["error"]["code"], -8);

    unlock_default_account(&mut h, 6000).await;

    // Zero amount is caught by the build.
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "sendfrom", "params": ["", recipient, 0], "id": 4}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"]["code"], -8);
    assert_eq!(
        reply["error"]["message"],
        "Invalid parameter, amount must be positive."
    );

    // More than the account holds.
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "sendfrom", "params": ["", recipient, 1.0], "id": 5}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"]["code"], -32603);
    assert_eq!(reply["error"]["message"], "insufficient funds");

    // Nothing was spent, broadcast, or enqueued.
    assert_eq!(account.utxos().lock().await.total_balance(), Amount::from_sat(60));
    assert_eq!(h.rpc.unmined.len().await, 0);
    assert!(h.node_rx.try_recv().is_err());
}

#[tokio::test]
async fn settxfee_boundaries() {
    let h = harness().await;
    let (fe, mut fe_rx) = frontend(false);

    dispatch(&h.rpc, &fe, json!({"method": "settxfee", "params": [0], "id": 1})).await;
    assert_eq!(recv_json(&mut fe_rx).await["result"], true);
    assert_eq!(h.rpc.fee.get().await, Amount::ZERO);

    dispatch(&h.rpc, &fe, json!({"method": "settxfee", "params": [-1], "id": 2})).await;
    assert_eq!(recv_json(&mut fe_rx).await["error"]["code"], -8);
    assert_eq!(h.rpc.fee.get().await, Amount::ZERO);

    dispatch(&h.rpc, &fe, json!({"method": "settxfee", "params": [0.0001], "id": 3})).await;
    assert_eq!(recv_json(&mut fe_rx).await["result"], true);
    assert_eq!(h.rpc.fee.get().await, Amount::from_sat(10_000));
}

#[tokio::test]
async fn new_addresses_show_up_in_the_account_listing() {
    let mut h = harness().await;
    create_default_account(&mut h).await;

    let (fe, mut fe_rx) = frontend(false);
    dispatch(&h.rpc, &fe, json!({"method": "getnewaddress", "id": 1})).await;
    let reply = recv_json(&mut fe_rx).await;
    let address = reply["result"].as_str().unwrap().to_owned();

    // The node is told to watch the address.
    let outbound = recv_json(&mut h.node_rx).await;
    assert_eq!(outbound["method"], "notifynewtxs");
    assert_eq!(outbound["params"][0], json!([address]));

    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "getaddressesbyaccount", "params": [""], "id": 2}),
    )
    .await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["result"], json!([address]));
}

#[tokio::test]
async fn getbalances_streams_balances_to_the_invoking_channel() {
    let mut h = harness().await;
    create_default_account(&mut h).await;

    let account = h.rpc.accounts.get("").await.unwrap();
    let address = account.keystore().write().await.next_address().unwrap();
    {
        let mut utxos = account.utxos().lock().await;
        utxos.push(seed_utxo(1, &address, Amount::from_sat(100_000_000), Some(95)));
        utxos.push(seed_utxo(2, &address, Amount::from_sat(50_000_000), None));
    }

    let (channel, mut channel_rx) = frontend(true);
    dispatch(&h.rpc, &channel, json!({"method": "getbalances", "id": "b"})).await;

    let ntfn = recv_json(&mut channel_rx).await;
    assert_eq!(ntfn["id"], NTFN_BALANCE);
    assert_eq!(ntfn["result"]["account"], "");
    assert_eq!(ntfn["result"]["notification"], 1.0);
    let ntfn = recv_json(&mut channel_rx).await;
    assert_eq!(ntfn["id"], NTFN_BALANCE_UNCONFIRMED);
    assert_eq!(ntfn["result"]["notification"], 0.5);

    // No RPC reply follows the notifications.
    assert!(channel_rx.try_recv().is_err());
}

#[tokio::test]
async fn minconf_zero_admits_unmined_outputs() {
    let mut h = harness().await;
    create_default_account(&mut h).await;
    unlock_default_account(&mut h, 6000).await;

    let account = h.rpc.accounts.get("").await.unwrap();
    let address = account.keystore().write().await.next_address().unwrap();
    account
        .utxos()
        .lock()
        .await
        .push(seed_utxo(1, &address, Amount::from_sat(60), None));

    let recipient = external_address().to_string();
    let (fe, mut fe_rx) = frontend(false);

    // With the default minconf of 1 the unmined output is invisible.
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "sendfrom", "params": ["", recipient, 0.0000005, 1], "id": 1}),
    )
    .await;
    assert_eq!(recv_json(&mut fe_rx).await["error"]["code"], -32603);

    // minconf 0 spends it; 60 in, 50 out, 10 fee leaves no change.
    dispatch(
        &h.rpc,
        &fe,
        json!({"method": "sendfrom", "params": ["", recipient, 0.0000005, 0], "id": 2}),
    )
    .await;
    let outbound = recv_json(&mut h.node_rx).await;
    assert_eq!(outbound["method"], "sendrawtransaction");
    let raw = hex::decode(outbound["params"][0].as_str().unwrap()).unwrap();
    let tx: Transaction = bitcoin::consensus::encode::deserialize(&raw).unwrap();
    assert_eq!(tx.output.len(), 1);

    let node_reply = serde_json::to_vec(
        &json!({"result": tx.compute_txid().to_string(), "id": outbound["id"]}),
    )
    .unwrap();
    h.rpc.deliver_node_reply(&node_reply).await;
    let reply = recv_json(&mut fe_rx).await;
    assert_eq!(reply["error"], Value::Null);
    assert!(account.utxos().lock().await.is_empty());
}
