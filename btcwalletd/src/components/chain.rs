//! The link to the backing btcd full node.
//!
//! The transport itself (connection management, reconnection) lives in the
//! embedding process; this component owns what the dispatch core needs from
//! it: the outbound request queue, the last block the node reported, and the
//! requests that register address and output tracking with the node.

use std::fmt;

use bitcoin::{Address, BlockHash, OutPoint};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::components::json_rpc::correlate::{Correlator, rewrite_id};

/// A chain position: block height and hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockStamp {
    /// The block's height.
    pub height: i32,
    /// The block's hash.
    pub hash: BlockHash,
}

/// Error raised when an operation needs the node synchronously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeError {
    /// No node is connected, or it has not reported a block yet.
    Disconnected,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Disconnected => write!(f, "btcd disconnected"),
        }
    }
}

impl std::error::Error for NodeError {}

/// Handle to the connected node.
pub struct NodeLink {
    outbound: mpsc::Sender<Vec<u8>>,
    best_block: RwLock<Option<BlockStamp>>,
}

impl NodeLink {
    /// Wraps the node-outbound queue. The link starts without a known best
    /// block; the embedding transport reports one via
    /// [`NodeLink::set_best_block`] once the node does.
    pub fn new(outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            outbound,
            best_block: RwLock::new(None),
        }
    }

    /// Records the node's best block, as reported by the transport.
    pub async fn set_best_block(&self, stamp: BlockStamp) {
        *self.best_block.write().await = Some(stamp);
    }

    /// The node's best block.
    pub async fn best_block(&self) -> Result<BlockStamp, NodeError> {
        self.best_block.read().await.ok_or(NodeError::Disconnected)
    }

    /// The node's best height, if one has been reported.
    pub async fn best_height(&self) -> Option<i32> {
        self.best_block.read().await.map(|b| b.height)
    }

    /// Enqueues raw request bytes for the node.
    ///
    /// With no node connected the queue's receiver is gone and the bytes are
    /// dropped; the daemon stays up and the request is simply lost.
    pub(crate) async fn enqueue(&self, bytes: Vec<u8>) {
        if self.outbound.send(bytes).await.is_err() {
            warn!("dropping node-bound request: no node connected");
        }
    }

    /// Asks the node to report transactions paying any of `addresses`,
    /// streamed under the account's notification sequence number `seq`.
    pub(crate) async fn track_addresses(&self, seq: u64, addresses: &[Address]) {
        if addresses.is_empty() {
            return;
        }
        let request = json!({
            "method": "notifynewtxs",
            "params": [addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>()],
            "id": rewrite_id(seq, &Value::Null),
        });
        self.enqueue_request(&request).await;
    }

    /// Asks the node to report when `outpoint` is spent.
    pub(crate) async fn notify_spent(&self, correlator: &Correlator, outpoint: OutPoint) {
        let n = correlator.next_seq();
        correlator
            .install_handler(
                n,
                Box::new(move |_, error| {
                    if let Some(error) = error {
                        warn!(%outpoint, %error, "spent-output notification request failed");
                    }
                    Box::pin(async { true })
                }),
            )
            .await;
        let request = json!({
            "method": "notifyspent",
            "params": [outpoint.txid.to_string(), outpoint.vout],
            "id": rewrite_id(n, &Value::Null),
        });
        self.enqueue_request(&request).await;
    }

    /// Asks the node to replay chain history for `addresses` starting at
    /// `from_height`, so past payments to an imported key are discovered.
    pub(crate) async fn rescan(
        &self,
        correlator: &Correlator,
        from_height: i32,
        addresses: &[Address],
    ) {
        let n = correlator.next_seq();
        correlator
            .install_handler(
                n,
                Box::new(move |_, error| {
                    if let Some(error) = error {
                        warn!(from_height, %error, "rescan request failed");
                    }
                    Box::pin(async { true })
                }),
            )
            .await;
        let request = json!({
            "method": "rescan",
            "params": [
                from_height,
                addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            ],
            "id": rewrite_id(n, &Value::Null),
        });
        self.enqueue_request(&request).await;
    }

    async fn enqueue_request(&self, request: &Value) {
        match serde_json::to_vec(request) {
            Ok(bytes) => self.enqueue(bytes).await,
            Err(e) => debug!(%e, "failed to encode node-bound request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    fn stamp(height: i32) -> BlockStamp {
        BlockStamp {
            height,
            hash: BlockHash::all_zeros(),
        }
    }

    #[tokio::test]
    async fn best_block_is_disconnected_until_reported() {
        let (tx, _rx) = mpsc::channel(1);
        let node = NodeLink::new(tx);
        assert_eq!(node.best_block().await, Err(NodeError::Disconnected));
        assert_eq!(node.best_height().await, None);

        node.set_best_block(stamp(123)).await;
        assert_eq!(node.best_block().await.unwrap().height, 123);
        assert_eq!(node.best_height().await, Some(123));
    }

    #[tokio::test]
    async fn enqueue_to_a_gone_node_is_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let node = NodeLink::new(tx);
        // Must not error or panic.
        node.enqueue(b"{}".to_vec()).await;
    }

    #[tokio::test]
    async fn tracking_requests_carry_correlatable_ids() {
        let (tx, mut rx) = mpsc::channel(8);
        let node = NodeLink::new(tx);
        let correlator = Correlator::new();

        let outpoint = OutPoint::new(bitcoin::Txid::all_zeros(), 1);
        node.notify_spent(&correlator, outpoint).await;

        let bytes = rx.recv().await.unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["method"], "notifyspent");
        let id = v["id"].as_str().unwrap();
        let (n, original) =
            crate::components::json_rpc::correlate::parse_rewritten_id(id).unwrap();
        assert_eq!(original, "null");
        assert!(correlator.contains(n).await);
    }
}
