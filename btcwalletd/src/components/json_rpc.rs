//! JSON-RPC dispatch core.
//!
//! Requests arrive as raw line-delimited JSON-RPC envelopes
//! (`{method, params, id}`) from two classes of frontend: ordinary
//! request/reply clients, and long-lived bidirectional channels that may also
//! invoke extension methods and receive asynchronous notifications. Replies
//! go out as `{result, error, id}` envelopes.
//!
//! Methods with a wallet-scoped handler are served here; everything else is
//! deferred to the connected node with the request identifier rewritten so
//! the node's reply can be demultiplexed back to the originating frontend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) mod correlate;
pub(crate) mod error;
pub mod methods;
pub(crate) mod notify;
pub(crate) mod send;
pub(crate) mod utils;

use error::RpcError;

/// A handle to a connected frontend.
///
/// Cloneable; clones deliver replies to the same connection. The handle
/// carries the frontend's class: only long-lived bidirectional channels may
/// invoke channel-exclusive extension methods.
#[derive(Clone, Debug)]
pub struct FrontendHandle {
    replies: mpsc::Sender<Vec<u8>>,
    channel_exclusive: bool,
}

impl FrontendHandle {
    /// Wraps the reply queue of a frontend connection.
    ///
    /// `channel_exclusive` marks a long-lived bidirectional channel.
    pub fn new(replies: mpsc::Sender<Vec<u8>>, channel_exclusive: bool) -> Self {
        Self {
            replies,
            channel_exclusive,
        }
    }

    /// Whether this frontend may invoke channel-exclusive methods.
    pub fn is_channel(&self) -> bool {
        self.channel_exclusive
    }

    /// Whether the frontend has gone away.
    pub fn is_closed(&self) -> bool {
        self.replies.is_closed()
    }

    /// Delivers raw reply bytes to the frontend.
    ///
    /// A send to a disconnected frontend is dropped; replies have no
    /// delivery guarantee once the connection is gone.
    pub(crate) async fn send(&self, bytes: Vec<u8>) {
        if self.replies.send(bytes).await.is_err() {
            debug!("dropping reply for disconnected frontend");
        }
    }
}

/// An incoming request envelope.
///
/// Parsing is lenient: a missing or malformed `method` is detected by the
/// dispatcher rather than rejected wholesale here, and `id` defaults to
/// `null` so a reply can always be addressed.
#[derive(Debug, Deserialize)]
pub(crate) struct Request {
    #[serde(default)]
    pub(crate) method: Option<String>,
    #[serde(default)]
    pub(crate) params: Option<Value>,
    #[serde(default)]
    pub(crate) id: Value,
}

/// A reply envelope received from the node.
#[derive(Debug, Deserialize)]
pub(crate) struct NodeReply {
    #[serde(default)]
    pub(crate) result: Option<Value>,
    #[serde(default)]
    pub(crate) error: Option<RpcError>,
    #[serde(default)]
    pub(crate) id: Value,
}

#[derive(Serialize)]
struct Reply<'a> {
    result: &'a Value,
    error: Option<&'a RpcError>,
    id: &'a Value,
}

/// Serializes a `{result, error, id}` reply envelope.
///
/// All three fields are always present, with `null` standing in for an
/// absent result or error.
pub(crate) fn reply_bytes(result: Option<Value>, error: Option<RpcError>, id: &Value) -> Vec<u8> {
    let result = result.unwrap_or(Value::Null);
    let reply = Reply {
        result: &result,
        error: error.as_ref(),
        id,
    };
    // The envelope is built from values that serialized once already; this
    // cannot fail in practice, and a reply that cannot be encoded is dropped
    // rather than propagated.
    serde_json::to_vec(&reply).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::error::LegacyCode;
    use super::*;

    #[test]
    fn replies_always_carry_all_three_fields() {
        let bytes = reply_bytes(Some(serde_json::json!(42)), None, &serde_json::json!(7));
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["result"], 42);
        assert_eq!(v["error"], Value::Null);
        assert_eq!(v["id"], 7);

        let bytes = reply_bytes(
            None,
            Some(LegacyCode::InvalidRequest.with_static("invalid JSON-RPC request")),
            &Value::Null,
        );
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["result"], Value::Null);
        assert_eq!(v["error"]["code"], -32600);
        assert_eq!(v["id"], Value::Null);
    }

    #[test]
    fn request_parsing_is_lenient_about_missing_fields() {
        let req: Request = serde_json::from_slice(br#"{"method":"getinfo"}"#).unwrap();
        assert_eq!(req.method.as_deref(), Some("getinfo"));
        assert!(req.params.is_none());
        assert_eq!(req.id, Value::Null);

        let req: Request = serde_json::from_slice(br#"{"id":3}"#).unwrap();
        assert!(req.method.is_none());
    }
}
