//! Correlation of node replies with their originators.
//!
//! Every request the daemon sends to the node carries a rewritten identifier
//! embedding a fresh correlation number. When the node's reply comes back,
//! the number selects a record describing what to do with it: hand the reply
//! to a waiting frontend, or run a callback that acts on it first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use super::FrontendHandle;
use super::error::RpcError;

/// Identifier prefix marking requests issued by this daemon.
pub(crate) const DAEMON_TAG: &str = "btcwallet";

/// A callback run on the node's reply.
///
/// Returning `true` consumes the record; `false` keeps it installed for
/// further replies under the same correlation number (used for notification
/// streams).
pub(crate) type ReplyHandler =
    Box<dyn FnMut(Option<Value>, Option<RpcError>) -> BoxFuture<'static, bool> + Send>;

/// What to do with a node reply.
pub(crate) enum Correlation {
    /// Restore the original identifier and forward the reply to this
    /// frontend.
    RouteTo(FrontendHandle),
    /// Run this callback on the reply's result and error.
    Handler(ReplyHandler),
}

/// Allocator and record table for correlation numbers.
///
/// Numbers are allocated monotonically and used in at most one record; the
/// routing and callback cases share one table, so a number can never be
/// installed as both.
pub(crate) struct Correlator {
    next: AtomicU64,
    records: Mutex<HashMap<u64, Correlation>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh correlation number.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Records that the reply for `n` should be forwarded to `frontend`.
    pub(crate) async fn route_to(&self, n: u64, frontend: FrontendHandle) {
        self.install(n, Correlation::RouteTo(frontend)).await;
    }

    /// Records a callback to run on the reply for `n`.
    pub(crate) async fn install_handler(&self, n: u64, handler: ReplyHandler) {
        self.install(n, Correlation::Handler(handler)).await;
    }

    async fn install(&self, n: u64, correlation: Correlation) {
        let mut records = self.records.lock().await;
        if records.insert(n, correlation).is_some() {
            // Numbers come from `next_seq`, so a collision means a caller
            // reused one.
            warn!(n, "replaced an existing correlation record");
        }
    }

    /// Removes and returns the record for `n`.
    ///
    /// The caller runs any handler without the table guard held, and puts
    /// the record back with [`Correlator::reinstall`] if it is not done.
    pub(crate) async fn take(&self, n: u64) -> Option<Correlation> {
        self.records.lock().await.remove(&n)
    }

    /// Puts back a record taken with [`Correlator::take`].
    pub(crate) async fn reinstall(&self, n: u64, correlation: Correlation) {
        self.install(n, correlation).await;
    }

    /// Drops routing records whose frontend has disconnected, returning how
    /// many were removed. Callback records are kept; they do their own
    /// delivery and consume themselves.
    pub(crate) async fn prune_disconnected(&self) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| match record {
            Correlation::RouteTo(frontend) => !frontend.is_closed(),
            Correlation::Handler(_) => true,
        });
        before - records.len()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, n: u64) -> bool {
        self.records.lock().await.contains_key(&n)
    }
}

/// Rewrites a frontend identifier for a node-bound request.
///
/// The form is `"btcwallet(<n>)-<original>"` with the original identifier's
/// raw JSON text appended, so both `7` and `"seven"` survive the round trip
/// exactly.
pub(crate) fn rewrite_id(n: u64, original: &Value) -> String {
    format!("{DAEMON_TAG}({n})-{original}")
}

/// Splits a rewritten identifier back into its correlation number and the
/// original identifier's raw JSON text.
///
/// The number is the digit run before the first `)`, which is unambiguous
/// even when the original identifier itself contains the daemon tag or
/// parentheses.
pub(crate) fn parse_rewritten_id(id: &str) -> Option<(u64, &str)> {
    let rest = id.strip_prefix(DAEMON_TAG)?.strip_prefix('(')?;
    let close = rest.find(')')?;
    let n = rest[..close].parse().ok()?;
    let original = rest[close + 1..].strip_prefix('-')?;
    Some((n, original))
}

/// Recovers the original identifier value from its raw JSON text.
///
/// Replies pass through foreign software; if the text comes back mangled it
/// is preserved as an opaque string rather than dropped.
pub(crate) fn original_id_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn allocation_is_monotonic_from_one() {
        let correlator = Correlator::new();
        assert_eq!(correlator.next_seq(), 1);
        assert_eq!(correlator.next_seq(), 2);
        assert_eq!(correlator.next_seq(), 3);
    }

    #[test]
    fn rewritten_ids_round_trip() {
        for (id, raw) in [
            (json!(7), "7"),
            (json!("x"), "\"x\""),
            (json!(null), "null"),
            (json!([1, "two"]), "[1,\"two\"]"),
            // An original identifier that is itself a rewritten identifier.
            (json!("btcwallet(2)-9"), "\"btcwallet(2)-9\""),
            (json!("a-)b("), "\"a-)b(\""),
        ] {
            let rewritten = rewrite_id(41, &id);
            let (n, original) = parse_rewritten_id(&rewritten).unwrap();
            assert_eq!(n, 41);
            assert_eq!(original, raw);
            assert_eq!(original_id_value(original), id);
        }
    }

    #[test]
    fn malformed_rewritten_ids_are_rejected() {
        assert!(parse_rewritten_id("7").is_none());
        assert!(parse_rewritten_id("btcwallet(x)-7").is_none());
        assert!(parse_rewritten_id("btcwallet(1)7").is_none());
        assert!(parse_rewritten_id("otherwallet(1)-7").is_none());
    }

    #[tokio::test]
    async fn records_are_consumed_on_take() {
        let correlator = Correlator::new();
        let (tx, _rx) = mpsc::channel(1);
        let n = correlator.next_seq();
        correlator.route_to(n, FrontendHandle::new(tx, false)).await;

        assert!(correlator.contains(n).await);
        assert!(correlator.take(n).await.is_some());
        assert!(correlator.take(n).await.is_none());
    }

    #[tokio::test]
    async fn each_number_holds_at_most_one_record() {
        let correlator = Correlator::new();
        let (tx, _rx) = mpsc::channel(1);

        // Distinct allocations never collide, regardless of record kind.
        let route = correlator.next_seq();
        let handler = correlator.next_seq();
        correlator
            .route_to(route, FrontendHandle::new(tx, false))
            .await;
        correlator
            .install_handler(handler, Box::new(|_, _| Box::pin(async { true })))
            .await;

        assert!(correlator.contains(route).await);
        assert!(correlator.contains(handler).await);
        assert_ne!(route, handler);
    }

    #[tokio::test]
    async fn pruning_removes_routes_for_dead_frontends() {
        let correlator = Correlator::new();

        let (live_tx, _live_rx) = mpsc::channel(1);
        let live = correlator.next_seq();
        correlator
            .route_to(live, FrontendHandle::new(live_tx, false))
            .await;

        let (dead_tx, dead_rx) = mpsc::channel(1);
        let dead = correlator.next_seq();
        correlator
            .route_to(dead, FrontendHandle::new(dead_tx, false))
            .await;
        drop(dead_rx);

        assert_eq!(correlator.prune_disconnected().await, 1);
        assert!(correlator.contains(live).await);
        assert!(!correlator.contains(dead).await);
    }
}
