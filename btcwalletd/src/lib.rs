//! btcwalletd
//!
//! The request-dispatch and correlation core of a bitcoin wallet daemon. The
//! daemon sits between untrusted frontends speaking JSON-RPC and a trusted
//! btcd full node: wallet-scoped methods are handled locally against a set of
//! per-account encrypted key stores, and everything else is forwarded to the
//! node with the request identifier rewritten so the reply can be routed back
//! to the frontend that asked.
//!
//! The embedding process owns the transports (frontend sockets, the node
//! link) and wires them to the channels consumed here: raw request bytes go
//! into [`RpcImpl::dispatch`], raw node replies into
//! [`RpcImpl::deliver_node_reply`], and every connected frontend subscribes
//! to the notification master channel.

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications)]

pub mod components;
pub mod config;
mod error;
pub mod network;

pub use components::chain::{BlockStamp, NodeLink};
pub use components::json_rpc::methods::RpcImpl;
pub use components::json_rpc::FrontendHandle;
pub use config::WalletdConfig;
pub use error::{Error, ErrorKind};
pub use network::Network;
