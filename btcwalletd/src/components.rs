//! Components of btcwalletd.

pub mod account;
pub mod chain;
pub(crate) mod fees;
pub mod json_rpc;
pub mod keystore;
pub mod storage;
pub mod tracing;
pub(crate) mod unmined;
pub mod utxo;
