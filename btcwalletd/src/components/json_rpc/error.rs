//! RPC error codes & their handling.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bitcoin RPC error codes
///
/// Drawn from bitcoind's `rpcprotocol.h`, which btcd and its wallets kept
/// compatibility with.
///
/// ## Notes
///
/// - All explicit discriminants fit within `i32`.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) enum LegacyCode {
    // General application defined errors
    /// `std::exception` thrown in command handling
    #[default]
    Misc = -1,
    /// Unexpected type was passed as parameter
    Type = -3,
    /// Unspecified problem with wallet
    Wallet = -4,
    /// Invalid address or key
    InvalidAddressOrKey = -5,
    /// Not enough funds in wallet or account
    WalletInsufficientFunds = -6,
    /// Ran out of memory during operation
    OutOfMemory = -7,
    /// Invalid, missing or duplicate parameter
    InvalidParameter = -8,
    /// Keypool ran out, call keypoolrefill first
    WalletKeypoolRanOut = -12,
    /// Enter the wallet passphrase with walletpassphrase first
    WalletUnlockNeeded = -13,
    /// The wallet passphrase entered was incorrect
    WalletPassphraseIncorrect = -14,
    /// Command given in wrong wallet encryption state
    WalletWrongEncState = -15,
    /// Invalid account name
    WalletInvalidAccountName = -11,
    /// Error parsing or validating structure in raw format
    Deserialization = -22,

    // P2P client errors
    /// Bitcoin is not connected
    ClientNotConnected = -9,

    // Standard JSON-RPC 2.0 errors
    /// The JSON sent is not a valid request object
    InvalidRequest = -32600,
    /// The method does not exist or is not available
    MethodNotFound = -32601,
    /// Invalid method parameters
    InvalidParams = -32602,
    /// Internal JSON-RPC error
    Internal = -32603,
    /// Invalid JSON was received by the server
    Parse = -32700,
}

impl LegacyCode {
    /// Builds an error carrying this code and a fixed message.
    pub(crate) fn with_static(self, message: &'static str) -> RpcError {
        RpcError {
            code: self as i32,
            message: message.into(),
        }
    }

    /// Builds an error carrying this code and the given message.
    pub(crate) fn with_message(self, message: impl Into<String>) -> RpcError {
        RpcError {
            code: self as i32,
            message: message.into(),
        }
    }
}

impl From<LegacyCode> for i32 {
    fn from(code: LegacyCode) -> Self {
        code as i32
    }
}

/// A JSON-RPC error object, as placed in the `error` field of a reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// The numeric error code.
    pub code: i32,
    /// A human-readable description of the failure.
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// Result type used by the local RPC method handlers.
pub(crate) type RpcResult<T> = Result<T, RpcError>;
