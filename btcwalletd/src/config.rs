//! btcwalletd Config

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, ErrorKind},
    network::Network,
};

/// btcwalletd Configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct WalletdConfig {
    /// The network the daemon operates on.
    pub network: Network,

    /// Directory holding the per-account wallet and unspent-output files.
    pub datadir: PathBuf,

    /// Number of payment addresses generated when a wallet is created.
    ///
    /// Addresses are handed out from this pool by `getnewaddress` and for
    /// transaction change; an exhausted pool fails address allocation until
    /// the wallet is recreated.
    pub address_pool_size: usize,

    /// The miner fee, in satoshis, attached to wallet-built transactions
    /// until the first `settxfee` call.
    pub default_fee_sat: u64,

    /// Persistence behavior.
    pub persistence: PersistenceSection,
}

/// Persistence configuration settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PersistenceSection {
    /// Whether a failure to write wallet state to disk fails the RPC that
    /// caused the write.
    ///
    /// When unset, persistence is best-effort: the operation's in-memory
    /// effect stands, the write error is logged, and the frontend still sees
    /// success.
    pub require_sync: bool,
}

/// Default configuration settings.
impl Default for WalletdConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            datadir: PathBuf::from("walletdata"),
            address_pool_size: 100,
            default_fee_sat: 10_000,
            persistence: PersistenceSection::default(),
        }
    }
}

impl WalletdConfig {
    /// Loads the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path).map_err(|e| ErrorKind::Init.context(e))?;
        toml::from_str(&data).map_err(|e| ErrorKind::Init.context(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = WalletdConfig::default();
        let rendered = toml::to_string(&config).unwrap();
        let parsed: WalletdConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.network, config.network);
        assert_eq!(parsed.datadir, config.datadir);
        assert_eq!(parsed.address_pool_size, config.address_pool_size);
        assert_eq!(parsed.default_fee_sat, config.default_fee_sat);
        assert_eq!(
            parsed.persistence.require_sync,
            config.persistence.require_sync
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<WalletdConfig>("nonsense = true").is_err());
    }
}
