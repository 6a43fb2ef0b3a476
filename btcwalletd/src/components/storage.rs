//! On-disk persistence for accounts.
//!
//! Each account persists as two JSON documents in the data directory: the
//! encrypted wallet file and the unspent-output file. Persistence is
//! save-on-dirty: a write happens only for the halves of an account that
//! have diverged from disk, and writes go through a temporary file and
//! rename so a crash never leaves a torn document.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Txid, address::NetworkUnchecked};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    components::{
        account::Account,
        keystore::{KeyStore, StoredKeyStore},
        utxo::{Utxo, UtxoStore},
    },
    error::{Error, ErrorKind},
    network::Network,
};

const WALLET_SUFFIX: &str = ".wallet.json";
const UTXO_SUFFIX: &str = ".utxo.json";

#[derive(Serialize, Deserialize)]
struct WalletFile {
    version: u32,
    name: String,
    keystore: StoredKeyStore,
}

#[derive(Serialize, Deserialize)]
struct UtxoFile {
    version: u32,
    utxos: Vec<StoredUtxo>,
}

#[derive(Serialize, Deserialize)]
struct StoredUtxo {
    txid: String,
    vout: u32,
    amount_sat: u64,
    address: String,
    script_pubkey: String,
    height: Option<i32>,
}

/// Handle to the daemon's data directory.
pub struct Storage {
    datadir: PathBuf,
}

impl Storage {
    /// Opens the data directory, creating it if needed.
    pub fn open(datadir: impl Into<PathBuf>) -> Result<Self, Error> {
        let datadir = datadir.into();
        std::fs::create_dir_all(&datadir).map_err(|e| ErrorKind::Storage.context(e))?;
        Ok(Self { datadir })
    }

    /// Writes the dirty halves of `account` to disk and clears their dirty
    /// flags.
    pub async fn save_account(&self, account: &Account) -> Result<(), Error> {
        {
            let mut keystore = account.keystore().write().await;
            if keystore.is_dirty() {
                let doc = WalletFile {
                    version: 1,
                    name: account.name.clone(),
                    keystore: keystore.to_stored(),
                };
                self.write_json(&self.wallet_path(&account.name), &doc)
                    .await?;
                keystore.mark_clean();
            }
        }

        {
            let mut utxos = account.utxos().lock().await;
            if utxos.is_dirty() {
                let doc = UtxoFile {
                    version: 1,
                    utxos: utxos.iter().map(store_utxo).collect(),
                };
                self.write_json(&self.utxo_path(&account.name), &doc)
                    .await?;
                utxos.mark_clean();
            }
        }

        Ok(())
    }

    /// Loads every persisted account, returning `(name, keystore, utxos)`
    /// triples. Accounts come back locked.
    pub async fn load_accounts(
        &self,
        network: Network,
    ) -> Result<Vec<(String, KeyStore, UtxoStore)>, Error> {
        let mut entries = std::fs::read_dir(&self.datadir)
            .map_err(|e| ErrorKind::Storage.context(e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ErrorKind::Storage.context(e))?;
        entries.sort_by_key(|e| e.file_name());

        let mut accounts = Vec::new();
        for entry in entries {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.ends_with(WALLET_SUFFIX) {
                continue;
            }

            let doc: WalletFile = self.read_json(&entry.path()).await?;
            if doc.keystore.network != network {
                debug!(
                    name = doc.name,
                    "skipping wallet file for another network"
                );
                continue;
            }
            let name = doc.name;
            let keystore = KeyStore::from_stored(doc.keystore)
                .map_err(|e| ErrorKind::Storage.context(e))?;

            let utxo_path = self.utxo_path(&name);
            let utxos = if utxo_path.exists() {
                let doc: UtxoFile = self.read_json(&utxo_path).await?;
                let utxos = doc
                    .utxos
                    .iter()
                    .map(|u| load_utxo(u, network))
                    .collect::<Result<Vec<_>, _>>()?;
                UtxoStore::new(utxos)
            } else {
                UtxoStore::default()
            };

            accounts.push((name, keystore, utxos));
        }
        Ok(accounts)
    }

    fn wallet_path(&self, account: &str) -> PathBuf {
        self.datadir
            .join(format!("{}{}", file_stem(account), WALLET_SUFFIX))
    }

    fn utxo_path(&self, account: &str) -> PathBuf {
        self.datadir
            .join(format!("{}{}", file_stem(account), UTXO_SUFFIX))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, doc: &T) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(|e| ErrorKind::Storage.context(e))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ErrorKind::Storage.context(e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ErrorKind::Storage.context(e))?;
        Ok(())
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<T, Error> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ErrorKind::Storage.context(e))?;
        serde_json::from_slice(&bytes).map_err(|e| ErrorKind::Storage.context(e))
    }
}

/// File-name stem for an account. The default account's empty name gets a
/// fixed stem; named accounts are prefixed so they can never collide with
/// it.
fn file_stem(account: &str) -> String {
    if account.is_empty() {
        "default".to_owned()
    } else {
        format!("account-{account}")
    }
}

/// Whether `name` is usable as an account name.
///
/// The name becomes part of the wallet's file names, so path separators and
/// traversal sequences are rejected at creation time.
pub(crate) fn account_name_is_safe(name: &str) -> bool {
    !name.contains(['/', '\\', '\0']) && name != "." && name != ".."
}

fn store_utxo(u: &Utxo) -> StoredUtxo {
    StoredUtxo {
        txid: u.outpoint.txid.to_string(),
        vout: u.outpoint.vout,
        amount_sat: u.value.to_sat(),
        address: u.address.to_string(),
        script_pubkey: hex::encode(u.script_pubkey.as_bytes()),
        height: u.height,
    }
}

fn load_utxo(u: &StoredUtxo, network: Network) -> Result<Utxo, Error> {
    let txid = Txid::from_str(&u.txid).map_err(|e| ErrorKind::Storage.context(e))?;
    let address = u
        .address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| ErrorKind::Storage.context(e))?
        .require_network(network.to_bitcoin())
        .map_err(|e| ErrorKind::Storage.context(e))?;
    let script = hex::decode(&u.script_pubkey).map_err(|e| ErrorKind::Storage.context(e))?;
    Ok(Utxo {
        outpoint: OutPoint::new(txid, u.vout),
        value: Amount::from_sat(u.amount_sat),
        address,
        script_pubkey: ScriptBuf::from_bytes(script),
        height: u.height,
    })
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use secrecy::SecretString;

    use super::*;
    use crate::components::chain::BlockStamp;

    fn test_keystore() -> KeyStore {
        KeyStore::create(
            Network::Regtest,
            "kept wallet",
            &SecretString::from("pw"),
            2,
            BlockStamp {
                height: 7,
                hash: bitcoin::BlockHash::all_zeros(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn accounts_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let mut keystore = test_keystore();
        let address = keystore.next_address().unwrap();
        let mut utxos = UtxoStore::default();
        utxos.push(Utxo {
            outpoint: OutPoint::new(Txid::all_zeros(), 3),
            value: Amount::from_sat(1234),
            script_pubkey: address.script_pubkey(),
            address: address.clone(),
            height: Some(5),
        });

        let account = Account::new("savings".into(), 1, keystore, utxos);
        storage.save_account(&account).await.unwrap();
        assert!(!account.keystore().read().await.is_dirty());
        assert!(!account.utxos().lock().await.is_dirty());

        let mut loaded = storage.load_accounts(Network::Regtest).await.unwrap();
        assert_eq!(loaded.len(), 1);
        let (name, keystore, utxos) = loaded.remove(0);
        assert_eq!(name, "savings");
        assert_eq!(keystore.description(), "kept wallet");
        assert_eq!(keystore.active_addresses(), vec![address.clone()]);
        assert_eq!(utxos.total_balance(), Amount::from_sat(1234));
        assert_eq!(utxos.iter().next().unwrap().address, address);
    }

    #[tokio::test]
    async fn clean_accounts_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let account = Account::new("idle".into(), 1, test_keystore(), UtxoStore::default());
        storage.save_account(&account).await.unwrap();
        // A second save with nothing dirty must not touch the files.
        let mtime = std::fs::metadata(storage.wallet_path("idle"))
            .unwrap()
            .modified()
            .unwrap();
        storage.save_account(&account).await.unwrap();
        assert_eq!(
            std::fs::metadata(storage.wallet_path("idle"))
                .unwrap()
                .modified()
                .unwrap(),
            mtime
        );
    }

    #[test]
    fn hostile_account_names_are_rejected() {
        assert!(account_name_is_safe(""));
        assert!(account_name_is_safe("savings"));
        assert!(!account_name_is_safe("a/b"));
        assert!(!account_name_is_safe(".."));
    }
}
