//! Accounts and the account registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitcoin::Amount;
use tokio::sync::{Mutex, RwLock};

use crate::components::{
    keystore::KeyStore,
    utxo::UtxoStore,
};

/// The name of the default account.
pub const DEFAULT_ACCOUNT: &str = "";

/// A named wallet: an encrypted key store plus the unspent outputs paying
/// its addresses.
pub struct Account {
    /// The account's name; the empty string names the default account.
    pub name: String,
    /// Correlation number under which the node streams new-transaction
    /// notifications for this account's addresses.
    pub notif_seq: u64,
    keystore: RwLock<KeyStore>,
    utxos: Mutex<UtxoStore>,
}

impl Account {
    /// Assembles an account from its parts.
    pub fn new(name: String, notif_seq: u64, keystore: KeyStore, utxos: UtxoStore) -> Self {
        Self {
            name,
            notif_seq,
            keystore: RwLock::new(keystore),
            utxos: Mutex::new(utxos),
        }
    }

    /// The account's key store, behind its guard.
    pub fn keystore(&self) -> &RwLock<KeyStore> {
        &self.keystore
    }

    /// The account's unspent-output store, behind its guard.
    pub fn utxos(&self) -> &Mutex<UtxoStore> {
        &self.utxos
    }

    /// Whether the account's key material is locked out of memory.
    pub async fn is_locked(&self) -> bool {
        self.keystore.read().await.is_locked()
    }

    /// Balance confirmed to the given depth at the given chain height.
    pub async fn confirmed_balance(&self, min_confirmations: u32, best_height: i32) -> Amount {
        self.utxos
            .lock()
            .await
            .confirmed_balance(min_confirmations, best_height)
    }

    /// Balance including unmined outputs.
    pub async fn total_balance(&self) -> Amount {
        self.utxos.lock().await.total_balance()
    }
}

/// The set of accounts the daemon serves, keyed by name.
///
/// An account exists here iff it has been persisted or is in the process of
/// being persisted; accounts are never removed. The registry guard is held
/// only while membership is being read or extended.
#[derive(Default)]
pub struct AccountRegistry {
    accounts: Mutex<BTreeMap<String, Arc<Account>>>,
}

/// Error returned when creating an account whose name is taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountExists;

impl AccountRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an account by name.
    pub async fn get(&self, name: &str) -> Option<Arc<Account>> {
        self.accounts.lock().await.get(name).cloned()
    }

    /// Adds an account, failing if the name is already present. The check
    /// and the insert happen atomically under the registry guard.
    pub async fn insert(&self, account: Arc<Account>) -> Result<(), AccountExists> {
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(&account.name) {
            return Err(AccountExists);
        }
        accounts.insert(account.name.clone(), account);
        Ok(())
    }

    /// Every account, in registry (name) order.
    pub async fn all(&self) -> Vec<Arc<Account>> {
        self.accounts.lock().await.values().cloned().collect()
    }

    /// Number of registered accounts.
    pub async fn len(&self) -> usize {
        self.accounts.lock().await.len()
    }

    /// Whether the registry holds no accounts.
    pub async fn is_empty(&self) -> bool {
        self.accounts.lock().await.is_empty()
    }
}
