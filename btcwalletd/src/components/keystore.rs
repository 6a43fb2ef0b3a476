//! The btcwalletd key store.
//!
//! # Design
//!
//! Each account owns one key store: a pool of payment keys generated when the
//! account is created, plus any keys imported later. Key material never sits
//! on disk (or in memory, while locked) in the clear.
//!
//! The store uses [`age`] for encryption, in two layers:
//!
//! - Key material (the WIF-encoded private keys) is encrypted to an
//!   account-specific age identity's recipient. Encryption is asymmetric, so
//!   re-encrypting after a key import only needs the public recipient.
//! - The age identity itself is encrypted with the wallet passphrase.
//!   Unlocking decrypts the identity and caches it in memory; every signing
//!   or export operation decrypts the key material on demand through the
//!   cached identity. Locking evicts the identity, after which no key
//!   material is recoverable until the next unlock.
//!
//! The public halves (payment addresses) are kept in the clear so address
//! queries and balance tracking work against a locked wallet.

use std::fmt;
use std::io::{Read, Write};
use std::iter;

use bitcoin::{Address, PrivateKey, secp256k1::Secp256k1};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::components::chain::BlockStamp;
use crate::network::Network;

/// Errors raised by the key store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyStoreError {
    /// The operation needs key material but the store is locked.
    Locked,
    /// A lock was requested while no key material was in memory.
    AlreadyLocked,
    /// The supplied passphrase did not decrypt the store's identity.
    PassphraseIncorrect,
    /// Every pre-generated address has been handed out.
    PoolExhausted,
    /// The address is not backed by a key in this store.
    UnknownAddress,
    /// The key being imported is already present.
    DuplicateKey,
    /// The key being imported was encoded for a different network.
    WrongNetwork,
    /// An encryption, decryption, or encoding failure.
    Crypto(String),
}

impl fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "wallet is locked"),
            Self::AlreadyLocked => write!(f, "wallet is already locked"),
            Self::PassphraseIncorrect => {
                write!(f, "the wallet passphrase entered was incorrect")
            }
            Self::PoolExhausted => write!(f, "address pool exhausted"),
            Self::UnknownAddress => write!(f, "address does not refer to a key"),
            Self::DuplicateKey => write!(f, "key is already present in the wallet"),
            Self::WrongNetwork => write!(f, "private key is encoded for a different network"),
            Self::Crypto(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for KeyStoreError {}

/// A key imported from outside the pre-generated pool.
#[derive(Clone, Debug)]
struct ImportedKey {
    address: Address,
    /// Worst-case height at which the key's address may first have received
    /// funds; rescans for the address start here.
    height: i32,
}

/// Serialized secret half of the store, the plaintext under `ciphertext`.
#[derive(Serialize, Deserialize)]
struct KeyMaterial {
    /// WIF keys backing the address pool, index-aligned with it.
    pool: Vec<String>,
    /// WIF keys imported after creation, index-aligned with the imported
    /// address list.
    imported: Vec<String>,
}

/// An account's encrypted key store.
pub struct KeyStore {
    network: Network,
    description: String,
    created_at: BlockStamp,

    /// Recipient the key material is encrypted to.
    recipient: age::x25519::Recipient,
    /// The store's age identity, encrypted with the wallet passphrase.
    encrypted_identity: Vec<u8>,
    /// Key material, encrypted to `recipient`.
    ciphertext: Vec<u8>,
    /// The in-memory decryption identity while unlocked.
    identity: Option<age::x25519::Identity>,

    /// Public half of the pool, index-aligned with the encrypted WIFs.
    pool: Vec<Address>,
    /// Pool addresses below this index have been handed out.
    next_unused: usize,
    imported: Vec<ImportedKey>,

    dirty: bool,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("network", &self.network)
            .field("locked", &self.identity.is_none())
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Creates a new encrypted key store with a freshly generated address
    /// pool. The store starts out locked.
    pub fn create(
        network: Network,
        description: &str,
        passphrase: &SecretString,
        pool_size: usize,
        created_at: BlockStamp,
    ) -> Result<Self, KeyStoreError> {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();

        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let mut pool = Vec::with_capacity(pool_size);
        let mut pool_wifs = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let key = PrivateKey::new(
                bitcoin::secp256k1::SecretKey::new(&mut rng),
                network.to_bitcoin(),
            );
            pool.push(Address::p2pkh(key.public_key(&secp), network.to_bitcoin()));
            pool_wifs.push(key.to_wif());
        }

        let ciphertext = encrypt_material(
            &recipient,
            &KeyMaterial {
                pool: pool_wifs,
                imported: Vec::new(),
            },
        )?;
        let encrypted_identity = encrypt_identity(&identity, passphrase)?;

        Ok(Self {
            network,
            description: description.to_owned(),
            created_at,
            recipient,
            encrypted_identity,
            ciphertext,
            identity: None,
            pool,
            next_unused: 0,
            imported: Vec::new(),
            dirty: true,
        })
    }

    /// Returns `true` if no key material is recoverable from memory.
    pub fn is_locked(&self) -> bool {
        self.identity.is_none()
    }

    /// The passphrase-encrypted identity blob, for out-of-lock decryption.
    pub fn encrypted_identity(&self) -> Vec<u8> {
        self.encrypted_identity.clone()
    }

    /// Installs a decrypted identity, moving the store to the unlocked state.
    ///
    /// The identity must be the one this store's key material is encrypted
    /// to; a mismatch is reported as an incorrect passphrase since that is
    /// the only way one can arise.
    pub fn unlock_with(&mut self, identity: age::x25519::Identity) -> Result<(), KeyStoreError> {
        if identity.to_public().to_string() != self.recipient.to_string() {
            return Err(KeyStoreError::PassphraseIncorrect);
        }
        self.identity = Some(identity);
        Ok(())
    }

    /// Convenience unlock for callers that can afford to block on scrypt.
    pub fn unlock(&mut self, passphrase: &SecretString) -> Result<(), KeyStoreError> {
        let identity = decrypt_identity(&self.encrypted_identity, passphrase)?;
        self.unlock_with(identity)
    }

    /// Evicts the in-memory identity, locking the store.
    pub fn lock(&mut self) -> Result<(), KeyStoreError> {
        match self.identity.take() {
            Some(_) => Ok(()),
            None => Err(KeyStoreError::AlreadyLocked),
        }
    }

    /// Hands out the next unused pool address.
    pub fn next_address(&mut self) -> Result<Address, KeyStoreError> {
        // TODO: derive a replacement batch of keys here once the pool runs
        // low, instead of failing at exhaustion.
        let address = self
            .pool
            .get(self.next_unused)
            .cloned()
            .ok_or(KeyStoreError::PoolExhausted)?;
        self.next_unused += 1;
        self.dirty = true;
        Ok(address)
    }

    /// Payment addresses active for the account: every pool address already
    /// handed out plus all imported addresses, in allocation order.
    pub fn active_addresses(&self) -> Vec<Address> {
        self.pool[..self.next_unused]
            .iter()
            .chain(self.imported.iter().map(|k| &k.address))
            .cloned()
            .collect()
    }

    /// Every address backed by a key in this store, handed out or not.
    pub fn all_addresses(&self) -> Vec<Address> {
        self.pool
            .iter()
            .chain(self.imported.iter().map(|k| &k.address))
            .cloned()
            .collect()
    }

    /// Whether `address` is backed by a key in this store.
    pub fn contains(&self, address: &Address) -> bool {
        self.pool.iter().any(|a| a == address)
            || self.imported.iter().any(|k| &k.address == address)
    }

    /// The WIF encoding of the key backing `address`.
    pub fn wif_for_address(&self, address: &Address) -> Result<String, KeyStoreError> {
        let material = self.material()?;
        if let Some(index) = self.pool.iter().position(|a| a == address) {
            return Ok(material.pool[index].clone());
        }
        if let Some(index) = self.imported.iter().position(|k| &k.address == address) {
            return Ok(material.imported[index].clone());
        }
        Err(KeyStoreError::UnknownAddress)
    }

    /// WIF encodings of every key in the store, pool keys first.
    pub fn export_keys(&self) -> Result<Vec<String>, KeyStoreError> {
        let material = self.material()?;
        Ok(material.pool.into_iter().chain(material.imported).collect())
    }

    /// The signing key for `address`.
    pub fn signing_key(&self, address: &Address) -> Result<PrivateKey, KeyStoreError> {
        let wif = self.wif_for_address(address)?;
        PrivateKey::from_wif(&wif).map_err(|e| KeyStoreError::Crypto(e.to_string()))
    }

    /// Installs an externally supplied key, returning its payment address.
    ///
    /// `height` is the worst-case height at which the address may first
    /// appear on-chain.
    pub fn import_key(&mut self, key: PrivateKey, height: i32) -> Result<Address, KeyStoreError> {
        if key.network != self.network.to_bitcoin().into() {
            return Err(KeyStoreError::WrongNetwork);
        }

        let secp = Secp256k1::new();
        let address = Address::p2pkh(key.public_key(&secp), self.network.to_bitcoin());
        if self.contains(&address) {
            return Err(KeyStoreError::DuplicateKey);
        }

        let mut material = self.material()?;
        material.imported.push(key.to_wif());
        self.ciphertext = encrypt_material(&self.recipient, &material)?;
        self.imported.push(ImportedKey {
            address: address.clone(),
            height,
        });
        self.dirty = true;
        Ok(address)
    }

    /// The network this store's keys are encoded for.
    pub fn network(&self) -> Network {
        self.network
    }

    /// The human-readable description given at creation.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The chain position the store was created at.
    pub fn created_at(&self) -> BlockStamp {
        self.created_at
    }

    /// Whether the in-memory store has diverged from its on-disk state.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the dirty flag after a successful write to disk.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn material(&self) -> Result<KeyMaterial, KeyStoreError> {
        let identity = self.identity.as_ref().ok_or(KeyStoreError::Locked)?;
        let plaintext = decrypt_bytes(
            iter::once(identity as &dyn age::Identity),
            &self.ciphertext,
        )?;
        serde_json::from_slice(&plaintext).map_err(|e| KeyStoreError::Crypto(e.to_string()))
    }
}

/// Decrypts a passphrase-encrypted identity blob.
///
/// scrypt makes this expensive by construction; async callers should move it
/// onto a blocking thread.
pub(crate) fn decrypt_identity(
    encrypted: &[u8],
    passphrase: &SecretString,
) -> Result<age::x25519::Identity, KeyStoreError> {
    let scrypt_identity = age::scrypt::Identity::new(passphrase.clone());
    let plaintext = decrypt_bytes(
        iter::once(&scrypt_identity as &dyn age::Identity),
        encrypted,
    )
    .map_err(|_| KeyStoreError::PassphraseIncorrect)?;

    // Take ownership of the decrypted bytes in a `SecretString` before
    // parsing, so the identity encoding is zeroed when this scope ends.
    let encoded = SecretString::from(
        String::from_utf8(plaintext).map_err(|_| KeyStoreError::PassphraseIncorrect)?,
    );
    encoded
        .expose_secret()
        .trim()
        .parse::<age::x25519::Identity>()
        .map_err(|e| KeyStoreError::Crypto(e.to_owned()))
}

fn encrypt_identity(
    identity: &age::x25519::Identity,
    passphrase: &SecretString,
) -> Result<Vec<u8>, KeyStoreError> {
    let recipient = age::scrypt::Recipient::new(passphrase.clone());
    encrypt_bytes(
        iter::once(&recipient as &dyn age::Recipient),
        identity.to_string().expose_secret().as_bytes(),
    )
}

fn encrypt_material(
    recipient: &age::x25519::Recipient,
    material: &KeyMaterial,
) -> Result<Vec<u8>, KeyStoreError> {
    let plaintext =
        serde_json::to_vec(material).map_err(|e| KeyStoreError::Crypto(e.to_string()))?;
    encrypt_bytes(iter::once(recipient as &dyn age::Recipient), &plaintext)
}

fn encrypt_bytes<'a>(
    recipients: impl Iterator<Item = &'a dyn age::Recipient>,
    plaintext: &[u8],
) -> Result<Vec<u8>, KeyStoreError> {
    let encryptor = age::Encryptor::with_recipients(recipients)
        .map_err(|e| KeyStoreError::Crypto(e.to_string()))?;

    let mut ciphertext = Vec::with_capacity(plaintext.len());
    let mut writer = encryptor
        .wrap_output(&mut ciphertext)
        .map_err(|e| KeyStoreError::Crypto(e.to_string()))?;
    writer
        .write_all(plaintext)
        .map_err(|e| KeyStoreError::Crypto(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| KeyStoreError::Crypto(e.to_string()))?;

    Ok(ciphertext)
}

fn decrypt_bytes<'a>(
    identities: impl Iterator<Item = &'a dyn age::Identity>,
    ciphertext: &[u8],
) -> Result<Vec<u8>, KeyStoreError> {
    let decryptor =
        age::Decryptor::new(ciphertext).map_err(|e| KeyStoreError::Crypto(e.to_string()))?;

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    decryptor
        .decrypt(identities)
        .map_err(|e| KeyStoreError::Crypto(e.to_string()))?
        .read_to_end(&mut plaintext)
        .map_err(|e| KeyStoreError::Crypto(e.to_string()))?;

    Ok(plaintext)
}

/// On-disk form of a [`KeyStore`]; ciphertexts are base64.
#[derive(Serialize, Deserialize)]
pub(crate) struct StoredKeyStore {
    pub(crate) network: Network,
    pub(crate) description: String,
    pub(crate) created_height: i32,
    pub(crate) created_hash: String,
    pub(crate) recipient: String,
    pub(crate) encrypted_identity: String,
    pub(crate) ciphertext: String,
    pub(crate) pool: Vec<String>,
    pub(crate) next_unused: usize,
    pub(crate) imported: Vec<StoredImportedKey>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct StoredImportedKey {
    pub(crate) address: String,
    pub(crate) height: i32,
}

impl KeyStore {
    /// The store's persisted form. Locked/unlocked state is memory-only and
    /// not part of it.
    pub(crate) fn to_stored(&self) -> StoredKeyStore {
        use base64ct::{Base64, Encoding};

        StoredKeyStore {
            network: self.network,
            description: self.description.clone(),
            created_height: self.created_at.height,
            created_hash: self.created_at.hash.to_string(),
            recipient: self.recipient.to_string(),
            encrypted_identity: Base64::encode_string(&self.encrypted_identity),
            ciphertext: Base64::encode_string(&self.ciphertext),
            pool: self.pool.iter().map(|a| a.to_string()).collect(),
            next_unused: self.next_unused,
            imported: self
                .imported
                .iter()
                .map(|k| StoredImportedKey {
                    address: k.address.to_string(),
                    height: k.height,
                })
                .collect(),
        }
    }

    /// Reconstructs a locked store from its persisted form.
    pub(crate) fn from_stored(stored: StoredKeyStore) -> Result<Self, KeyStoreError> {
        use base64ct::{Base64, Encoding};
        use std::str::FromStr as _;

        let network = stored.network;
        let parse_address = |s: &str| {
            s.parse::<Address<bitcoin::address::NetworkUnchecked>>()
                .map_err(|e| KeyStoreError::Crypto(e.to_string()))?
                .require_network(network.to_bitcoin())
                .map_err(|e| KeyStoreError::Crypto(e.to_string()))
        };

        Ok(Self {
            network,
            description: stored.description,
            created_at: BlockStamp {
                height: stored.created_height,
                hash: bitcoin::BlockHash::from_str(&stored.created_hash)
                    .map_err(|e| KeyStoreError::Crypto(e.to_string()))?,
            },
            recipient: stored
                .recipient
                .parse()
                .map_err(|e: &str| KeyStoreError::Crypto(e.to_owned()))?,
            encrypted_identity: Base64::decode_vec(&stored.encrypted_identity)
                .map_err(|e| KeyStoreError::Crypto(e.to_string()))?,
            ciphertext: Base64::decode_vec(&stored.ciphertext)
                .map_err(|e| KeyStoreError::Crypto(e.to_string()))?,
            identity: None,
            pool: stored
                .pool
                .iter()
                .map(|s| parse_address(s))
                .collect::<Result<_, _>>()?,
            next_unused: stored.next_unused,
            imported: stored
                .imported
                .iter()
                .map(|k| {
                    Ok(ImportedKey {
                        address: parse_address(&k.address)?,
                        height: k.height,
                    })
                })
                .collect::<Result<_, _>>()?,
            dirty: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use bitcoin::hashes::Hash;
    use secrecy::SecretString;

    use super::KeyStore;
    use crate::components::chain::BlockStamp;
    use crate::network::Network;

    /// A locked store with no addresses, for tests that only need an
    /// account to exist.
    pub(crate) fn locked_store() -> KeyStore {
        KeyStore::create(
            Network::Regtest,
            "",
            &SecretString::from("pw"),
            0,
            BlockStamp {
                height: 0,
                hash: bitcoin::BlockHash::all_zeros(),
            },
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    fn passphrase() -> SecretString {
        SecretString::from("hunter2")
    }

    fn test_store(pool_size: usize) -> KeyStore {
        KeyStore::create(
            Network::Regtest,
            "test wallet",
            &passphrase(),
            pool_size,
            BlockStamp {
                height: 0,
                hash: bitcoin::BlockHash::all_zeros(),
            },
        )
        .unwrap()
    }

    #[test]
    fn new_store_is_locked_and_exports_need_unlock() {
        let mut store = test_store(2);
        assert!(store.is_locked());
        assert_eq!(store.export_keys(), Err(KeyStoreError::Locked));

        store.unlock(&passphrase()).unwrap();
        assert!(!store.is_locked());
        assert_eq!(store.export_keys().unwrap().len(), 2);

        store.lock().unwrap();
        assert!(store.is_locked());
        assert_eq!(store.lock(), Err(KeyStoreError::AlreadyLocked));
    }

    #[test]
    fn wrong_passphrase_is_rejected_and_state_is_unchanged() {
        let mut store = test_store(1);
        let wrong = SecretString::from("*******");
        assert_eq!(
            store.unlock(&wrong),
            Err(KeyStoreError::PassphraseIncorrect)
        );
        assert!(store.is_locked());
    }

    #[test]
    fn address_pool_hands_out_each_address_once() {
        let mut store = test_store(2);
        assert!(store.active_addresses().is_empty());

        let first = store.next_address().unwrap();
        let second = store.next_address().unwrap();
        assert_ne!(first, second);
        assert_eq!(store.active_addresses(), vec![first, second]);
        assert_eq!(store.next_address(), Err(KeyStoreError::PoolExhausted));
    }

    #[test]
    fn imported_keys_round_trip_through_wif() {
        let mut store = test_store(1);
        store.unlock(&passphrase()).unwrap();

        let secp = Secp256k1::new();
        let key = PrivateKey::new(
            bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng()),
            bitcoin::Network::Regtest,
        );
        let address = store.import_key(key, 0).unwrap();
        assert_eq!(address, Address::p2pkh(key.public_key(&secp), bitcoin::Network::Regtest));
        assert!(store.contains(&address));
        assert_eq!(store.wif_for_address(&address).unwrap(), key.to_wif());
        assert_eq!(store.import_key(key, 0), Err(KeyStoreError::DuplicateKey));
    }

    #[test]
    fn stored_form_round_trips_and_reopens_locked() {
        let mut store = test_store(2);
        let handed_out = store.next_address().unwrap();
        store.unlock(&passphrase()).unwrap();

        let mut reopened = KeyStore::from_stored(store.to_stored()).unwrap();
        assert!(reopened.is_locked());
        assert_eq!(reopened.active_addresses(), vec![handed_out.clone()]);
        assert_eq!(reopened.all_addresses(), store.all_addresses());

        reopened.unlock(&passphrase()).unwrap();
        assert_eq!(
            reopened.wif_for_address(&handed_out).unwrap(),
            store.wif_for_address(&handed_out).unwrap()
        );
    }
}
