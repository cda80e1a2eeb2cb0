//! KeyStore - key-pairs, encryption at rest, addresses
//!
//! Keys are independent secp256k1 key-pairs, each paying to a native segwit
//! (P2WPKH) address. Public keys and addresses stay readable at all times;
//! private key material is either plain or sealed under a passphrase-derived
//! key (see [`crypto`]).
//!
//! ```text
//!                 encrypt(pass)              lock()
//!   Unencrypted ───────────────► Locked ◄──────────── Unlocked
//!        ▲                         │  unlock(pass)       ▲
//!        │ decrypt(pass)           └─────────────────────┘
//!        └──────────────────── Locked / Unlocked
//! ```
//!
//! Unlocking caches the derived key (zeroized on lock/drop); it never
//! decrypts keys in place.

pub mod crypto;

use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network, PrivateKey, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, WalletError};
pub use crypto::{DerivedKey, KdfParams, KeyCrypter, Sealed};

#[derive(Clone)]
enum KeySecret {
    Plain(SecretKey),
    Sealed(Sealed),
}

/// One key-pair and its creation time (unix seconds).
#[derive(Clone)]
pub struct KeyEntry {
    pub public_key: CompressedPublicKey,
    pub created_at: i64,
    secret: KeySecret,
}

impl KeyEntry {
    pub fn script_pubkey(&self) -> ScriptBuf { ScriptBuf::new_p2wpkh(&self.public_key.wpubkey_hash()) }
    pub fn address(&self, network: Network) -> Address { Address::p2wpkh(&self.public_key, network) }
    pub fn is_sealed(&self) -> bool { matches!(self.secret, KeySecret::Sealed(_)) }
}

/// On-disk form of a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKey {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed: Option<Sealed>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredKeyStore {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypter: Option<KeyCrypter>,
    pub keys: Vec<StoredKey>,
}

pub struct KeyStore {
    network: Network,
    kdf: KdfParams,
    keys: Vec<KeyEntry>,
    crypter: Option<KeyCrypter>,
    unlocked: Option<DerivedKey>,
    secp: Secp256k1<All>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("network", &self.network)
            .field("keys", &self.keys.len())
            .field("encrypted", &self.is_encrypted())
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl KeyStore {
    pub fn new(network: Network, kdf: KdfParams) -> Self {
        Self { network, kdf, keys: Vec::new(), crypter: None, unlocked: None, secp: Secp256k1::new() }
    }

    /// Bootstrap a store with one key, encrypted when a passphrase is given.
    pub fn create(network: Network, kdf: KdfParams, passphrase: Option<&str>) -> Result<Self> {
        let mut store = Self::new(network, kdf);
        store.add_key()?;
        if let Some(pass) = passphrase.filter(|p| !p.is_empty()) {
            store.encrypt(pass)?;
        }
        Ok(store)
    }

    pub fn network(&self) -> Network { self.network }
    pub fn keys(&self) -> &[KeyEntry] { &self.keys }
    pub fn len(&self) -> usize { self.keys.len() }
    pub fn is_empty(&self) -> bool { self.keys.is_empty() }
    pub fn is_encrypted(&self) -> bool { self.crypter.is_some() }
    pub fn is_locked(&self) -> bool { self.crypter.is_some() && self.unlocked.is_none() }

    /// Generate a key-pair. Sealed immediately when the store is encrypted,
    /// which needs the cached key.
    pub fn add_key(&mut self) -> Result<Address> {
        if self.is_locked() {
            return Err(WalletError::WalletLocked);
        }
        let secret_key = random_secret_key();
        let public_key = CompressedPublicKey(PublicKey::from_secret_key(&self.secp, &secret_key));
        let secret = match &self.unlocked {
            Some(key) => KeySecret::Sealed(crypto::seal(key, &secret_key.secret_bytes())?),
            None => KeySecret::Plain(secret_key),
        };
        let entry = KeyEntry { public_key, created_at: chrono::Utc::now().timestamp(), secret };
        let address = entry.address(self.network);
        self.keys.push(entry);
        tracing::info!(%address, "Added key");
        Ok(address)
    }

    /// Seal every private key under `passphrase`. The store ends up locked.
    pub fn encrypt(&mut self, passphrase: &str) -> Result<()> {
        if self.is_encrypted() {
            return Err(WalletError::invalid_state("encrypt", "already encrypted"));
        }
        let (crypter, key) = KeyCrypter::create(passphrase, self.kdf)?;
        let mut sealed = Vec::with_capacity(self.keys.len());
        for entry in &self.keys {
            match &entry.secret {
                KeySecret::Plain(sk) => sealed.push(KeySecret::Sealed(crypto::seal(&key, &sk.secret_bytes())?)),
                KeySecret::Sealed(_) => return Err(WalletError::Unknown("sealed key in unencrypted store".into())),
            }
        }
        for (entry, secret) in self.keys.iter_mut().zip(sealed) {
            entry.secret = secret;
        }
        self.crypter = Some(crypter);
        self.unlocked = None;
        Ok(())
    }

    /// Remove encryption. Fails with `WrongPassphrase` (and changes nothing)
    /// on mismatch or when the store is not encrypted.
    pub fn decrypt(&mut self, passphrase: &str) -> Result<()> {
        let crypter = self.crypter.as_ref().ok_or(WalletError::WrongPassphrase)?;
        let key = crypter.unlock(passphrase)?;
        let plain = self.open_all(&key)?;
        for (entry, sk) in self.keys.iter_mut().zip(plain) {
            entry.secret = KeySecret::Plain(sk);
        }
        self.crypter = None;
        self.unlocked = None;
        Ok(())
    }

    /// Re-seal under a new passphrase. An unencrypted store is simply
    /// encrypted with `new`. Lock state is preserved.
    pub fn change_passphrase(&mut self, old: Option<&str>, new: &str) -> Result<()> {
        if !self.is_encrypted() {
            return self.encrypt(new);
        }
        let was_unlocked = self.unlocked.is_some();
        let crypter = self.crypter.as_ref().ok_or(WalletError::WrongPassphrase)?;
        let old_key = crypter.unlock(old.ok_or(WalletError::WrongPassphrase)?)?;
        let plain = self.open_all(&old_key)?;

        let (crypter, new_key) = KeyCrypter::create(new, self.kdf)?;
        let mut resealed = Vec::with_capacity(plain.len());
        for sk in &plain {
            resealed.push(crypto::seal(&new_key, &sk.secret_bytes())?);
        }
        for (entry, sealed) in self.keys.iter_mut().zip(resealed) {
            entry.secret = KeySecret::Sealed(sealed);
        }
        self.crypter = Some(crypter);
        self.unlocked = if was_unlocked { Some(new_key) } else { None };
        Ok(())
    }

    pub fn lock(&mut self) { self.unlocked = None; }

    /// Cache the derived key. No-op for an unencrypted store; a wrong
    /// passphrase leaves the store locked.
    pub fn unlock(&mut self, passphrase: &str) -> Result<()> {
        let Some(crypter) = &self.crypter else { return Ok(()) };
        let key = crypter.unlock(passphrase)?;
        self.unlocked = Some(key);
        Ok(())
    }

    /// Key to open sealed secrets with. `None` means keys are plain.
    ///
    /// An explicit passphrase is checked even while unlocked; without one the
    /// cached key is used, or `WalletLocked` when there is none.
    pub fn signing_key(&self, passphrase: Option<&str>) -> Result<Option<DerivedKey>> {
        let Some(crypter) = &self.crypter else { return Ok(None) };
        match passphrase {
            Some(pass) => crypter.unlock(pass).map(Some),
            None => self.unlocked.clone().map(Some).ok_or(WalletError::WalletLocked),
        }
    }

    pub fn secret_key(&self, index: usize, key: Option<&DerivedKey>) -> Result<SecretKey> {
        let entry = self.keys.get(index).ok_or_else(|| WalletError::Unknown(format!("no key at {index}")))?;
        match (&entry.secret, key) {
            (KeySecret::Plain(sk), _) => Ok(*sk),
            (KeySecret::Sealed(sealed), Some(key)) => {
                let bytes = crypto::open(key, sealed)?;
                SecretKey::from_slice(&bytes).map_err(|e| WalletError::Unknown(format!("secret key: {e}")))
            }
            (KeySecret::Sealed(_), None) => Err(WalletError::WalletLocked),
        }
    }

    pub fn find_by_script(&self, script: &Script) -> Option<usize> {
        self.keys.iter().position(|k| k.script_pubkey().as_script() == script)
    }

    pub fn scripts(&self) -> Vec<ScriptBuf> { self.keys.iter().map(KeyEntry::script_pubkey).collect() }
    pub fn addresses(&self) -> Vec<Address> { self.keys.iter().map(|k| k.address(self.network)).collect() }

    /// Address handed out for receiving: the newest key.
    pub fn current_address(&self) -> Option<Address> { self.keys.last().map(|k| k.address(self.network)) }

    /// Change goes back to the first key.
    pub fn change_script(&self) -> Option<ScriptBuf> { self.keys.first().map(KeyEntry::script_pubkey) }

    pub fn earliest_key_time(&self) -> Option<i64> { self.keys.iter().map(|k| k.created_at).min() }

    /// WIF private keys, one per line with their address. Needs the passphrase
    /// (or an unlocked store) when encrypted.
    pub fn dump(&self, passphrase: Option<&str>) -> Result<Zeroizing<String>> {
        let key = self.signing_key(passphrase)?;
        let mut out = Zeroizing::new(String::new());
        for (i, entry) in self.keys.iter().enumerate() {
            let sk = self.secret_key(i, key.as_ref())?;
            let wif = Zeroizing::new(PrivateKey::new(sk, self.network).to_wif());
            out.push_str(&format!("{} {} {}\n", entry.address(self.network), wif.as_str(), entry.created_at));
        }
        Ok(out)
    }

    fn open_all(&self, key: &DerivedKey) -> Result<Vec<SecretKey>> {
        (0..self.keys.len()).map(|i| self.secret_key(i, Some(key))).collect()
    }

    pub fn to_stored(&self) -> StoredKeyStore {
        let keys = self
            .keys
            .iter()
            .map(|k| {
                let (secret, sealed) = match &k.secret {
                    KeySecret::Plain(sk) => (Some(hex::encode(sk.secret_bytes())), None),
                    KeySecret::Sealed(s) => (None, Some(s.clone())),
                };
                StoredKey { public_key: hex::encode(k.public_key.0.serialize()), secret, sealed, created_at: k.created_at }
            })
            .collect();
        StoredKeyStore { crypter: self.crypter.clone(), keys }
    }

    pub fn from_stored(stored: StoredKeyStore, network: Network, kdf: KdfParams) -> Result<Self> {
        let mut store = Self::new(network, kdf);
        for k in stored.keys {
            let pk_bytes = hex::decode(&k.public_key).map_err(|e| WalletError::storage("public key hex", e))?;
            let public_key = CompressedPublicKey(
                PublicKey::from_slice(&pk_bytes).map_err(|e| WalletError::storage("public key", e))?,
            );
            let secret = match (k.secret, k.sealed) {
                (Some(hex_sk), None) => {
                    let bytes = Zeroizing::new(hex::decode(&hex_sk).map_err(|e| WalletError::storage("secret hex", e))?);
                    let sk = SecretKey::from_slice(&bytes).map_err(|e| WalletError::storage("secret key", e))?;
                    if PublicKey::from_secret_key(&store.secp, &sk) != public_key.0 {
                        return Err(WalletError::StorageFailure("secret does not match public key".into()));
                    }
                    KeySecret::Plain(sk)
                }
                (None, Some(sealed)) if stored.crypter.is_some() => KeySecret::Sealed(sealed),
                _ => return Err(WalletError::StorageFailure("key has no usable secret".into())),
            };
            store.keys.push(KeyEntry { public_key, created_at: k.created_at, secret });
        }
        store.crypter = stored.crypter;
        Ok(store)
    }
}

fn random_secret_key() -> SecretKey {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(bytes.as_mut());
        if let Ok(sk) = SecretKey::from_slice(bytes.as_ref()) {
            return sk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams { KdfParams::insecure_fast() }

    #[test]
    fn create_bootstraps_one_key() {
        let ks = KeyStore::create(Network::Regtest, fast(), None).unwrap();
        assert_eq!(ks.len(), 1);
        assert!(!ks.is_encrypted());
        assert!(ks.current_address().unwrap().to_string().starts_with("bcrt1q"));
    }

    #[test]
    fn add_key_while_locked_fails() {
        let mut ks = KeyStore::create(Network::Regtest, fast(), Some("pw")).unwrap();
        assert!(ks.is_locked());
        assert!(matches!(ks.add_key(), Err(WalletError::WalletLocked)));
        ks.unlock("pw").unwrap();
        ks.add_key().unwrap();
        assert_eq!(ks.len(), 2);
        assert!(ks.keys().iter().all(KeyEntry::is_sealed));
    }

    #[test]
    fn addresses_visible_while_locked() {
        let mut ks = KeyStore::create(Network::Regtest, fast(), None).unwrap();
        let before = ks.addresses();
        ks.encrypt("pw").unwrap();
        assert!(ks.is_locked());
        assert_eq!(ks.addresses(), before);
    }

    #[test]
    fn wrong_unlock_stays_locked() {
        let mut ks = KeyStore::create(Network::Regtest, fast(), Some("pw")).unwrap();
        assert!(matches!(ks.unlock("nope"), Err(WalletError::WrongPassphrase)));
        assert!(ks.is_locked());
        assert!(matches!(ks.signing_key(None), Err(WalletError::WalletLocked)));
    }

    #[test]
    fn decrypt_restores_same_secrets() {
        let mut ks = KeyStore::create(Network::Regtest, fast(), None).unwrap();
        let sk = ks.secret_key(0, None).unwrap();
        ks.encrypt("pw").unwrap();
        assert!(matches!(ks.decrypt("bad"), Err(WalletError::WrongPassphrase)));
        assert!(ks.is_encrypted());
        ks.decrypt("pw").unwrap();
        assert!(!ks.is_encrypted());
        assert_eq!(ks.secret_key(0, None).unwrap(), sk);
    }

    #[test]
    fn change_passphrase_requires_old() {
        let mut ks = KeyStore::create(Network::Regtest, fast(), Some("old")).unwrap();
        assert!(matches!(ks.change_passphrase(Some("wrong"), "new"), Err(WalletError::WrongPassphrase)));
        ks.change_passphrase(Some("old"), "new").unwrap();
        assert!(matches!(ks.unlock("old"), Err(WalletError::WrongPassphrase)));
        ks.unlock("new").unwrap();
        assert!(!ks.is_locked());
    }

    #[test]
    fn stored_round_trip_keeps_keys() {
        let mut ks = KeyStore::create(Network::Regtest, fast(), None).unwrap();
        ks.add_key().unwrap();
        ks.encrypt("pw").unwrap();
        let restored = KeyStore::from_stored(ks.to_stored(), Network::Regtest, fast()).unwrap();
        assert_eq!(restored.addresses(), ks.addresses());
        assert!(restored.is_locked());
        let key = restored.signing_key(Some("pw")).unwrap();
        assert_eq!(restored.secret_key(1, key.as_ref()).unwrap(), ks.secret_key(1, key.as_ref()).unwrap());
    }

    #[test]
    fn dump_lists_every_key() {
        let mut ks = KeyStore::create(Network::Regtest, fast(), None).unwrap();
        ks.add_key().unwrap();
        let dump = ks.dump(None).unwrap();
        assert_eq!(dump.lines().count(), 2);
    }
}
