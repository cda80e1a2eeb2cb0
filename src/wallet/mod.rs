//! Wallet - keys, ledger and staging slot behind one file
//!
//! # Architecture
//!
//! ```text
//! Wallet
//!   ├── KeyStore            (key-pairs, encryption, lock state)
//!   ├── Ledger              (history, UTXOs, balances, reservations)
//!   ├── TransactionBuilder  (single prepared-send slot)
//!   └── {app}.wallet        (versioned JSON, checksummed, atomic writes)
//! ```
//!
//! Every key-set mutation and every committed send is flushed before the call
//! returns. Block application only marks the wallet dirty unless it changed
//! the history; dirty state is flushed by [`Wallet::flush_if_dirty`] on the
//! maintenance tick and on stop.

mod file;

use std::path::{Path, PathBuf};

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, Transaction, Txid};
use zeroize::Zeroizing;

use crate::builder::{PreparedSend, SignedSend, TransactionBuilder};
use crate::core::fs::{decode_base64, encode_base64, write_atomic};
use crate::error::{Result, WalletError};
use crate::keystore::{KdfParams, KeyStore};
use crate::ledger::{Balance, Ledger, TxChange};
pub use file::{WalletBody, FORMAT_VERSION};

/// Parameters that come from configuration rather than the wallet file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletSettings {
    pub network: Network,
    pub kdf: KdfParams,
    pub min_depth: u32,
    pub fee_rate: u64,
}

impl WalletSettings {
    pub fn new(network: Network) -> Self { Self { network, kdf: KdfParams::default(), min_depth: 6, fee_rate: 5 } }
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self { self.kdf = kdf; self }
    pub fn with_min_depth(mut self, depth: u32) -> Self { self.min_depth = depth; self }
    pub fn with_fee_rate(mut self, sat_per_vb: u64) -> Self { self.fee_rate = sat_per_vb; self }
}

pub struct Wallet {
    path: PathBuf,
    settings: WalletSettings,
    keys: KeyStore,
    ledger: Ledger,
    builder: TransactionBuilder,
    created_at: i64,
    last_change: i64,
    dirty: bool,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").field("path", &self.path).field("keys", &self.keys).finish_non_exhaustive()
    }
}

impl Wallet {
    /// Create a wallet file with one fresh key. Fails if the file exists.
    pub fn create(path: impl Into<PathBuf>, settings: WalletSettings, passphrase: Option<&str>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Err(WalletError::AlreadyExists(path.display().to_string()));
        }
        let keys = KeyStore::create(settings.network, settings.kdf, passphrase)?;
        let mut ledger = Ledger::new(settings.network, settings.min_depth);
        for script in keys.scripts() {
            ledger.watch(script);
        }
        let now = chrono::Utc::now().timestamp();
        let wallet = Self {
            path,
            settings,
            keys,
            ledger,
            builder: TransactionBuilder::new(settings.fee_rate),
            created_at: now,
            last_change: now,
            dirty: false,
        };
        wallet.save()?;
        tracing::info!(path = %wallet.path.display(), network = %settings.network, "Created wallet");
        Ok(wallet)
    }

    pub fn load(path: impl Into<PathBuf>, settings: WalletSettings) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(WalletError::NoWallet(path));
        }
        let bytes = std::fs::read(&path).map_err(|e| WalletError::storage("wallet read", e))?;
        let wallet = Self::from_bytes(path, settings, &bytes)?;
        tracing::info!(path = %wallet.path.display(), keys = wallet.keys.len(), txs = wallet.ledger.transaction_count(), "Loaded wallet");
        Ok(wallet)
    }

    fn from_bytes(path: PathBuf, settings: WalletSettings, bytes: &[u8]) -> Result<Self> {
        let body = file::decode(bytes)?;
        if body.network != settings.network.to_string() {
            return Err(WalletError::StorageFailure(format!(
                "wallet is for {}, configured for {}",
                body.network, settings.network
            )));
        }
        let keys = KeyStore::from_stored(body.keystore, settings.network, settings.kdf)?;
        let ledger = Ledger::from_stored(body.ledger, settings.network, settings.min_depth, keys.scripts())?;
        Ok(Self {
            path,
            settings,
            keys,
            ledger,
            builder: TransactionBuilder::new(settings.fee_rate),
            created_at: body.created_at,
            last_change: body.last_change,
            dirty: false,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        file::encode(&WalletBody {
            network: self.settings.network.to_string(),
            created_at: self.created_at,
            last_change: self.last_change,
            keystore: self.keys.to_stored(),
            ledger: self.ledger.to_stored(),
        })
    }

    pub fn save(&self) -> Result<()> { write_atomic(&self.path, &self.to_bytes()?) }

    pub fn flush_if_dirty(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.save()?;
        self.dirty = false;
        Ok(true)
    }

    pub fn export_to(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)?;
        tracing::info!(path = %path.display(), "Exported wallet");
        Ok(())
    }

    pub fn to_base64(&self) -> Result<String> { Ok(encode_base64(&self.to_bytes()?)) }

    /// Replace this wallet's state with the file at `path` and persist it at
    /// this wallet's own location.
    pub fn import_from(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|e| WalletError::storage("import read", e))?;
        self.replace_with(&bytes)?;
        tracing::info!(path = %path.display(), "Imported wallet");
        Ok(())
    }

    pub fn import_base64(&mut self, blob: &str) -> Result<()> { self.replace_with(&decode_base64(blob)?) }

    fn replace_with(&mut self, bytes: &[u8]) -> Result<()> {
        let mut imported = Self::from_bytes(self.path.clone(), self.settings, bytes)?;
        imported.touch();
        imported.flush_if_dirty()?;
        *self = imported;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path { &self.path }
    pub fn network(&self) -> Network { self.settings.network }
    pub fn keys(&self) -> &KeyStore { &self.keys }
    pub fn ledger(&self) -> &Ledger { &self.ledger }
    pub fn balance(&self) -> Balance { self.ledger.balance() }
    pub fn created_at(&self) -> i64 { self.created_at }
    pub fn last_change(&self) -> i64 { self.last_change }
    pub fn is_encrypted(&self) -> bool { self.keys.is_encrypted() }
    pub fn is_locked(&self) -> bool { self.keys.is_locked() }
    pub fn current_address(&self) -> Option<Address> { self.keys.current_address() }
    pub fn addresses(&self) -> Vec<Address> { self.keys.addresses() }

    /// Earliest key creation time; blocks before it cannot pay this wallet.
    pub fn birth_time(&self) -> i64 { self.keys.earliest_key_time().unwrap_or(self.created_at) }

    pub fn dump_keys(&self, passphrase: Option<&str>) -> Result<Zeroizing<String>> { self.keys.dump(passphrase) }

    /// Data items for a BIP37 filter: witness programs and public keys of
    /// every key, plus the serialized outpoint of every unspent output.
    pub fn filter_elements(&self) -> Vec<Vec<u8>> {
        let mut elements = Vec::new();
        for key in self.keys.keys() {
            elements.push(key.public_key.wpubkey_hash().to_byte_array().to_vec());
            elements.push(key.public_key.0.serialize().to_vec());
        }
        for utxo in self.ledger.utxos() {
            elements.push(serialize(&utxo.outpoint));
        }
        elements
    }

    // =========================================================================
    // Key mutations (flushed)
    // =========================================================================

    pub fn add_key(&mut self) -> Result<Address> {
        let address = self.keys.add_key()?;
        self.ledger.watch(address.script_pubkey());
        self.touch();
        self.save()?;
        Ok(address)
    }

    pub fn encrypt(&mut self, passphrase: &str) -> Result<()> {
        self.keys.encrypt(passphrase)?;
        self.builder.clear_prepared();
        self.touch();
        self.save()
    }

    pub fn decrypt(&mut self, passphrase: &str) -> Result<()> {
        self.keys.decrypt(passphrase)?;
        self.touch();
        self.save()
    }

    pub fn change_passphrase(&mut self, old: Option<&str>, new: &str) -> Result<()> {
        self.keys.change_passphrase(old, new)?;
        self.builder.clear_prepared();
        self.touch();
        self.save()
    }

    pub fn lock(&mut self) { self.keys.lock(); }
    pub fn unlock(&mut self, passphrase: &str) -> Result<()> { self.keys.unlock(passphrase) }

    // =========================================================================
    // Sends
    // =========================================================================

    pub fn prepare_send(&mut self, amount: u64, destination: &str, comment: Option<&str>, passphrase: Option<&str>) -> Result<PreparedSend> {
        self.builder.prepare_send(&self.keys, &self.ledger, amount, destination, comment, passphrase)
    }

    pub fn has_prepared(&self) -> bool { self.builder.has_prepared() }

    /// Sign the staged send, record it as pending (reserving its inputs) and
    /// flush. The returned transaction still has to reach the network.
    pub fn commit_prepared(&mut self) -> Result<SignedSend> {
        let signed = self.builder.commit_prepared(&self.keys)?;
        self.ledger.record_pending(&signed.tx, signed.fee, signed.comment.clone())?;
        self.touch();
        self.save()?;
        Ok(signed)
    }

    pub fn clear_prepared(&mut self) { self.builder.clear_prepared(); }

    pub fn set_fee_rate(&mut self, sat_per_vb: u64) { self.builder.set_fee_rate(sat_per_vb); }

    // =========================================================================
    // Chain-facing
    // =========================================================================

    /// Apply the wallet-relevant transactions of the block at `height` and
    /// advance the processed height. Flushes when history changed.
    pub fn apply_block(&mut self, height: u32, txs: &[Transaction]) -> Result<Vec<TxChange>> {
        let changes: Vec<TxChange> = txs.iter().filter_map(|tx| self.ledger.apply_confirmed_transaction(tx, height)).collect();
        if self.ledger.tip().map_or(true, |t| t < height) {
            self.ledger.set_tip(height);
        }
        self.ledger.set_processed_height(height);
        self.dirty = true;
        if !changes.is_empty() {
            self.touch();
            self.flush_if_dirty()?;
        }
        Ok(changes)
    }

    pub fn apply_pending(&mut self, tx: &Transaction) -> Result<Option<TxChange>> {
        let change = self.ledger.record_incoming_pending(tx);
        if change.is_some() {
            self.touch();
            self.flush_if_dirty()?;
        }
        Ok(change)
    }

    /// Undo confirmations above `height` (all for `None`).
    pub fn revert_above(&mut self, height: Option<u32>) -> Result<Vec<Txid>> {
        let reverted = self.ledger.unconfirm_above(height);
        self.touch();
        self.flush_if_dirty()?;
        Ok(reverted)
    }

    pub fn release_expired_reservations(&mut self, timeout_secs: i64) -> Result<Vec<Txid>> {
        let released = self.ledger.release_expired_reservations(chrono::Utc::now().timestamp(), timeout_secs);
        if !released.is_empty() {
            self.touch();
            self.flush_if_dirty()?;
        }
        Ok(released)
    }

    fn touch(&mut self) {
        self.last_change = chrono::Utc::now().timestamp();
        self.dirty = true;
    }
}
