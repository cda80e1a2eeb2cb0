//! WalletManager - the one coordinator a host talks to
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ─initialize─► Initialized ─create/load─► WalletLoaded ─start─► Running ─stop─► Stopped
//! ```
//!
//! Calls out of order fail with `InvalidState`. Only one manager may exist at
//! a time; a second `new` fails until the first is dropped.
//!
//! # Threads
//!
//! | Context | Owns |
//! |---|---|
//! | host thread | calls below, blocking on results |
//! | `wallet-mutations` | the [`Wallet`], one job at a time |
//! | tokio runtime | sync driver, one task per peer |
//!
//! Host calls must come from plain threads, not from inside an async task.
//!
//! # Usage
//!
//! ```ignore
//! use beespv::{ManagerConfig, WalletManager};
//!
//! let mut manager = WalletManager::new(ManagerConfig::new("myapp"))?;
//! manager.set_fault_handler(std::sync::Arc::new(|f: &beespv::Fault| eprintln!("{}: {}", f.context, f.error)))?;
//! manager.initialize()?;
//! if manager.wallet_exists()? { manager.load_wallet()? } else { manager.create_wallet(None)? }
//! manager.start_blockchain()?;
//! let balance = manager.balance()?;
//! manager.stop()?;
//! ```

pub mod config;

pub use config::{parse_network, ManagerConfig};

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Address, Txid};
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc, watch};
use zeroize::Zeroizing;

use crate::builder::PreparedSend;
use crate::chain::{store, HeaderChain};
use crate::core::paths;
use crate::error::{Result, WalletError};
use crate::events::{EventBus, FaultHandler, FaultReporter, WalletEvent};
use crate::ledger::{Balance, TxView};
use crate::net::addrman::default_port;
use crate::net::{AddressBook, Connector, TcpConnector};
use crate::queue::{QueueHandle, WalletQueue};
use crate::runtime::Shutdown;
use crate::sync::{ChainSyncEngine, Control, Driver, DriverConfig, DriverContext, SyncState};
use crate::wallet::Wallet;

static ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    WalletLoaded,
    Running,
    Stopped,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::WalletLoaded => "wallet loaded",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

struct SyncTask {
    control: mpsc::Sender<Control>,
    shutdown: Shutdown,
    task: tokio::task::JoinHandle<()>,
}

pub struct WalletManager {
    config: ManagerConfig,
    lifecycle: Lifecycle,
    data_dir: Option<PathBuf>,
    runtime: Option<Runtime>,
    events: EventBus,
    faults: FaultReporter,
    connector: Option<Arc<dyn Connector>>,
    queue: Option<WalletQueue>,
    sync: Option<SyncTask>,
    sync_state: watch::Receiver<SyncState>,
}

impl std::fmt::Debug for WalletManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletManager")
            .field("app", &self.config.app_name)
            .field("network", &self.config.network)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl WalletManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        if ACTIVE.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(WalletError::invalid_state("create manager", "another manager is active"));
        }
        let (_, sync_state) = watch::channel(SyncState::default());
        Ok(Self {
            config,
            lifecycle: Lifecycle::Uninitialized,
            data_dir: None,
            runtime: None,
            events: EventBus::new(),
            faults: FaultReporter::default(),
            connector: None,
            queue: None,
            sync: None,
            sync_state,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle { self.lifecycle }
    pub fn config(&self) -> &ManagerConfig { &self.config }
    pub fn data_dir(&self) -> Option<&Path> { self.data_dir.as_deref() }
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> { self.events.subscribe() }

    /// Change configuration. Only before `initialize`.
    pub fn configure(&mut self, f: impl FnOnce(&mut ManagerConfig)) -> Result<()> {
        self.require("configure", &[Lifecycle::Uninitialized])?;
        f(&mut self.config);
        Ok(())
    }

    /// Receives faults from background work. Without one, such a fault
    /// aborts the process.
    pub fn set_fault_handler(&mut self, handler: Arc<dyn FaultHandler>) -> Result<()> {
        self.require("set fault handler", &[Lifecycle::Uninitialized, Lifecycle::Initialized, Lifecycle::WalletLoaded])?;
        self.faults = FaultReporter::new(Some(handler));
        Ok(())
    }

    /// Replace how peer transports are opened (TCP by default).
    pub fn set_connector(&mut self, connector: Arc<dyn Connector>) -> Result<()> {
        self.require("set connector", &[Lifecycle::Uninitialized, Lifecycle::Initialized, Lifecycle::WalletLoaded])?;
        self.connector = Some(connector);
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn initialize(&mut self) -> Result<()> {
        self.require("initialize", &[Lifecycle::Uninitialized])?;
        let dir = paths::data_dir(self.config.data_dir.as_deref(), &self.config.app_name, self.config.support_id.as_deref());
        std::fs::create_dir_all(&dir).map_err(|e| WalletError::storage("create data dir", e))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("beespv-sync")
            .enable_all()
            .build()
            .map_err(|e| WalletError::Unknown(format!("runtime: {e}")))?;
        tracing::info!(dir = %dir.display(), network = %self.config.network, "Initialized");
        self.data_dir = Some(dir);
        self.runtime = Some(runtime);
        self.set_lifecycle(Lifecycle::Initialized);
        Ok(())
    }

    pub fn wallet_path(&self) -> Result<PathBuf> {
        let dir = self.data_dir.as_deref().ok_or_else(|| self.state_error("wallet path"))?;
        Ok(paths::wallet_file(dir, &self.config.app_name))
    }

    pub fn wallet_exists(&self) -> Result<bool> {
        self.require("wallet exists", &[Lifecycle::Initialized, Lifecycle::WalletLoaded, Lifecycle::Running])?;
        Ok(self.wallet_path()?.exists())
    }

    /// Fails with `AlreadyExists` when a wallet file is present.
    pub fn create_wallet(&mut self, passphrase: Option<&str>) -> Result<()> {
        self.require("create wallet", &[Lifecycle::Initialized])?;
        let wallet = Wallet::create(self.wallet_path()?, self.config.wallet_settings(), passphrase)?;
        self.attach(wallet)
    }

    pub fn load_wallet(&mut self) -> Result<()> {
        self.require("load wallet", &[Lifecycle::Initialized])?;
        let wallet = Wallet::load(self.wallet_path()?, self.config.wallet_settings())?;
        self.attach(wallet)
    }

    fn attach(&mut self, wallet: Wallet) -> Result<()> {
        self.queue = Some(WalletQueue::spawn(wallet)?);
        self.set_lifecycle(Lifecycle::WalletLoaded);
        Ok(())
    }

    pub fn start_blockchain(&mut self) -> Result<()> {
        self.require("start blockchain", &[Lifecycle::WalletLoaded])?;
        let dir = self.data_dir.clone().ok_or_else(|| self.state_error("start blockchain"))?;
        let app = &self.config.app_name;
        let chain_path = paths::chain_file(&dir, app);
        let peers_path = paths::peers_file(&dir, app);
        let queue = self.queue_handle("start blockchain")?;

        let chain = match store::load(&chain_path, self.config.network) {
            Ok(Some(chain)) => chain,
            Ok(None) => {
                // no headers means no proof for existing confirmations
                queue.call(|w| w.revert_above(None))??;
                self.fresh_chain()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Header store unusable, starting over");
                queue.call(|w| w.revert_above(None))??;
                self.fresh_chain()
            }
        };
        let (processed, birth) = queue.call(|w| (w.ledger().processed_height(), w.birth_time()))?;
        let engine = ChainSyncEngine::new(chain, processed, birth);
        let book = AddressBook::load(&peers_path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Peer book unreadable, starting empty");
            AddressBook::new()
        });
        let connector = self
            .connector
            .clone()
            .unwrap_or_else(|| Arc::new(TcpConnector { timeout: self.config.connect_timeout }));

        let (state_tx, state_rx) = watch::channel(engine.state());
        self.sync_state = state_rx;
        let driver_config = DriverConfig {
            network: self.config.network,
            max_peers: self.config.max_peers,
            timeouts: self.config.timeouts,
            static_peers: self.config.peers.clone(),
            dns_seeds: self.config.seeds(),
            port: default_port(self.config.network),
            disable_listening: self.config.disable_listening,
            chain_path,
            peers_path,
            reservation_timeout: self.config.reservation_timeout,
        };
        let ctx = DriverContext { queue, events: self.events.clone(), faults: self.faults.clone(), connector, state: state_tx };
        let driver = Driver::new(driver_config, engine, book, ctx);

        let runtime = self.runtime.as_ref().ok_or_else(|| self.state_error("start blockchain"))?;
        let (control, control_rx) = mpsc::channel(64);
        let shutdown = Shutdown::new();
        let task = runtime.spawn(driver.run(control_rx, shutdown.subscribe()));
        self.sync = Some(SyncTask { control, shutdown, task });
        self.set_lifecycle(Lifecycle::Running);
        Ok(())
    }

    /// Tear down peers, flush the wallet, stop the runtime. Nothing mutating
    /// may be called afterwards.
    pub fn stop(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        if let Some(sync) = self.sync.take() {
            sync.shutdown.trigger();
            if let Some(rt) = &self.runtime {
                if let Err(e) = rt.block_on(sync.task) {
                    tracing::error!(error = %e, "Sync task failed");
                }
            }
        }
        let flushed = match self.queue.take() {
            // the worker only logs a failed final flush; retry so it reaches the caller
            Some(queue) => queue.shutdown().and_then(|mut w| w.flush_if_dirty().map(|_| ())),
            None => Ok(()),
        };
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_timeout(Duration::from_secs(2));
        }
        self.set_lifecycle(Lifecycle::Stopped);
        flushed
    }

    // =========================================================================
    // Keys and encryption
    // =========================================================================

    pub fn wallet_address(&self) -> Result<Option<Address>> { self.wallet("wallet address", |w| w.addresses().into_iter().next()) }

    pub fn all_wallet_addresses(&self) -> Result<Vec<Address>> { self.wallet("wallet addresses", |w| w.addresses()) }

    /// Parses and belongs to the configured network.
    pub fn is_address_valid(&self, address: &str) -> bool {
        Address::from_str(address).ok().and_then(|a| a.require_network(self.config.network).ok()).is_some()
    }

    pub fn add_key(&self) -> Result<Address> {
        let address = self.wallet("add key", |w| w.add_key())??;
        self.control(Control::RefreshFilter);
        self.events.publish(WalletEvent::WalletChanged);
        Ok(address)
    }

    pub fn encrypt(&self, passphrase: &str) -> Result<()> {
        let p = Zeroizing::new(passphrase.to_owned());
        self.wallet("encrypt", move |w| w.encrypt(&p))??;
        self.events.publish(WalletEvent::WalletChanged);
        Ok(())
    }

    pub fn decrypt(&self, passphrase: &str) -> Result<()> {
        let p = Zeroizing::new(passphrase.to_owned());
        self.wallet("decrypt", move |w| w.decrypt(&p))??;
        self.events.publish(WalletEvent::WalletChanged);
        Ok(())
    }

    pub fn remove_encryption(&self, passphrase: &str) -> Result<()> { self.decrypt(passphrase) }

    pub fn change_passphrase(&self, old: Option<&str>, new: &str) -> Result<()> {
        let old = old.map(|o| Zeroizing::new(o.to_owned()));
        let new = Zeroizing::new(new.to_owned());
        self.wallet("change passphrase", move |w| w.change_passphrase(old.as_deref().map(String::as_str), &new))??;
        self.events.publish(WalletEvent::WalletChanged);
        Ok(())
    }

    pub fn lock(&self) -> Result<()> { self.wallet("lock", |w| w.lock()) }

    pub fn unlock(&self, passphrase: &str) -> Result<()> {
        let p = Zeroizing::new(passphrase.to_owned());
        self.wallet("unlock", move |w| w.unlock(&p))?
    }

    pub fn is_encrypted(&self) -> Result<bool> { self.wallet("is encrypted", |w| w.is_encrypted()) }
    pub fn is_locked(&self) -> Result<bool> { self.wallet("is locked", |w| w.is_locked()) }

    /// One WIF private key per line.
    pub fn dump_keys(&self, passphrase: Option<&str>) -> Result<Zeroizing<String>> {
        let p = passphrase.map(|p| Zeroizing::new(p.to_owned()));
        self.wallet("dump keys", move |w| w.dump_keys(p.as_deref().map(String::as_str)))?
    }

    pub fn last_wallet_change(&self) -> Result<i64> { self.wallet("last wallet change", |w| w.last_change()) }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Stage a send, replacing any previous stage. Nothing is signed yet.
    pub fn prepare_send(&self, amount: u64, destination: &str, comment: Option<&str>, passphrase: Option<&str>) -> Result<PreparedSend> {
        let dest = destination.to_owned();
        let comment = comment.map(str::to_owned);
        let p = passphrase.map(|p| Zeroizing::new(p.to_owned()));
        self.wallet("prepare send", move |w| {
            w.prepare_send(amount, &dest, comment.as_deref(), p.as_deref().map(String::as_str))
        })?
    }

    /// Sign and record the staged send, then hand it to the network. While
    /// the engine is not running it stays pending and goes out on start.
    pub fn commit_send(&self) -> Result<Txid> {
        let signed = self.wallet("commit send", |w| w.commit_prepared())??;
        let txid = signed.tx.compute_txid();
        tracing::info!(%txid, fee = signed.fee, "Committed send");
        self.events.publish(WalletEvent::TransactionChanged { txid });
        self.control(Control::Broadcast(signed.tx));
        Ok(txid)
    }

    pub fn clear_send_request(&self) -> Result<()> { self.wallet("clear send", |w| w.clear_prepared()) }
    pub fn has_send_request(&self) -> Result<bool> { self.wallet("has send", |w| w.has_prepared()) }
    pub fn set_fee_rate(&self, sat_per_vb: u64) -> Result<()> { self.wallet("set fee rate", move |w| w.set_fee_rate(sat_per_vb)) }

    // =========================================================================
    // Ledger reads
    // =========================================================================

    pub fn balance(&self) -> Result<Balance> { self.wallet("balance", |w| w.balance()) }

    pub fn transaction_count(&self) -> Result<usize> { self.wallet("transaction count", |w| w.ledger().transaction_count()) }

    pub fn transaction_by_hash(&self, txid: Txid) -> Result<Option<TxView>> {
        self.wallet("transaction by hash", move |w| w.ledger().transaction_by_hash(&txid))
    }

    /// Newest first. O(n); use [`Self::all_transactions`] for lists.
    pub fn transaction_at(&self, index: usize) -> Result<Option<TxView>> {
        self.wallet("transaction at", move |w| w.ledger().transaction_at(index))
    }

    /// Newest first; `limit == 0` returns everything.
    pub fn all_transactions(&self, limit: usize) -> Result<Vec<TxView>> {
        self.wallet("all transactions", move |w| w.ledger().all_transactions(limit))
    }

    pub fn transactions_with_range(&self, from: usize, count: usize) -> Result<Vec<TxView>> {
        self.wallet("transactions range", move |w| w.ledger().transactions_range(from, count))
    }

    // =========================================================================
    // Wallet file
    // =========================================================================

    pub fn export_wallet(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        self.wallet("export wallet", move |w| w.export_to(&path))?
    }

    pub fn wallet_file_base64(&self) -> Result<String> { self.wallet("wallet base64", |w| w.to_base64())? }

    /// Overwrite the current wallet with the file at `path`.
    pub fn import_wallet(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        self.wallet("import wallet", move |w| w.import_from(&path))??;
        self.after_import();
        Ok(())
    }

    pub fn import_wallet_base64(&self, blob: &str) -> Result<()> {
        let blob = blob.to_owned();
        self.wallet("import wallet", move |w| w.import_base64(&blob))??;
        self.after_import();
        Ok(())
    }

    /// Imported keys may own history below the current tip, so a running
    /// engine rescans from its base.
    fn after_import(&self) {
        self.events.publish(WalletEvent::WalletChanged);
        if self.sync.is_some() {
            tracing::info!("Wallet imported while running, resyncing");
            self.control(Control::Resync(self.fresh_chain()));
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    pub fn sync_state(&self) -> SyncState { self.sync_state.borrow().clone() }
    pub fn sync_progress(&self) -> f64 { self.sync_state.borrow().progress() }
    pub fn peer_count(&self) -> usize { self.sync_state.borrow().peer_count }

    /// Timestamp of the best header, once the engine has started.
    pub fn last_block_creation_time(&self) -> Option<i64> {
        let time = self.sync_state.borrow().tip_time;
        (time != 0).then_some(time as i64)
    }

    /// Drop every confirmation and all headers, then sync again from the
    /// configured checkpoint (or genesis).
    pub fn resync_blockchain(&self) -> Result<()> {
        if self.sync.is_some() {
            // the driver reverts in order with the blocks it is applying
            self.control(Control::Resync(self.fresh_chain()));
            tracing::info!("Resync requested");
            return Ok(());
        }
        let reverted = self.wallet("resync", |w| w.revert_above(None))??;
        for txid in reverted {
            self.events.publish(WalletEvent::TransactionChanged { txid });
        }
        if let Some(dir) = &self.data_dir {
            let path = paths::chain_file(dir, &self.config.app_name);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(WalletError::storage("remove header store", e));
                }
            }
        }
        tracing::info!("Wallet reverted; headers sync from base on next start");
        Ok(())
    }

    /// Halt block download. Progress so far is kept.
    pub fn cancel_sync(&self) -> Result<()> {
        self.require("cancel sync", &[Lifecycle::Running])?;
        self.control(Control::Cancel);
        Ok(())
    }

    pub fn resume_sync(&self) -> Result<()> {
        self.require("resume sync", &[Lifecycle::Running])?;
        self.control(Control::Resume);
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn fresh_chain(&self) -> HeaderChain {
        match self.config.checkpoint {
            Some(cp) => HeaderChain::from_checkpoint(self.config.network, cp),
            None => HeaderChain::new(self.config.network),
        }
    }

    fn set_lifecycle(&mut self, state: Lifecycle) {
        tracing::info!(from = %self.lifecycle, to = %state, "Lifecycle");
        self.lifecycle = state;
        self.events.publish(WalletEvent::StateChanged(state));
    }

    fn state_error(&self, operation: &'static str) -> WalletError { WalletError::invalid_state(operation, self.lifecycle) }

    fn require(&self, operation: &'static str, allowed: &[Lifecycle]) -> Result<()> {
        if allowed.contains(&self.lifecycle) {
            Ok(())
        } else {
            Err(self.state_error(operation))
        }
    }

    fn queue_handle(&self, operation: &'static str) -> Result<QueueHandle> {
        self.queue.as_ref().map(WalletQueue::handle).ok_or_else(|| self.state_error(operation))
    }

    fn wallet<R, F>(&self, operation: &'static str, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Wallet) -> R + Send + 'static,
    {
        self.require(operation, &[Lifecycle::WalletLoaded, Lifecycle::Running])?;
        self.queue_handle(operation)?.call(job)
    }

    fn control(&self, msg: Control) {
        if let Some(sync) = &self.sync {
            if let Err(e) = sync.control.try_send(msg) {
                tracing::warn!(error = %e, "Sync control dropped");
            }
        }
    }
}

impl Drop for WalletManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "Stop on drop failed");
        }
        ACTIVE.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::crypto::KdfParams;
    use bitcoin::Network;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Managers are process-wide; tests take turns.
    static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn config(dir: &TempDir) -> ManagerConfig {
        ManagerConfig::new("t")
            .with_network(Network::Regtest)
            .with_data_dir(dir.path())
            .with_kdf(KdfParams::insecure_fast())
            .with_min_depth(1)
            .with_dns_seeds(Vec::new())
    }

    #[test]
    fn out_of_order_calls_are_invalid_state() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let mut m = WalletManager::new(config(&dir)).unwrap();
        assert!(matches!(m.load_wallet(), Err(WalletError::InvalidState { .. })));
        assert!(matches!(m.balance(), Err(WalletError::InvalidState { .. })));
        m.initialize().unwrap();
        assert!(matches!(m.initialize(), Err(WalletError::InvalidState { .. })));
        assert!(matches!(m.start_blockchain(), Err(WalletError::InvalidState { .. })));
        assert!(matches!(m.configure(|c| c.fee_rate = 9), Err(WalletError::InvalidState { .. })));
        assert!(matches!(m.load_wallet(), Err(WalletError::NoWallet(_))));
        m.create_wallet(None).unwrap();
        assert!(matches!(m.create_wallet(None), Err(WalletError::InvalidState { .. })));
        m.stop().unwrap();
        assert_eq!(m.lifecycle(), Lifecycle::Stopped);
        assert!(matches!(m.add_key(), Err(WalletError::InvalidState { .. })));
    }

    #[test]
    fn single_instance() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let first = WalletManager::new(config(&dir)).unwrap();
        assert!(matches!(WalletManager::new(config(&dir)), Err(WalletError::InvalidState { .. })));
        drop(first);
        assert!(WalletManager::new(config(&dir)).is_ok());
    }

    #[test]
    fn create_twice_is_already_exists() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        {
            let mut m = WalletManager::new(config(&dir)).unwrap();
            m.initialize().unwrap();
            m.create_wallet(None).unwrap();
            m.stop().unwrap();
        }
        let mut m = WalletManager::new(config(&dir)).unwrap();
        m.initialize().unwrap();
        assert!(m.wallet_exists().unwrap());
        assert!(matches!(m.create_wallet(None), Err(WalletError::AlreadyExists(_))));
        m.load_wallet().unwrap();
        assert_eq!(m.all_wallet_addresses().unwrap().len(), 1);
    }

    #[test]
    fn address_validation_uses_network() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let mut m = WalletManager::new(config(&dir)).unwrap();
        m.initialize().unwrap();
        m.create_wallet(None).unwrap();
        let ours = m.wallet_address().unwrap().unwrap().to_string();
        assert!(m.is_address_valid(&ours));
        assert!(!m.is_address_valid("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"));
        assert!(!m.is_address_valid("nonsense"));
    }
}
