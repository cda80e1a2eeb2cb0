//! Beespv: a single-wallet SPV Bitcoin engine for embedding in host apps.
//!
//! # Architecture
//!
//! ```text
//! WalletManager (entry point, lifecycle)
//!   │
//!   ├── WalletQueue ("wallet-mutations" thread)
//!   │     └── Wallet
//!   │           ├── KeyStore            (keys, Argon2id + ChaCha20-Poly1305)
//!   │           ├── Ledger              (history, UTXOs, balance)
//!   │           └── TransactionBuilder  (prepare / commit / clear)
//!   │
//!   ├── Driver (tokio task)
//!   │     ├── ChainSyncEngine  (headers, merkle blocks, reorgs)
//!   │     ├── AddressBook      (peer backoff, soft bans)
//!   │     └── peers            (Framed<MessageCodec> + PeerSession)
//!   │
//!   └── EventBus ──► host subscribers
//! ```
//!
//! # Surface
//!
//! | Area | Calls |
//! |------|-------|
//! | lifecycle | `initialize`, `create_wallet`, `load_wallet`, `start_blockchain`, `stop` |
//! | keys | `wallet_address`, `add_key`, `encrypt`, `lock`, `unlock`, `dump_keys` |
//! | sends | `prepare_send`, `commit_send`, `clear_send_request` |
//! | history | `balance`, `all_transactions`, `transaction_by_hash` |
//! | sync | `sync_state`, `cancel_sync`, `resume_sync`, `resync_blockchain` |
//!
//! # Usage
//!
//! ```ignore
//! use beespv::{ManagerConfig, Network, WalletManager};
//!
//! let mut manager = WalletManager::new(ManagerConfig::new("myapp").with_network(Network::Testnet))?;
//! manager.initialize()?;
//! manager.load_wallet()?;
//! manager.start_blockchain()?;
//! let mut events = manager.subscribe();
//! ```

pub mod builder;
pub mod chain;
pub mod core;
pub mod error;
pub mod events;
pub mod keystore;
pub mod ledger;
pub mod logging;
pub mod manager;
pub mod net;
pub mod queue;
pub mod runtime;
pub mod sync;
pub mod wallet;

// =============================================================================
// Re-exports
// =============================================================================
pub use bitcoin::{Address, Network, Transaction, Txid};
pub use builder::PreparedSend;
pub use chain::{Checkpoint, HeaderChain};
pub use error::{Result, WalletError};
pub use events::{EventBus, Fault, FaultHandler, WalletEvent};
pub use keystore::KdfParams;
pub use ledger::{Balance, Category, Confidence, TxView};
pub use manager::{parse_network, Lifecycle, ManagerConfig, WalletManager};
pub use net::{Connector, TcpConnector, Timeouts};
pub use runtime::{install_signal_handlers, Shutdown};
pub use sync::{SyncPhase, SyncState};
pub use wallet::{Wallet, WalletSettings};
