//! Error kinds surfaced by the wallet engine.
//!
//! Local faults (one bad peer, one malformed header) are absorbed where they are
//! detected. Everything that affects wallet correctness comes back to the caller
//! as a `WalletError`.

use std::path::PathBuf;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WalletError {
    #[error("Wallet already exists: {0}")]
    AlreadyExists(String),
    #[error("No wallet file found at: {}", .0.display())]
    NoWallet(PathBuf),
    #[error("Wrong passphrase")]
    WrongPassphrase,
    #[error("Wallet is locked")]
    WalletLocked,
    #[error("Signing requires the wallet passphrase")]
    EncryptionRequired,
    #[error("Insufficient funds: need {needed} sat, have {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState { operation: &'static str, state: String },
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Storage failure: {0}")]
    StorageFailure(String),
    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, WalletError>;

impl WalletError {
    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidState { operation, state: state.to_string() }
    }

    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::StorageFailure(format!("{context}: {err}"))
    }
}

impl From<std::io::Error> for WalletError {
    fn from(e: std::io::Error) -> Self {
        Self::StorageFailure(e.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(e: serde_json::Error) -> Self {
        Self::StorageFailure(format!("json: {e}"))
    }
}
