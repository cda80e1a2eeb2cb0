//! Path constants for the wallet's on-disk state
//!
//! Everything lives under one data directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `{app}.wallet` | keys, transaction ledger, metadata (JSON, checksummed) |
//! | `{app}.spvchain` | validated header chain (binary) |
//! | `{app}.peers` | known peer addresses (JSON) |

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory root.
pub const ROOT_ENV: &str = "BEESPV_ROOT";

pub mod ext {
    pub const WALLET: &str = "wallet";
    pub const CHAIN: &str = "spvchain";
    pub const PEERS: &str = "peers";
    pub const TEMP: &str = "tmp";
}

pub fn wallet_file(dir: &Path, app: &str) -> PathBuf {
    dir.join(format!("{app}.{}", ext::WALLET))
}

pub fn chain_file(dir: &Path, app: &str) -> PathBuf {
    dir.join(format!("{app}.{}", ext::CHAIN))
}

pub fn peers_file(dir: &Path, app: &str) -> PathBuf {
    dir.join(format!("{app}.{}", ext::PEERS))
}

/// Resolve the data directory: explicit override, then `$BEESPV_ROOT`, then
/// the platform's local data dir. `support_id` adds an application-specific
/// subdirectory so several hosts can share a root.
pub fn data_dir(explicit: Option<&Path>, app: &str, support_id: Option<&str>) -> PathBuf {
    let base = match explicit {
        Some(p) => p.to_path_buf(),
        None => std::env::var(ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
            .join(app),
    };
    match support_id {
        Some(id) if !id.is_empty() => base.join(id),
        _ => base,
    }
}
