//! Wallet file format.
//!
//! ```json
//! { "format": "beespv-wallet", "version": 1, "checksum": "<sha256 hex of body>", "body": { ... } }
//! ```
//!
//! The checksum is taken over the canonical (sorted-key) JSON encoding of
//! `body`, so a truncated or hand-edited file is rejected on load.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, WalletError};
use crate::keystore::StoredKeyStore;
use crate::ledger::StoredLedger;

pub const FORMAT: &str = "beespv-wallet";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    version: u32,
    checksum: String,
    body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBody {
    pub network: String,
    pub created_at: i64,
    pub last_change: i64,
    pub keystore: StoredKeyStore,
    pub ledger: StoredLedger,
}

pub fn encode(body: &WalletBody) -> Result<Vec<u8>> {
    let body = serde_json::to_value(body)?;
    let envelope = Envelope { format: FORMAT.into(), version: FORMAT_VERSION, checksum: checksum(&body)?, body };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<WalletBody> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(|e| WalletError::storage("wallet file", e))?;
    if envelope.format != FORMAT {
        return Err(WalletError::StorageFailure(format!("not a wallet file: {}", envelope.format)));
    }
    if envelope.version == 0 || envelope.version > FORMAT_VERSION {
        return Err(WalletError::StorageFailure(format!("unsupported wallet version {}", envelope.version)));
    }
    if checksum(&envelope.body)? != envelope.checksum {
        return Err(WalletError::StorageFailure("wallet checksum mismatch".into()));
    }
    Ok(serde_json::from_value(envelope.body)?)
}

fn checksum(body: &Value) -> Result<String> {
    let canonical = serde_json::to_vec(body)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> WalletBody {
        WalletBody {
            network: "regtest".into(),
            created_at: 1,
            last_change: 2,
            keystore: StoredKeyStore::default(),
            ledger: StoredLedger::default(),
        }
    }

    #[test]
    fn encode_decode() {
        let bytes = encode(&body()).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.network, "regtest");
        assert_eq!(back.last_change, 2);
    }

    #[test]
    fn tampered_body_rejected() {
        let bytes = encode(&body()).unwrap();
        let text = String::from_utf8(bytes).unwrap().replace("\"last_change\": 2", "\"last_change\": 3");
        assert!(matches!(decode(text.as_bytes()), Err(WalletError::StorageFailure(m)) if m.contains("checksum")));
    }

    #[test]
    fn future_version_rejected() {
        let bytes = encode(&body()).unwrap();
        let text = String::from_utf8(bytes).unwrap().replace("\"version\": 1", "\"version\": 99");
        assert!(decode(text.as_bytes()).is_err());
    }
}
