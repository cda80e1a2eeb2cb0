//! Header store file (`{app}.spvchain`).
//!
//! ```text
//! "BSPV" | version u8 | network magic [4] | base height u32le | count u32le | count × 80-byte header
//! ```
//!
//! Only the active chain is written. Loading replays every header through
//! validation, so a damaged file is rejected rather than trusted.

use std::path::Path;

use bitcoin::block::Header;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::p2p::Magic;
use bitcoin::Network;

use super::{Checkpoint, Connected, HeaderChain};
use crate::core::fs::write_atomic;
use crate::error::{Result, WalletError};

const FILE_MAGIC: &[u8; 4] = b"BSPV";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 80;
const PREFIX_LEN: usize = 4 + 1 + 4 + 4 + 4;

pub fn encode(chain: &HeaderChain) -> Vec<u8> {
    let count = chain.height() - chain.base_height() + 1;
    let mut out = Vec::with_capacity(PREFIX_LEN + count as usize * HEADER_LEN);
    out.extend_from_slice(FILE_MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&Magic::from(chain.network()).to_bytes());
    out.extend_from_slice(&chain.base_height().to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    for stored in chain.active_from(chain.base_height()) {
        out.extend_from_slice(&serialize(&stored.header));
    }
    out
}

pub fn decode(bytes: &[u8], network: Network) -> Result<HeaderChain> {
    let bad = |m: &str| WalletError::StorageFailure(format!("header store: {m}"));
    if bytes.len() < PREFIX_LEN || &bytes[0..4] != FILE_MAGIC {
        return Err(bad("not a header store"));
    }
    if bytes[4] != VERSION {
        return Err(bad("unsupported version"));
    }
    if bytes[5..9] != Magic::from(network).to_bytes() {
        return Err(bad("network mismatch"));
    }
    let base_height = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
    let count = u32::from_le_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]) as usize;
    let body = &bytes[PREFIX_LEN..];
    if count == 0 || body.len() != count * HEADER_LEN {
        return Err(bad("truncated"));
    }

    let mut headers = body.chunks_exact(HEADER_LEN).map(|c| deserialize::<Header>(c).map_err(|e| bad(&e.to_string())));
    let base = headers.next().ok_or_else(|| bad("empty"))??;
    let mut chain = if base_height == 0 {
        let chain = HeaderChain::new(network);
        if chain.tip().header != base {
            return Err(bad("genesis mismatch"));
        }
        chain
    } else {
        HeaderChain::from_checkpoint(network, Checkpoint { height: base_height, header: base })
    };
    for header in headers {
        match chain.connect(header?) {
            Ok(Connected::Extended { .. }) => {}
            Ok(other) => return Err(bad(&format!("unexpected {other:?}"))),
            Err(e) => return Err(bad(&e.to_string())),
        }
    }
    Ok(chain)
}

pub fn save(chain: &HeaderChain, path: &Path) -> Result<()> { write_atomic(path, &encode(chain)) }

/// `Ok(None)` when no store exists yet.
pub fn load(path: &Path, network: Network) -> Result<Option<HeaderChain>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path).map_err(|e| WalletError::storage("header store read", e))?;
    decode(&bytes, network).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::extend;
    use tempfile::TempDir;

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.spvchain");
        let mut chain = HeaderChain::new(Network::Regtest);
        let genesis = chain.tip().header;
        extend(&mut chain, &genesis, 12, 0);
        save(&chain, &path).unwrap();
        let loaded = load(&path, Network::Regtest).unwrap().unwrap();
        assert_eq!(loaded.height(), 12);
        assert_eq!(loaded.tip().hash, chain.tip().hash);
        assert_eq!(loaded.tip().chain_work, chain.tip().chain_work);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load(&dir.path().join("none"), Network::Regtest).unwrap().is_none());
    }

    #[test]
    fn wrong_network_or_truncation_rejected() {
        let mut chain = HeaderChain::new(Network::Regtest);
        let genesis = chain.tip().header;
        extend(&mut chain, &genesis, 2, 0);
        let bytes = encode(&chain);
        assert!(decode(&bytes, Network::Testnet).is_err());
        assert!(decode(&bytes[..bytes.len() - 1], Network::Regtest).is_err());
    }

    #[test]
    fn checkpoint_base_survives() {
        let mut full = HeaderChain::new(Network::Regtest);
        let genesis = full.tip().header;
        let hs = extend(&mut full, &genesis, 6, 0);
        let mut cp = HeaderChain::from_checkpoint(Network::Regtest, Checkpoint { height: 3, header: hs[2] });
        extend(&mut cp, &hs[2], 2, 1);
        let back = decode(&encode(&cp), Network::Regtest).unwrap();
        assert_eq!(back.base_height(), 3);
        assert_eq!(back.height(), 5);
    }
}
