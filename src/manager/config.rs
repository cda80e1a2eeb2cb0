//! Manager configuration - set before `initialize`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::Network;

use crate::chain::Checkpoint;
use crate::error::{Result, WalletError};
use crate::keystore::crypto::KdfParams;
use crate::net::addrman::dns_seeds;
use crate::net::Timeouts;
use crate::wallet::WalletSettings;

/// Manager configuration. The host constructs this.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub app_name: String,
    /// Optional subdirectory under the platform data dir, e.g. a bundle id.
    pub support_id: Option<String>,
    pub network: Network,
    /// Overrides `BEESPV_ROOT` and the platform default.
    pub data_dir: Option<PathBuf>,
    pub disable_listening: bool,
    /// Start the header chain here instead of genesis.
    pub checkpoint: Option<Checkpoint>,
    /// sat/vB
    pub fee_rate: u64,
    pub min_depth: u32,
    pub max_peers: usize,
    pub connect_timeout: Duration,
    pub timeouts: Timeouts,
    pub peers: Vec<SocketAddr>,
    /// `None` uses the network's well-known seeds.
    pub dns_seeds: Option<Vec<String>>,
    pub kdf: KdfParams,
    /// Unconfirmed sends older than this release their inputs.
    pub reservation_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            app_name: "beespv".into(),
            support_id: None,
            network: Network::Bitcoin,
            data_dir: None,
            disable_listening: false,
            checkpoint: None,
            fee_rate: 5,
            min_depth: 6,
            max_peers: 4,
            connect_timeout: Duration::from_secs(10),
            timeouts: Timeouts::default(),
            peers: Vec::new(),
            dns_seeds: None,
            kdf: KdfParams::default(),
            reservation_timeout: Duration::from_secs(24 * 3600),
        }
    }
}

impl ManagerConfig {
    pub fn new(app: impl Into<String>) -> Self { Self { app_name: app.into(), ..Default::default() } }
    pub fn with_network(mut self, network: Network) -> Self { self.network = network; self }
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self { self.data_dir = Some(path.into()); self }
    pub fn with_support_id(mut self, id: impl Into<String>) -> Self { self.support_id = Some(id.into()); self }
    pub fn disable_listening(mut self) -> Self { self.disable_listening = true; self }
    pub fn with_checkpoint(mut self, cp: Checkpoint) -> Self { self.checkpoint = Some(cp); self }
    pub fn with_fee_rate(mut self, sat_per_vb: u64) -> Self { self.fee_rate = sat_per_vb; self }
    pub fn with_min_depth(mut self, depth: u32) -> Self { self.min_depth = depth; self }
    pub fn with_max_peers(mut self, n: usize) -> Self { self.max_peers = n.max(1); self }
    pub fn with_timeouts(mut self, t: Timeouts) -> Self { self.timeouts = t; self }
    pub fn with_peer(mut self, addr: SocketAddr) -> Self { self.peers.push(addr); self }
    pub fn with_dns_seeds(mut self, seeds: Vec<String>) -> Self { self.dns_seeds = Some(seeds); self }
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self { self.kdf = kdf; self }
    pub fn with_reservation_timeout(mut self, t: Duration) -> Self { self.reservation_timeout = t; self }

    pub fn wallet_settings(&self) -> WalletSettings {
        WalletSettings::new(self.network).with_kdf(self.kdf).with_min_depth(self.min_depth).with_fee_rate(self.fee_rate)
    }

    pub fn seeds(&self) -> Vec<String> {
        match &self.dns_seeds {
            Some(s) => s.clone(),
            None => dns_seeds(self.network).iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Accepts `main`/`test` alongside the canonical network names.
pub fn parse_network(value: &str) -> Result<Network> {
    match value.trim().to_ascii_lowercase().as_str() {
        "main" | "mainnet" => Ok(Network::Bitcoin),
        "test" | "testnet3" => Ok(Network::Testnet),
        other => Network::from_str(other).map_err(|_| WalletError::Unknown(format!("unknown network: {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_defaults() {
        let c = ManagerConfig::new("app").with_network(Network::Regtest).with_min_depth(1).with_max_peers(0);
        assert_eq!(c.app_name, "app");
        assert_eq!(c.max_peers, 1);
        assert!(c.seeds().is_empty());
        assert_eq!(c.wallet_settings().min_depth, 1);
        assert!(!ManagerConfig::default().seeds().is_empty());
    }

    #[test]
    fn network_names() {
        assert_eq!(parse_network("main").unwrap(), Network::Bitcoin);
        assert_eq!(parse_network("test").unwrap(), Network::Testnet);
        assert_eq!(parse_network("regtest").unwrap(), Network::Regtest);
        assert!(parse_network("moon").is_err());
    }
}
